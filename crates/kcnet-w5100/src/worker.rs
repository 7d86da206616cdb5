//! The two long-lived tasks behind each socket.
//!
//! The control task executes one [`Job`] at a time. The receive task moves inbound data into the
//! RX ring while receive is armed. Both only touch chip state under the chip lock, and every
//! commit first checks that the token captured when the work started is still live: a CLOSE or
//! reset that happened in between turns the result into a no-op.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kcnet_dhcp::{LeaseSource, CLIENT_PORT, SERVER_PORT};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::{
    accept_tcp, cancellable, check_self_loopback, connect_tcp, listen_tcp, open_udp,
    send_datagram, write_all, HostHandle, UdpBinding,
};
use crate::chip::{Chip, Job};
use crate::config::AddressPlan;
use crate::device::Shared;
use crate::error::BridgeError;
use crate::probe::{build_icmp_reply, MIN_PROBE_TIMEOUT};
use crate::regs::{Command, SocketInterrupt, SocketStatus, IPPROTO_ICMP, SN_MR_MULTICAST};
use crate::timeouts::timeout_opt;

/// Upper bound on how long an idle receive task sleeps before re-checking its socket.
const PARK_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Source IP, source port and payload length in front of every UDP datagram.
const UDP_HEADER_LEN: usize = 8;
/// Source IP and payload length in front of every raw IP packet.
const IPRAW_HEADER_LEN: usize = 6;

const ICMP_ECHO_REQUEST: u8 = 8;
const MAX_DATAGRAM: usize = 65_536;

pub(crate) async fn control_task(
    shared: Arc<Shared>,
    n: usize,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = jobs.recv().await {
        if job.token.is_cancelled() {
            continue;
        }
        let Job {
            command,
            token,
            closing,
        } = job;

        match command {
            Command::Open => open(&shared, n, &token).await,
            Command::Listen => listen(&shared, n, &token).await,
            Command::Connect => connect(&shared, n, &token).await,
            Command::Send => send(&shared, n, &token).await,
            Command::Discon | Command::Close => {
                drop(closing);
                let mut chip = shared.chip();
                if !token.is_cancelled() && chip.socket(n).status == SocketStatus::Closing {
                    chip.set_status(n, SocketStatus::Closed);
                    if command == Command::Discon {
                        chip.raise(n, SocketInterrupt::DISCON);
                    }
                }
            }
            Command::SendMac | Command::SendKeep | Command::Recv => {}
        }

        let mut chip = shared.chip();
        if !token.is_cancelled() {
            chip.finish_command(n, command);
        }
    }
}

async fn open(shared: &Arc<Shared>, n: usize, token: &CancellationToken) {
    let (port, mode, dest, ttl) = {
        let chip = shared.chip();
        (
            chip.source_port(n),
            chip.mode(n),
            chip.destination(n),
            chip.ttl(n),
        )
    };

    let (binding, bound_port) = if mode & SN_MR_MULTICAST != 0 {
        shared.reservations().discard(dest.port());
        let binding = UdpBinding::Multicast {
            port: dest.port(),
            group: *dest.ip(),
            ttl,
        };
        (binding, dest.port())
    } else if port == 0 {
        // Bound lazily by the first SEND.
        return;
    } else {
        let reserved = shared.reservations().take(port);
        match reserved {
            Some(socket) => (UdpBinding::Reserved(socket), port),
            None => (UdpBinding::Port(port), port),
        }
    };

    match cancellable(token, open_udp(binding)).await {
        Ok(socket) => {
            let mut chip = shared.chip();
            if token.is_cancelled() {
                return;
            }
            let state = chip.socket_mut(n);
            state.host = HostHandle::Udp(Arc::new(socket));
            state.recv_enabled = true;
            drop(chip);
            shared.wakes[n].notify_one();
        }
        Err(BridgeError::Cancelled) => {}
        Err(err) => {
            debug!(socket = n, port = bound_port, %err, "udp bind failed");
            shared.note_failure(n, bound_port, &err);
            let mut chip = shared.chip();
            if token.is_cancelled() {
                return;
            }
            if bound_port == CLIENT_PORT {
                // Auto-configuration still works through the built-in responder.
                let state = chip.socket_mut(n);
                state.dhcp_only = true;
                state.recv_enabled = true;
                drop(chip);
                shared.wakes[n].notify_one();
            } else {
                chip.abandon(n);
            }
        }
    }
}

async fn listen(shared: &Arc<Shared>, n: usize, token: &CancellationToken) {
    let port = shared.chip().source_port(n);
    let listener = match listen_tcp(port) {
        Ok(listener) => Arc::new(listener),
        Err(err) => return listen_failed(shared, n, port, token, &err),
    };
    {
        let mut chip = shared.chip();
        if token.is_cancelled() {
            return;
        }
        chip.socket_mut(n).host = HostHandle::Listener(Arc::clone(&listener));
    }

    match cancellable(token, accept_tcp(&listener)).await {
        Ok((stream, peer)) => {
            let mut chip = shared.chip();
            if token.is_cancelled() {
                return;
            }
            chip.set_destination(n, peer);
            established(&mut chip, n, HostHandle::Tcp(Arc::new(stream)));
            drop(chip);
            shared.wakes[n].notify_one();
        }
        Err(BridgeError::Cancelled) => {}
        Err(err) => listen_failed(shared, n, port, token, &err),
    }
}

fn listen_failed(
    shared: &Shared,
    n: usize,
    port: u16,
    token: &CancellationToken,
    err: &BridgeError,
) {
    debug!(socket = n, port, %err, "listen failed");
    shared.note_failure(n, port, err);
    let mut chip = shared.chip();
    if token.is_cancelled() || chip.command_register(n) != Command::Listen as u8 {
        return;
    }
    chip.raise(n, SocketInterrupt::TIMEOUT);
    chip.socket_mut(n).host = HostHandle::None;
    chip.set_status(n, SocketStatus::Closed);
}

fn established(chip: &mut Chip, n: usize, host: HostHandle) {
    let state = chip.socket_mut(n);
    state.host = host;
    state.recv_enabled = true;
    chip.set_status(n, SocketStatus::Established);
    chip.raise(n, SocketInterrupt::CON);
}

async fn connect(shared: &Arc<Shared>, n: usize, token: &CancellationToken) {
    let (dest, timeout) = {
        let chip = shared.chip();
        (chip.destination(n), chip.retry_timeout())
    };
    match cancellable(token, connect_tcp(dest, timeout)).await {
        Ok(stream) => {
            let mut chip = shared.chip();
            if token.is_cancelled() {
                return;
            }
            established(&mut chip, n, HostHandle::Tcp(Arc::new(stream)));
            drop(chip);
            shared.wakes[n].notify_one();
        }
        Err(BridgeError::Cancelled) => {}
        Err(err) => {
            debug!(socket = n, %dest, %err, "connect failed");
            let mut chip = shared.chip();
            if !token.is_cancelled() {
                chip.raise(n, SocketInterrupt::TIMEOUT);
            }
        }
    }
}

async fn send(shared: &Arc<Shared>, n: usize, token: &CancellationToken) {
    let (data, wr, status) = {
        let chip = shared.chip();
        let (data, wr) = chip.tx_pending(n);
        (data, wr, chip.socket(n).status)
    };

    let result = if data.is_empty() {
        Ok(())
    } else {
        match status {
            SocketStatus::Established => send_tcp(shared, n, token, &data).await,
            SocketStatus::Udp => send_udp(shared, n, token, &data).await,
            SocketStatus::IpRaw => send_ipraw(shared, n, data).await,
            _ => Err(BridgeError::NotConnected),
        }
    };

    if let Err(err) = &result {
        if matches!(err, BridgeError::Cancelled) {
            return;
        }
        debug!(socket = n, ?status, %err, "send failed");
        let port = shared.chip().source_port(n);
        shared.note_failure(n, port, err);
    }
    let mut chip = shared.chip();
    if !token.is_cancelled() {
        chip.finish_send(n, wr, result.is_ok());
    }
}

async fn send_tcp(
    shared: &Shared,
    n: usize,
    token: &CancellationToken,
    data: &[u8],
) -> Result<(), BridgeError> {
    let (stream, timeout) = {
        let chip = shared.chip();
        (chip.socket(n).host.tcp(), chip.retry_timeout())
    };
    let stream = stream.ok_or(BridgeError::NotConnected)?;
    cancellable(token, timeout_opt(timeout, write_all(&stream, data))).await
}

pub(crate) fn lease_source(plan: &AddressPlan) -> Option<LeaseSource> {
    (!plan.ip.is_unspecified()).then_some(LeaseSource {
        client_ip: plan.ip,
        subnet_mask: plan.subnet_mask,
        dns_server: plan.dns_server,
    })
}

async fn send_udp(
    shared: &Shared,
    n: usize,
    token: &CancellationToken,
    data: &[u8],
) -> Result<(), BridgeError> {
    let (dst, own_ip, socket, dhcp_only, timeout, plan) = {
        let chip = shared.chip();
        let state = chip.socket(n);
        (
            chip.destination(n),
            chip.source_ip(),
            state.host.udp(),
            state.dhcp_only,
            chip.retry_timeout(),
            *chip.plan(),
        )
    };

    if dst.port() == SERVER_PORT && deliver_to_responder(shared, dst, data, &plan) {
        return Ok(());
    }
    check_self_loopback(dst, own_ip, &shared.reservations())?;

    let socket = match socket {
        Some(socket) => socket,
        None if dhcp_only => return Err(BridgeError::NotConnected),
        None => {
            let socket = Arc::new(open_udp(UdpBinding::Port(0)).await?);
            let mut chip = shared.chip();
            if token.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            let state = chip.socket_mut(n);
            state.host = HostHandle::Udp(Arc::clone(&socket));
            state.recv_enabled = true;
            drop(chip);
            shared.wakes[n].notify_one();
            socket
        }
    };
    cancellable(token, timeout_opt(timeout, send_datagram(&socket, data, dst))).await
}

/// Hands a frame for the DHCP server port to the built-in responder. Returns false when the
/// destination is a real server the guest talks to directly.
fn deliver_to_responder(shared: &Shared, dst: SocketAddrV4, data: &[u8], plan: &AddressPlan) -> bool {
    let mut dhcp = shared.dhcp();
    if !dst.ip().is_broadcast() && dhcp.server_ip() != Some(*dst.ip()) {
        return false;
    }
    let lease = lease_source(plan);
    let handled = dhcp.handle_client_message(SERVER_PORT, data, lease.as_ref(), Instant::now());
    drop(dhcp);
    debug!(?handled, %dst, "dhcp frame from guest");
    shared.wake_all();
    true
}

async fn send_ipraw(shared: &Arc<Shared>, n: usize, data: Vec<u8>) -> Result<(), BridgeError> {
    let (proto, target, own_ip, ping_block, timeout) = {
        let chip = shared.chip();
        (
            chip.ip_protocol(n),
            *chip.destination(n).ip(),
            chip.source_ip(),
            chip.ping_block(),
            chip.retry_timeout(),
        )
    };
    if proto != IPPROTO_ICMP {
        return Err(BridgeError::Unsupported("raw IP protocol other than ICMP"));
    }
    if data.len() < 4 || data[0] != ICMP_ECHO_REQUEST {
        debug!(socket = n, len = data.len(), "not an echo request, treating as sent");
        return Ok(());
    }
    if target == own_ip && ping_block {
        return Ok(());
    }

    let id = shared.probes().insert(target, data);
    let probe = shared.reachability.probe(
        target,
        timeout.unwrap_or(MIN_PROBE_TIMEOUT).max(MIN_PROBE_TIMEOUT),
    );
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let outcome = probe.await;
        debug!(%target, ?outcome, "reachability probe finished");
        shared.probes().complete(id, outcome, Instant::now());
    });
    Ok(())
}

/// What the receive task needs to know about its socket for one iteration.
struct ReceiveView {
    status: SocketStatus,
    token: CancellationToken,
    host: HostHandle,
    source_port: u16,
    peer: Ipv4Addr,
    free: usize,
    size: usize,
}

pub(crate) async fn receive_task(shared: Arc<Shared>, n: usize) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let view = {
            let chip = shared.chip();
            let state = chip.socket(n);
            if !state.recv_enabled || !state.status.receives() {
                None
            } else {
                Some(ReceiveView {
                    status: state.status,
                    token: state.token.clone(),
                    host: state.host.clone(),
                    source_port: chip.source_port(n),
                    peer: *chip.destination(n).ip(),
                    free: chip.rx_free(n),
                    size: chip.rx_size(n),
                })
            }
        };

        match view {
            None => park(&shared, n).await,
            Some(view) => match view.status {
                SocketStatus::Established => receive_tcp(&shared, n, &view, &mut buf).await,
                SocketStatus::Udp => receive_udp(&shared, n, &view, &mut buf).await,
                SocketStatus::IpRaw => receive_ipraw(&shared, n, &view).await,
                _ => park(&shared, n).await,
            },
        }
    }
}

async fn park(shared: &Shared, n: usize) {
    let _ = tokio::time::timeout(PARK_INTERVAL, shared.wakes[n].notified()).await;
}

async fn receive_tcp(shared: &Shared, n: usize, view: &ReceiveView, buf: &mut [u8]) {
    let Some(stream) = view.host.tcp() else {
        return park(shared, n).await;
    };
    if view.free == 0 {
        return park(shared, n).await;
    }

    let readable = tokio::select! {
        _ = view.token.cancelled() => return,
        _ = shared.wakes[n].notified() => return,
        res = stream.readable() => res,
    };
    let res = match readable {
        Ok(()) => stream.try_read(&mut buf[..view.free]),
        Err(err) => Err(err),
    };

    match res {
        Ok(0) => {
            let mut chip = shared.chip();
            if view.token.is_cancelled() {
                return;
            }
            debug!(socket = n, "remote closed the connection");
            let state = chip.socket_mut(n);
            state.host = HostHandle::None;
            state.recv_enabled = false;
            chip.set_status(n, SocketStatus::CloseWait);
        }
        Ok(len) => {
            let mut chip = shared.chip();
            if !view.token.is_cancelled() {
                chip.commit_rx(n, &[&buf[..len]]);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(err) => {
            debug!(socket = n, %err, "tcp receive failed");
            let mut chip = shared.chip();
            if !view.token.is_cancelled() {
                chip.raise(n, SocketInterrupt::TIMEOUT);
                chip.abandon(n);
            }
        }
    }
}

/// Moves a pending responder answer into the RX ring. An answer that does not fit yet stays
/// with the responder until the guest frees space. Lock order is chip, then dhcp.
fn deliver_dhcp_answer(shared: &Shared, n: usize, view: &ReceiveView) -> bool {
    let mut chip = shared.chip();
    if view.token.is_cancelled() {
        return true;
    }
    let room = chip.rx_free(n).saturating_sub(UDP_HEADER_LEN);
    let mut dhcp = shared.dhcp();
    match dhcp.answer_len() {
        Some(len) if len > room => {
            debug!(socket = n, len, room, "no room for dhcp answer yet");
            return false;
        }
        None => return false,
        Some(_) => {}
    }
    let Some(answer) = dhcp.take_answer(Instant::now()) else {
        return false;
    };
    drop(dhcp);
    let from = SocketAddrV4::new(answer.server_ip, SERVER_PORT);
    let header = udp_header(from, answer.payload.len());
    chip.commit_rx(n, &[&header, &answer.payload]);
    true
}

async fn receive_udp(shared: &Shared, n: usize, view: &ReceiveView, buf: &mut [u8]) {
    if view.free <= UDP_HEADER_LEN {
        return park(shared, n).await;
    }

    if view.source_port == CLIENT_PORT && deliver_dhcp_answer(shared, n, view) {
        return;
    }

    let Some(socket) = view.host.udp() else {
        return park(shared, n).await;
    };
    let received = tokio::select! {
        _ = view.token.cancelled() => return,
        _ = shared.wakes[n].notified() => return,
        res = socket.recv_from(buf) => res,
    };
    let (len, from) = match received {
        Ok(received) => received,
        Err(err) => {
            debug!(socket = n, %err, "udp receive failed");
            return park(shared, n).await;
        }
    };
    let SocketAddr::V4(from) = from else {
        debug!(socket = n, %from, "dropping datagram from non-IPv4 sender");
        return;
    };
    if len == 0 {
        return;
    }
    // Larger datagrams are cut to what fits, as a receive into a short buffer would.
    let len = len.min(view.free - UDP_HEADER_LEN).min(view.size - 1);

    let mut chip = shared.chip();
    if view.token.is_cancelled() {
        return;
    }
    let header = udp_header(from, len);
    chip.commit_rx(n, &[&header, &buf[..len]]);
}

fn udp_header(from: SocketAddrV4, len: usize) -> [u8; UDP_HEADER_LEN] {
    let mut header = [0u8; UDP_HEADER_LEN];
    header[..4].copy_from_slice(&from.ip().octets());
    header[4..6].copy_from_slice(&from.port().to_be_bytes());
    header[6..].copy_from_slice(&(len as u16).to_be_bytes());
    header
}

async fn receive_ipraw(shared: &Shared, n: usize, view: &ReceiveView) {
    let completed = shared.probes().take_completed(view.peer, Instant::now());
    let Some((outcome, payload)) = completed else {
        tokio::select! {
            _ = view.token.cancelled() => {}
            _ = tokio::time::sleep(PROBE_POLL_INTERVAL) => {}
        }
        return;
    };

    let reply = build_icmp_reply(outcome, payload);
    let mut chip = shared.chip();
    if view.token.is_cancelled() {
        return;
    }
    if reply.len() + IPRAW_HEADER_LEN > chip.rx_free(n) {
        debug!(socket = n, len = reply.len(), "no room for echo reply, dropping it");
        return;
    }
    let mut header = [0u8; IPRAW_HEADER_LEN];
    header[..4].copy_from_slice(&view.peer.octets());
    header[4..].copy_from_slice(&(reply.len() as u16).to_be_bytes());
    chip.commit_rx(n, &[&header, &reply]);
}
