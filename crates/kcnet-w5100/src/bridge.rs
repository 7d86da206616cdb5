//! Host sockets behind the emulated ones.
//!
//! Every blocking primitive here is `async` and cancel-safe: the worker races it against the
//! socket's [`CancellationToken`] so a CLOSE or reset unblocks it immediately.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BridgeError;
use crate::timeouts::timeout_opt;

const LISTEN_BACKLOG: u32 = 1;

/// The host object currently standing behind one emulated socket.
#[derive(Debug, Clone, Default)]
pub(crate) enum HostHandle {
    #[default]
    None,
    Tcp(Arc<TcpStream>),
    Listener(Arc<TcpListener>),
    Udp(Arc<UdpSocket>),
}

impl HostHandle {
    pub(crate) fn tcp(&self) -> Option<Arc<TcpStream>> {
        match self {
            Self::Tcp(stream) => Some(Arc::clone(stream)),
            _ => None,
        }
    }

    pub(crate) fn udp(&self) -> Option<Arc<UdpSocket>> {
        match self {
            Self::Udp(socket) => Some(Arc::clone(socket)),
            _ => None,
        }
    }
}

/// Runs `fut` unless `token` fires first.
pub(crate) async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(BridgeError::Cancelled),
        res = fut => res,
    }
}

pub(crate) async fn connect_tcp(
    addr: SocketAddrV4,
    timeout: Option<Duration>,
) -> Result<TcpStream, BridgeError> {
    let stream = timeout_opt(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
    stream.set_nodelay(true)?;
    debug!(%addr, "tcp connected");
    Ok(stream)
}

pub(crate) fn listen_tcp(port: u16) -> Result<TcpListener, BridgeError> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    debug!(port, "tcp listening");
    Ok(listener)
}

pub(crate) async fn accept_tcp(
    listener: &TcpListener,
) -> Result<(TcpStream, SocketAddrV4), BridgeError> {
    let (stream, peer) = listener.accept().await?;
    let SocketAddr::V4(peer) = peer else {
        return Err(BridgeError::Unsupported("IPv6 peer"));
    };
    stream.set_nodelay(true)?;
    debug!(%peer, "tcp accepted");
    Ok((stream, peer))
}

/// How a UDP socket should be bound on OPEN.
#[derive(Debug)]
pub(crate) enum UdpBinding {
    /// Hand over a socket that was bound earlier by the reservation pool.
    Reserved(std::net::UdpSocket),
    Port(u16),
    Multicast { port: u16, group: Ipv4Addr, ttl: u8 },
}

pub(crate) async fn open_udp(binding: UdpBinding) -> Result<UdpSocket, BridgeError> {
    let socket = match binding {
        UdpBinding::Reserved(socket) => {
            socket.set_nonblocking(true)?;
            UdpSocket::from_std(socket)?
        }
        UdpBinding::Port(port) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?,
        UdpBinding::Multicast { port, group, ttl } => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
            socket.set_multicast_ttl_v4(u32::from(ttl))?;
            socket
        }
    };
    socket.set_broadcast(true)?;
    debug!(local = ?socket.local_addr().ok(), "udp bound");
    Ok(socket)
}

/// Writes all of `data`, sharing the stream with a concurrent reader.
pub(crate) async fn write_all(stream: &TcpStream, mut data: &[u8]) -> Result<(), BridgeError> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub(crate) async fn send_datagram(
    socket: &UdpSocket,
    data: &[u8],
    dst: SocketAddrV4,
) -> Result<(), BridgeError> {
    let sent = socket.send_to(data, dst).await?;
    if sent != data.len() {
        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
    }
    Ok(())
}

/// A datagram to our own address only reaches someone if the port is one we handed out.
pub(crate) fn check_self_loopback(
    dst: SocketAddrV4,
    own_ip: Ipv4Addr,
    reservations: &PortReservations,
) -> Result<(), BridgeError> {
    if *dst.ip() == own_ip && !reservations.is_reserved(dst.port()) {
        return Err(BridgeError::SelfLoopback(dst));
    }
    Ok(())
}

#[derive(Debug)]
struct Reservation {
    port: u16,
    socket: Option<std::net::UdpSocket>,
}

/// Ports handed to the guest ahead of time. Each is held by a bound host socket so nobody else
/// grabs it; OPEN on that port takes the socket over.
#[derive(Debug, Default)]
pub(crate) struct PortReservations {
    entries: Vec<Reservation>,
}

impl PortReservations {
    pub(crate) fn reserve(&mut self) -> io::Result<u16> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = socket.local_addr()?.port();
        self.entries.push(Reservation {
            port,
            socket: Some(socket),
        });
        Ok(port)
    }

    /// Still true after the socket was taken over, until the next release.
    pub(crate) fn is_reserved(&self, port: u16) -> bool {
        self.entries.iter().any(|r| r.port == port)
    }

    pub(crate) fn take(&mut self, port: u16) -> Option<std::net::UdpSocket> {
        self.entries
            .iter_mut()
            .find(|r| r.port == port)
            .and_then(|r| r.socket.take())
    }

    /// Closes the held socket so the port can be bound normally.
    pub(crate) fn discard(&mut self, port: u16) {
        if let Some(reservation) = self.entries.iter_mut().find(|r| r.port == port) {
            reservation.socket = None;
        }
    }

    pub(crate) fn release_all(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "releasing reserved ports");
        }
        self.entries.clear();
    }
}
