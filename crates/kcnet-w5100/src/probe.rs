//! Host reachability checks standing in for ICMP echo, plus the table of probes in flight.
//!
//! Unprivileged processes cannot send ICMP, so an echo request from a raw socket is answered by
//! racing two TCP-level checks against the target instead.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, Either, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const HTTP_PORT: u16 = 80;
pub const ECHO_PORT: u16 = 7;

pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a finished probe waits for a raw socket to pick up its result.
pub const COMPLETED_PROBE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    /// No answer within the timeout.
    Unreachable,
    /// The host or network was reported unreachable.
    Error,
}

pub trait Reachability: Send + Sync + 'static {
    fn probe(&self, target: Ipv4Addr, timeout: Duration) -> BoxFuture<'static, ProbeOutcome>;
}

/// Probes real hosts with an HTTP request on port 80 raced against a connect to the echo port.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl Reachability for HostProbe {
    fn probe(&self, target: Ipv4Addr, timeout: Duration) -> BoxFuture<'static, ProbeOutcome> {
        async move {
            let http = http_check(SocketAddrV4::new(target, HTTP_PORT), timeout).boxed();
            let echo = connect_check(SocketAddrV4::new(target, ECHO_PORT), timeout).boxed();
            match future::select(http, echo).await {
                Either::Left((ProbeOutcome::Reachable, _))
                | Either::Right((ProbeOutcome::Reachable, _)) => ProbeOutcome::Reachable,
                Either::Left((first, rest)) | Either::Right((first, rest)) => {
                    combine(first, rest.await)
                }
            }
        }
        .boxed()
    }
}

fn combine(a: ProbeOutcome, b: ProbeOutcome) -> ProbeOutcome {
    match (a, b) {
        (ProbeOutcome::Reachable, _) | (_, ProbeOutcome::Reachable) => ProbeOutcome::Reachable,
        (ProbeOutcome::Error, _) | (_, ProbeOutcome::Error) => ProbeOutcome::Error,
        _ => ProbeOutcome::Unreachable,
    }
}

/// Any byte of response, or an orderly close after connecting, proves the host is up.
async fn http_check(addr: SocketAddrV4, timeout: Duration) -> ProbeOutcome {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(format!("GET / HTTP/1.0\r\nHost: {}\r\n\r\n", addr.ip()).as_bytes())
            .await?;
        let mut byte = [0u8; 1];
        stream.read(&mut byte).await?;
        Ok::<_, io::Error>(())
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => ProbeOutcome::Reachable,
        Ok(Err(err)) => classify(&err),
        Err(_) => ProbeOutcome::Unreachable,
    }
}

async fn connect_check(addr: SocketAddrV4, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => ProbeOutcome::Reachable,
        Ok(Err(err)) => classify(&err),
        Err(_) => ProbeOutcome::Unreachable,
    }
}

/// A refused or reset connection still came from a live host.
fn classify(err: &io::Error) -> ProbeOutcome {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => ProbeOutcome::Reachable,
        io::ErrorKind::TimedOut => ProbeOutcome::Unreachable,
        _ => ProbeOutcome::Error,
    }
}

#[derive(Debug)]
struct PendingProbe {
    id: u64,
    target: Ipv4Addr,
    payload: Vec<u8>,
    completed: Option<(ProbeOutcome, Instant)>,
}

/// Echo requests waiting for their probe, and finished probes waiting for a raw socket.
#[derive(Debug, Default)]
pub(crate) struct ProbeTable {
    next_id: u64,
    entries: Vec<PendingProbe>,
}

impl ProbeTable {
    pub(crate) fn insert(&mut self, target: Ipv4Addr, payload: Vec<u8>) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push(PendingProbe {
            id,
            target,
            payload,
            completed: None,
        });
        id
    }

    pub(crate) fn complete(&mut self, id: u64, outcome: ProbeOutcome, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.completed = Some((outcome, now));
        }
    }

    /// Removes finished probes for `target`. Unreachable results are discarded; the first
    /// reachable or error result is returned with its original payload.
    pub(crate) fn take_completed(
        &mut self,
        target: Ipv4Addr,
        now: Instant,
    ) -> Option<(ProbeOutcome, Vec<u8>)> {
        self.entries.retain(|e| match e.completed {
            Some((_, at)) => now.saturating_duration_since(at) <= COMPLETED_PROBE_TTL,
            None => true,
        });

        while let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.target == target && e.completed.is_some())
        {
            let entry = self.entries.remove(idx);
            match entry.completed {
                Some((ProbeOutcome::Unreachable, _)) | None => continue,
                Some((outcome, _)) => return Some((outcome, entry.payload)),
            }
        }
        None
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Standard internet checksum (RFC 1071) over `data`.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Turns the guest's echo request into the reply it would have received.
pub(crate) fn build_icmp_reply(outcome: ProbeOutcome, mut packet: Vec<u8>) -> Vec<u8> {
    const ECHO_REPLY: u8 = 0;
    const DEST_UNREACHABLE: u8 = 3;

    if packet.len() < 4 {
        return packet;
    }
    packet[0] = match outcome {
        ProbeOutcome::Error => DEST_UNREACHABLE,
        _ => ECHO_REPLY,
    };
    packet[1] = 0;
    packet[2] = 0;
    packet[3] = 0;
    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn checksum_matches_rfc1071_example() {
        let data = [0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7];
        assert_eq!(internet_checksum(&data), !0xDDF2u16);
    }

    #[test]
    fn reply_checksum_verifies_to_zero() {
        let request = vec![8, 0, 0xAB, 0xCD, 0x12, 0x34, 0x00, 0x01, b'h', b'i', b'!'];
        let reply = build_icmp_reply(ProbeOutcome::Reachable, request);
        assert_eq!(reply[0], 0);
        assert_eq!(internet_checksum(&reply), 0);

        let unreachable = build_icmp_reply(ProbeOutcome::Error, vec![8, 0, 0, 0, 1, 2]);
        assert_eq!(unreachable[0], 3);
    }

    #[test]
    fn table_matches_target_and_drops_unreachable() {
        let mut table = ProbeTable::default();
        let now = Instant::now();
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);

        let lost = table.insert(a, vec![1]);
        let found = table.insert(a, vec![2]);
        let other = table.insert(b, vec![3]);
        let pending = table.insert(a, vec![4]);

        assert!(table.take_completed(a, now).is_none());

        table.complete(lost, ProbeOutcome::Unreachable, now);
        table.complete(found, ProbeOutcome::Reachable, now);
        table.complete(other, ProbeOutcome::Error, now);

        assert_eq!(
            table.take_completed(a, now),
            Some((ProbeOutcome::Reachable, vec![2]))
        );
        assert!(table.take_completed(a, now).is_none());

        table.complete(pending, ProbeOutcome::Reachable, now);
        let late = now + COMPLETED_PROBE_TTL + Duration::from_secs(1);
        assert!(table.take_completed(a, late).is_none());
        assert!(table.take_completed(b, late).is_none());
    }

    #[tokio::test]
    async fn host_probe_sees_a_local_listener() {
        // Only the echo-port leg can be pointed at an arbitrary port, so exercise the helpers
        // directly against loopback.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };
        assert_eq!(
            connect_check(addr, Duration::from_secs(1)).await,
            ProbeOutcome::Reachable
        );
        drop(listener);
        // Refused still means the host answered.
        assert_eq!(
            connect_check(addr, Duration::from_secs(1)).await,
            ProbeOutcome::Reachable
        );
    }
}
