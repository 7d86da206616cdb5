use core::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::message::{
    ipv4_at, ClientMessage, CHADDR, CIADDR, DHCP_MSG_ACK, DHCP_MSG_DISCOVER, DHCP_MSG_OFFER,
    DHCP_MSG_REQUEST, FILE_LEN, FLAGS, GIADDR, MAGIC_COOKIE, OPT_DEFAULT_IP_TTL,
    OPT_DEFAULT_TCP_TTL, OPT_DNS_SERVER, OPT_END, OPT_LEASE_TIME, OPT_MESSAGE_TYPE,
    OPT_REBINDING_TIME, OPT_RENEWAL_TIME, OPT_SERVER_ID, OPT_SUBNET_MASK, OP_BOOTREPLY,
    REPLY_MESSAGE_TYPE_OFFSET, SIADDR, SNAME_LEN, XID,
};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// How long an exchange waits for the client's REQUEST after the OFFER was built, and for the
/// ACK to be taken after the REQUEST arrived.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(1000);

const SERVER_NAME: &[u8] = b"kcnet-dhcp-server";
const LEASE_SECS: u32 = 86_400;
const RENEWAL_SECS: u32 = 43_200;
const REBINDING_SECS: u32 = 75_600;
const DEFAULT_TTL: u8 = 64;

/// The host-side addresses handed out as the guest's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSource {
    pub client_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub dns_server: Option<Ipv4Addr>,
}

impl LeaseSource {
    /// Address of the simulated server: the client's subnet with host part 99 (111 if the client
    /// already owns .99).
    pub fn server_ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.client_ip.octets();
        Ipv4Addr::new(a, b, c, if d == 99 { 111 } else { 99 })
    }
}

/// A frame ready to be delivered to the client as if sent from `server_ip:67`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpAnswer {
    pub server_ip: Ipv4Addr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Offered,
    Acknowledged,
    Ignored,
}

#[derive(Debug)]
struct Exchange {
    server_ip: Ipv4Addr,
    answer: Vec<u8>,
    started: Instant,
    answer_ready: bool,
    request_received: bool,
    finished: bool,
}

impl Exchange {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) > EXCHANGE_TIMEOUT
    }
}

/// Server side of a single DISCOVER → OFFER → REQUEST → ACK exchange.
///
/// At most one exchange is outstanding. It ends when its ACK has been taken or when
/// [`EXCHANGE_TIMEOUT`] elapses without the next step of the exchange.
#[derive(Debug, Default)]
pub struct DhcpResponder {
    exchange: Option<Exchange>,
}

impl DhcpResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a frame the guest sent towards `dst_port`.
    ///
    /// `lease` is only consulted for a DISCOVER; without it no OFFER can be built.
    pub fn handle_client_message(
        &mut self,
        dst_port: u16,
        frame: &[u8],
        lease: Option<&LeaseSource>,
        now: Instant,
    ) -> Handled {
        self.expire(now);
        if dst_port != SERVER_PORT {
            return Handled::Ignored;
        }
        let msg = match ClientMessage::parse(frame) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("ignoring dhcp frame: {err}");
                return Handled::Ignored;
            }
        };

        match self.exchange.as_mut() {
            None => {
                if msg.message_type != DHCP_MSG_DISCOVER {
                    return Handled::Ignored;
                }
                let Some(lease) = lease else {
                    debug!("dhcp discover without a host lease source");
                    return Handled::Ignored;
                };
                let server_ip = lease.server_ip();
                debug!(
                    xid = format_args!("{:#010x}", msg.xid()),
                    offered = %lease.client_ip,
                    server = %server_ip,
                    "dhcp offer"
                );
                self.exchange = Some(Exchange {
                    server_ip,
                    answer: build_offer(&msg, lease, server_ip),
                    started: now,
                    answer_ready: true,
                    request_received: false,
                    finished: false,
                });
                Handled::Offered
            }
            Some(exchange) => {
                if msg.message_type != DHCP_MSG_REQUEST || !request_matches(&msg, &exchange.answer)
                {
                    return Handled::Ignored;
                }
                let raw = msg.raw;
                exchange.answer[FLAGS.start..CIADDR.end]
                    .copy_from_slice(&raw[FLAGS.start..CIADDR.end]);
                exchange.answer[GIADDR].copy_from_slice(&raw[GIADDR]);
                exchange.answer[REPLY_MESSAGE_TYPE_OFFSET] = DHCP_MSG_ACK;
                exchange.request_received = true;
                exchange.answer_ready = true;
                exchange.started = now;
                debug!(xid = format_args!("{:#010x}", msg.xid()), "dhcp ack");
                Handled::Acknowledged
            }
        }
    }

    /// Removes the frame that is ready for delivery, if any. Taking the ACK ends the exchange.
    pub fn take_answer(&mut self, now: Instant) -> Option<DhcpAnswer> {
        self.expire(now);
        let exchange = self.exchange.as_mut()?;
        if !exchange.answer_ready {
            return None;
        }
        exchange.answer_ready = false;
        let answer = DhcpAnswer {
            server_ip: exchange.server_ip,
            payload: exchange.answer.clone(),
        };
        if exchange.request_received {
            exchange.finished = true;
            self.exchange = None;
        }
        Some(answer)
    }

    /// Length of the frame waiting for delivery. Callers with limited room check this before
    /// [`take_answer`](Self::take_answer) so the answer stays queued until it fits.
    pub fn answer_len(&self) -> Option<usize> {
        self.exchange
            .as_ref()
            .filter(|ex| ex.answer_ready)
            .map(|ex| ex.answer.len())
    }

    #[cfg(test)]
    fn has_answer(&self) -> bool {
        self.answer_len().is_some()
    }

    /// Server address of the outstanding exchange.
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        self.exchange.as_ref().map(|ex| ex.server_ip)
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.exchange.is_none()
    }

    pub fn clear(&mut self) {
        self.exchange = None;
    }

    fn expire(&mut self, now: Instant) {
        if self
            .exchange
            .as_ref()
            .is_some_and(|ex| ex.finished || ex.expired(now))
        {
            debug!("dhcp exchange expired");
            self.exchange = None;
        }
    }
}

fn request_matches(msg: &ClientMessage<'_>, answer: &[u8]) -> bool {
    msg.raw[XID] == answer[XID]
        && msg.server_id() == ipv4_at(answer, SIADDR.start)
        && msg.chaddr() == &answer[CHADDR]
}

fn build_offer(msg: &ClientMessage<'_>, lease: &LeaseSource, server_ip: Ipv4Addr) -> Vec<u8> {
    let raw = msg.raw;
    let mut out = Vec::with_capacity(0x400);

    out.push(OP_BOOTREPLY);
    out.extend_from_slice(&raw[1..3]); // htype, hlen
    out.push(0); // hops
    out.extend_from_slice(&raw[XID]);
    out.extend_from_slice(&[0, 0]); // secs
    out.extend_from_slice(&raw[FLAGS]);
    out.extend_from_slice(&[0; 4]); // ciaddr
    out.extend_from_slice(&lease.client_ip.octets());
    out.extend_from_slice(&server_ip.octets());
    out.extend_from_slice(&raw[GIADDR.start..CHADDR.end]);

    out.extend_from_slice(SERVER_NAME);
    out.resize(out.len() + SNAME_LEN - SERVER_NAME.len(), 0);
    out.resize(out.len() + FILE_LEN, 0);

    out.extend_from_slice(&MAGIC_COOKIE);
    out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, DHCP_MSG_OFFER]);
    push_option(&mut out, OPT_SERVER_ID, &server_ip.octets());
    push_option(&mut out, OPT_LEASE_TIME, &LEASE_SECS.to_be_bytes());
    push_option(&mut out, OPT_RENEWAL_TIME, &RENEWAL_SECS.to_be_bytes());
    push_option(&mut out, OPT_REBINDING_TIME, &REBINDING_SECS.to_be_bytes());
    push_option(&mut out, OPT_SUBNET_MASK, &lease.subnet_mask.octets());
    if let Some(dns) = lease.dns_server {
        push_option(&mut out, OPT_DNS_SERVER, &dns.octets());
    }
    for &param in msg.requested_params() {
        if matches!(param, OPT_DEFAULT_IP_TTL | OPT_DEFAULT_TCP_TTL) {
            push_option(&mut out, param, &[DEFAULT_TTL]);
        }
    }
    out.push(OPT_END);
    out
}

fn push_option(out: &mut Vec<u8>, code: u8, value: &[u8]) {
    out.push(code);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}
