//! BOOTP/DHCP wire layout helpers.
//!
//! Only the subset needed to answer a single DISCOVER/REQUEST exchange is modelled. Offsets are
//! relative to the start of the UDP payload.

use core::net::Ipv4Addr;
use core::ops::Range;

use thiserror::Error;

pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;

pub const DHCP_MSG_DISCOVER: u8 = 1;
pub const DHCP_MSG_OFFER: u8 = 2;
pub const DHCP_MSG_REQUEST: u8 = 3;
pub const DHCP_MSG_ACK: u8 = 5;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_DEFAULT_IP_TTL: u8 = 23;
pub const OPT_DEFAULT_TCP_TTL: u8 = 37;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST_LIST: u8 = 55;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_END: u8 = 255;

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const XID: Range<usize> = 4..8;
pub const FLAGS: Range<usize> = 10..12;
pub const CIADDR: Range<usize> = 12..16;
pub const YIADDR: Range<usize> = 16..20;
pub const SIADDR: Range<usize> = 20..24;
pub const GIADDR: Range<usize> = 24..28;
pub const CHADDR: Range<usize> = 28..44;
pub const SNAME_LEN: usize = 64;
pub const FILE_LEN: usize = 128;
pub const COOKIE: Range<usize> = 236..240;
pub const OPTIONS_START: usize = 240;

/// Offset of the message-type value in frames built by this crate (first option after the
/// cookie).
pub const REPLY_MESSAGE_TYPE_OFFSET: usize = OPTIONS_START + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DhcpParseError {
    #[error("frame too short for a BOOTP header with options ({0} bytes)")]
    Truncated(usize),
    #[error("unexpected BOOTP op code {0}")]
    NotARequest(u8),
    #[error("options magic cookie missing")]
    BadCookie,
    #[error("no DHCP message type option")]
    MissingMessageType,
}

/// A client → server message that passed the header, cookie and option checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage<'a> {
    pub raw: &'a [u8],
    pub message_type: u8,
    /// Byte offset of a 4-byte `server identifier` option value, if present.
    server_id_offset: Option<usize>,
    param_request_list: Option<Range<usize>>,
}

impl<'a> ClientMessage<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, DhcpParseError> {
        if raw.len() <= OPTIONS_START {
            return Err(DhcpParseError::Truncated(raw.len()));
        }
        if raw[0] != OP_BOOTREQUEST {
            return Err(DhcpParseError::NotARequest(raw[0]));
        }
        if raw[COOKIE] != MAGIC_COOKIE {
            return Err(DhcpParseError::BadCookie);
        }

        let mut message_type = None;
        let mut server_id_offset = None;
        let mut param_request_list = None;

        let mut idx = OPTIONS_START;
        while idx < raw.len() {
            let option = raw[idx];
            idx += 1;
            if option == OPT_END {
                break;
            }
            if option == OPT_PAD || idx >= raw.len() {
                continue;
            }
            let len = raw[idx] as usize;
            idx += 1;
            match option {
                OPT_MESSAGE_TYPE if idx < raw.len() => message_type = Some(raw[idx]),
                OPT_SERVER_ID if len == 4 && idx + 4 <= raw.len() => server_id_offset = Some(idx),
                OPT_PARAM_REQUEST_LIST => {
                    let end = (idx + len).min(raw.len());
                    param_request_list = Some(idx..end);
                }
                _ => {}
            }
            idx += len;
        }

        Ok(Self {
            raw,
            message_type: message_type.ok_or(DhcpParseError::MissingMessageType)?,
            server_id_offset,
            param_request_list,
        })
    }

    pub fn xid(&self) -> u32 {
        u32::from_be_bytes([self.raw[4], self.raw[5], self.raw[6], self.raw[7]])
    }

    pub fn chaddr(&self) -> &'a [u8] {
        &self.raw[CHADDR]
    }

    /// The server the client addresses: `siaddr` when set, otherwise option 54.
    pub fn server_id(&self) -> Ipv4Addr {
        let siaddr = ipv4_at(self.raw, SIADDR.start);
        match self.server_id_offset {
            Some(offset) if siaddr.is_unspecified() => ipv4_at(self.raw, offset),
            _ => siaddr,
        }
    }

    pub fn requested_params(&self) -> &'a [u8] {
        match &self.param_request_list {
            Some(range) => &self.raw[range.clone()],
            None => &[],
        }
    }
}

pub(crate) fn ipv4_at(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_options(options: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; OPTIONS_START];
        out[0] = OP_BOOTREQUEST;
        out[COOKIE].copy_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(options);
        out
    }

    #[test]
    fn parse_skips_pad_and_stops_at_end() {
        let frame = request_with_options(&[
            OPT_PAD,
            OPT_PAD,
            OPT_MESSAGE_TYPE,
            1,
            DHCP_MSG_REQUEST,
            OPT_END,
            OPT_MESSAGE_TYPE,
            1,
            DHCP_MSG_DISCOVER,
        ]);
        let msg = ClientMessage::parse(&frame).unwrap();
        assert_eq!(msg.message_type, DHCP_MSG_REQUEST);
    }

    #[test]
    fn parse_rejects_missing_cookie_and_short_frames() {
        let mut frame = request_with_options(&[OPT_MESSAGE_TYPE, 1, DHCP_MSG_DISCOVER, OPT_END]);
        frame[236] = 0;
        assert_eq!(
            ClientMessage::parse(&frame).unwrap_err(),
            DhcpParseError::BadCookie
        );
        assert_eq!(
            ClientMessage::parse(&frame[..240]).unwrap_err(),
            DhcpParseError::Truncated(240)
        );
    }

    #[test]
    fn server_id_prefers_siaddr_over_option() {
        let mut frame = request_with_options(&[
            OPT_MESSAGE_TYPE,
            1,
            DHCP_MSG_REQUEST,
            OPT_SERVER_ID,
            4,
            192,
            168,
            1,
            99,
            OPT_END,
        ]);
        assert_eq!(
            ClientMessage::parse(&frame).unwrap().server_id(),
            Ipv4Addr::new(192, 168, 1, 99)
        );

        frame[SIADDR].copy_from_slice(&[10, 0, 0, 1]);
        assert_eq!(
            ClientMessage::parse(&frame).unwrap().server_id(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
    }

    #[test]
    fn truncated_param_request_list_is_clamped() {
        let frame = request_with_options(&[
            OPT_MESSAGE_TYPE,
            1,
            DHCP_MSG_DISCOVER,
            OPT_PARAM_REQUEST_LIST,
            10,
            OPT_DEFAULT_IP_TTL,
        ]);
        let msg = ClientMessage::parse(&frame).unwrap();
        assert_eq!(msg.requested_params(), &[OPT_DEFAULT_IP_TTL]);
    }
}
