//! Minimal DHCP server side used to auto-configure emulated network controllers.
//!
//! The responder never touches the network. Frames the guest sends towards UDP port 67 are fed in,
//! and the fabricated OFFER/ACK frames are taken out again and delivered to the guest's port-68
//! socket by the caller. The lease handed out is the host's own address configuration.
#![forbid(unsafe_code)]

pub mod message;
mod responder;

pub use message::{ClientMessage, DhcpParseError};
pub use responder::{
    DhcpAnswer, DhcpResponder, Handled, LeaseSource, CLIENT_PORT, EXCHANGE_TIMEOUT, SERVER_PORT,
};
