//! Emulated WIZnet W5100 TCP/IP controller backed by real host sockets.
//!
//! The guest sees the chip's 32 KiB register window through [`W5100::read_byte`] and
//! [`W5100::write_byte`]. Socket commands are carried out on the host network by per-socket worker
//! tasks; DHCP traffic from the guest is answered locally by [`kcnet_dhcp::DhcpResponder`].
#![forbid(unsafe_code)]

mod bridge;
mod chip;
pub mod config;
mod device;
pub mod error;
pub mod probe;
pub mod regs;
pub mod ring;
mod timeouts;
mod worker;

pub use config::{AddressPlan, ConfigError, DeviceConfig, NetConfig, Settings};
pub use device::W5100;
pub use error::{BridgeError, Notice};
pub use probe::{HostProbe, ProbeOutcome, Reachability};
