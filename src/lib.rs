//! KCNet network interface for KC85-style emulators.
//!
//! [`KcNet`] is what the firmware sees: a byte-stream command port in front of an emulated
//! WIZnet W5100 ([`kcnet_w5100::W5100`]) whose sockets are carried out on the host network.
#![forbid(unsafe_code)]

mod facade;

use thiserror::Error;

pub use facade::{
    KcNet, Opcode, HW_VERSION, IP_SLOTS, PORT_SEQ_FIRST, PORT_SEQ_LAST, STATUS_BUSY, STATUS_READY,
    SW_VERSION,
};
pub use kcnet_w5100::{
    AddressPlan, ConfigError, DeviceConfig, NetConfig, Notice, ProbeOutcome, Reachability,
    Settings, W5100,
};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start the network runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
