use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Failure of a host socket operation.
///
/// These never reach the guest as values. The worker that hit them raises `Sn_IR.TIMEOUT` and
/// closes the socket quietly.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("host socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("host operation timed out")]
    Timeout,

    #[error("datagram to own address {0} with no reserved receiver")]
    SelfLoopback(SocketAddrV4),

    #[error("no host connection")]
    NotConnected,

    #[error("operation cancelled by close or reset")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl BridgeError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied)
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// Something the surrounding application should tell the user about, since the guest cannot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The host refused to bind a port (typically a privileged port below 1024).
    PermissionDenied { socket: usize, port: u16 },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied { socket, port } => write!(
                f,
                "socket {socket}: the host operating system does not permit binding port {port}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_detected_from_io_kind() {
        let err = BridgeError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.is_permission_denied());
        assert!(!BridgeError::Timeout.is_permission_denied());
        assert!(!BridgeError::from(io::Error::from(io::ErrorKind::AddrInUse)).is_permission_denied());
    }
}
