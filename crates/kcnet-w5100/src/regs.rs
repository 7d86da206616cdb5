//! W5100 register map.
//!
//! Register behaviour is described by a static table: each address range maps to a
//! [`RegisterKind`], and the chip dispatches its read/write hooks on that kind. Addresses that are
//! not listed behave as plain storage.

use bitflags::bitflags;

/// Size of the chip's address window (registers plus TX/RX buffer banks).
pub const MEM_SIZE: usize = 0x8000;

pub const REG_MR: u16 = 0x0000;
pub const REG_GAR: u16 = 0x0001;
pub const REG_SUBR: u16 = 0x0005;
pub const REG_SHAR: u16 = 0x0009;
pub const REG_SIPR: u16 = 0x000F;
pub const REG_IR: u16 = 0x0015;
pub const REG_IMR: u16 = 0x0016;
pub const REG_RTR: u16 = 0x0017;
pub const REG_RCR: u16 = 0x0019;
pub const REG_RMSR: u16 = 0x001A;
pub const REG_TMSR: u16 = 0x001B;
pub const REG_PTIMER: u16 = 0x0028;

/// First address cleared by a soft reset. Everything below holds the address configuration.
pub const SOFT_RESET_START: u16 = 0x0013;

pub const MR_RESET: u8 = 0x80;
pub const MR_PING_BLOCK: u8 = 0x10;
pub const MR_WRITABLE_MASK: u8 = 0x74;

pub const SOCKET_COUNT: usize = 4;
pub const SOCKET_BASE: u16 = 0x0400;
pub const SOCKET_STRIDE: u16 = 0x0100;

pub const SN_MR: u16 = 0x00;
pub const SN_CR: u16 = 0x01;
pub const SN_IR: u16 = 0x02;
pub const SN_SR: u16 = 0x03;
pub const SN_PORT: u16 = 0x04;
pub const SN_DHAR: u16 = 0x06;
pub const SN_DIPR: u16 = 0x0C;
pub const SN_DPORT: u16 = 0x10;
pub const SN_PROTO: u16 = 0x14;
pub const SN_TOS: u16 = 0x15;
pub const SN_TTL: u16 = 0x16;
pub const SN_TX_FSR: u16 = 0x20;
pub const SN_TX_RD: u16 = 0x22;
pub const SN_TX_WR: u16 = 0x24;
pub const SN_RX_RSR: u16 = 0x26;
pub const SN_RX_RD: u16 = 0x28;
pub const SN_RX_WR: u16 = 0x2A;

pub const SN_MR_MULTICAST: u8 = 0x80;
pub const SN_MR_PROTOCOL_MASK: u8 = 0x0F;

pub const IPPROTO_ICMP: u8 = 1;

/// Absolute address of register `offset` in socket `n`'s block.
pub const fn socket_reg(n: usize, offset: u16) -> u16 {
    SOCKET_BASE + (n as u16) * SOCKET_STRIDE + offset
}

bitflags! {
    /// Socket interrupt register (`Sn_IR`) bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SocketInterrupt: u8 {
        const CON = 1 << 0;
        const DISCON = 1 << 1;
        const RECV = 1 << 2;
        const TIMEOUT = 1 << 3;
        const SEND_OK = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    Closed = 0x00,
    Init = 0x13,
    Listen = 0x14,
    Established = 0x17,
    Closing = 0x1A,
    CloseWait = 0x1C,
    Udp = 0x22,
    IpRaw = 0x32,
    MacRaw = 0x42,
    Pppoe = 0x5F,
}

impl SocketStatus {
    pub fn from_register(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Closed,
            0x13 => Self::Init,
            0x14 => Self::Listen,
            0x17 => Self::Established,
            0x1A => Self::Closing,
            0x1C => Self::CloseWait,
            0x22 => Self::Udp,
            0x32 => Self::IpRaw,
            0x42 => Self::MacRaw,
            0x5F => Self::Pppoe,
            _ => return None,
        })
    }

    /// Statuses in which the receive task moves data into the RX ring.
    pub fn receives(self) -> bool {
        matches!(self, Self::Established | Self::Udp | Self::IpRaw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 0x01,
    Listen = 0x02,
    Connect = 0x04,
    Discon = 0x08,
    Close = 0x10,
    Send = 0x20,
    SendMac = 0x21,
    SendKeep = 0x22,
    Recv = 0x40,
}

impl Command {
    pub fn from_register(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Open,
            0x02 => Self::Listen,
            0x04 => Self::Connect,
            0x08 => Self::Discon,
            0x10 => Self::Close,
            0x20 => Self::Send,
            0x21 => Self::SendMac,
            0x22 => Self::SendKeep,
            0x40 => Self::Recv,
            _ => return None,
        })
    }
}

/// Protocol nibble of `Sn_MR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    IpRaw,
    Unsupported(u8),
}

impl Protocol {
    pub fn from_mode(mode: u8) -> Self {
        match mode & SN_MR_PROTOCOL_MASK {
            1 => Self::Tcp,
            2 => Self::Udp,
            3 => Self::IpRaw,
            other => Self::Unsupported(other),
        }
    }
}

/// 16-bit socket counters whose value lives in the chip's cursor state instead of raw memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    TxFreeSize,
    TxReadPtr,
    TxWritePtr,
    RxReceivedSize,
    RxReadPtr,
    RxWritePtr,
}

impl Counter {
    /// Counters the guest may write. The low-byte write commits the new value.
    pub fn guest_writable(self) -> bool {
        matches!(self, Self::TxWritePtr | Self::RxReadPtr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Common `MR`: masked store, bit 7 triggers a soft reset.
    Mode,
    /// Common `IR`: writing clears the bits set in the value.
    InterruptClear,
    /// Stored by the chip only; guest writes are dropped.
    ReadOnly,
    Plain,
    SocketCommand,
    /// `Sn_IR`: write-to-clear, mirrored into the common `IR`.
    SocketInterrupt,
    Counter(Counter),
    /// TX/RX buffer banks.
    Buffer,
}

struct RegisterRange {
    start: u16,
    len: u16,
    kind: RegisterKind,
}

const fn range(start: u16, len: u16, kind: RegisterKind) -> RegisterRange {
    RegisterRange { start, len, kind }
}

const COMMON_REGISTERS: &[RegisterRange] = &[
    range(REG_MR, 1, RegisterKind::Mode),
    range(REG_SHAR, 6, RegisterKind::ReadOnly),
    range(REG_IR, 1, RegisterKind::InterruptClear),
];

/// Offsets relative to the start of a socket block.
const SOCKET_REGISTERS: &[RegisterRange] = &[
    range(SN_CR, 1, RegisterKind::SocketCommand),
    range(SN_IR, 1, RegisterKind::SocketInterrupt),
    range(SN_SR, 1, RegisterKind::ReadOnly),
    range(SN_TX_FSR, 2, RegisterKind::Counter(Counter::TxFreeSize)),
    range(SN_TX_RD, 2, RegisterKind::Counter(Counter::TxReadPtr)),
    range(SN_TX_WR, 2, RegisterKind::Counter(Counter::TxWritePtr)),
    range(SN_RX_RSR, 2, RegisterKind::Counter(Counter::RxReceivedSize)),
    range(SN_RX_RD, 2, RegisterKind::Counter(Counter::RxReadPtr)),
    range(SN_RX_WR, 2, RegisterKind::Counter(Counter::RxWritePtr)),
];

const BUFFER_START: u16 = 0x4000;

/// A decoded register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub kind: RegisterKind,
    pub socket: Option<usize>,
    /// Byte index inside a multi-byte field (0 = high byte).
    pub byte: u16,
}

/// Maps `addr` to its register kind, or `None` outside the chip window.
pub fn decode(addr: u16) -> Option<Register> {
    if addr as usize >= MEM_SIZE {
        return None;
    }
    if addr >= BUFFER_START {
        return Some(Register {
            kind: RegisterKind::Buffer,
            socket: None,
            byte: 0,
        });
    }

    let socket_end = SOCKET_BASE + SOCKET_COUNT as u16 * SOCKET_STRIDE;
    let (table, rel, socket) = if (SOCKET_BASE..socket_end).contains(&addr) {
        let rel = addr - SOCKET_BASE;
        (
            SOCKET_REGISTERS,
            rel % SOCKET_STRIDE,
            Some((rel / SOCKET_STRIDE) as usize),
        )
    } else {
        (COMMON_REGISTERS, addr, None)
    };

    let hit = table
        .iter()
        .find(|r| rel >= r.start && rel < r.start + r.len);
    Some(match hit {
        Some(r) => Register {
            kind: r.kind,
            socket,
            byte: rel - r.start,
        },
        None => Register {
            kind: RegisterKind::Plain,
            socket,
            byte: 0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_common_registers() {
        assert_eq!(decode(REG_MR).unwrap().kind, RegisterKind::Mode);
        assert_eq!(decode(REG_IR).unwrap().kind, RegisterKind::InterruptClear);
        for addr in REG_SHAR..REG_SHAR + 6 {
            assert_eq!(decode(addr).unwrap().kind, RegisterKind::ReadOnly);
        }
        assert_eq!(decode(REG_SIPR).unwrap().kind, RegisterKind::Plain);
        assert_eq!(decode(REG_RMSR).unwrap().socket, None);
    }

    #[test]
    fn decode_socket_counters_with_byte_index() {
        let hi = decode(socket_reg(2, SN_TX_WR)).unwrap();
        assert_eq!(hi.kind, RegisterKind::Counter(Counter::TxWritePtr));
        assert_eq!(hi.socket, Some(2));
        assert_eq!(hi.byte, 0);

        let lo = decode(socket_reg(2, SN_TX_WR + 1)).unwrap();
        assert_eq!(lo.byte, 1);

        let cr = decode(socket_reg(3, SN_CR)).unwrap();
        assert_eq!(cr.kind, RegisterKind::SocketCommand);
        assert_eq!(cr.socket, Some(3));

        let port = decode(socket_reg(0, SN_PORT + 1)).unwrap();
        assert_eq!(port.kind, RegisterKind::Plain);
        assert_eq!(port.socket, Some(0));
    }

    #[test]
    fn decode_buffers_and_out_of_range() {
        assert_eq!(decode(0x4000).unwrap().kind, RegisterKind::Buffer);
        assert_eq!(decode(0x7FFF).unwrap().kind, RegisterKind::Buffer);
        assert_eq!(decode(0x8000), None);
        assert_eq!(decode(0x0800).unwrap().kind, RegisterKind::Plain);
        assert_eq!(decode(0x0800).unwrap().socket, None);
    }

    #[test]
    fn status_and_command_codes_round_trip_from_register_values() {
        assert_eq!(SocketStatus::from_register(0x17), Some(SocketStatus::Established));
        assert_eq!(SocketStatus::Established as u8, 0x17);
        assert_eq!(SocketStatus::from_register(0x99), None);
        assert_eq!(Command::from_register(0x22), Some(Command::SendKeep));
        assert_eq!(Command::from_register(0x03), None);
        assert_eq!(Protocol::from_mode(0x82), Protocol::Udp);
        assert_eq!(Protocol::from_mode(0x04), Protocol::Unsupported(4));
    }
}
