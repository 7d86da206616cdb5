//! TX/RX ring placement and cursor arithmetic.
//!
//! Cursors are free-running 16-bit counters. The byte offset inside a ring is `cursor & (size - 1)`,
//! so sizes are always powers of two and `used` never exceeds `size`.

use crate::regs::MEM_SIZE;

pub const TX_BANK: usize = 0x4000;
pub const RX_BANK: usize = 0x6000;

/// Decodes one 2-bit size selector from `RMSR`/`TMSR`.
pub fn selector_size(selector: u8, socket: usize) -> usize {
    0x0400 << ((selector >> (socket * 2)) & 0x03)
}

/// A socket's buffer inside the chip window. `size == 0` means the ring is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingRegion {
    pub base: usize,
    pub size: usize,
}

impl RingRegion {
    /// Places `socket`'s buffer after the buffers of all lower-numbered sockets.
    pub fn place(bank: usize, selector: u8, socket: usize) -> Self {
        let base = bank + (0..socket).map(|n| selector_size(selector, n)).sum::<usize>();
        let size = selector_size(selector, socket);
        if base + size > MEM_SIZE {
            return Self { base, size: 0 };
        }
        Self { base, size }
    }

    pub fn is_enabled(&self) -> bool {
        self.size > 0
    }

    /// Bytes queued between `rd` and `wr`.
    pub fn used(&self, rd: u16, wr: u16) -> usize {
        (wr.wrapping_sub(rd) as usize).min(self.size)
    }

    pub fn free(&self, rd: u16, wr: u16) -> usize {
        self.size - self.used(rd, wr)
    }

    /// Copies `len` bytes starting at cursor `rd` out of `mem`.
    pub fn read(&self, mem: &[u8], rd: u16, len: usize) -> Vec<u8> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let len = len.min(self.size);
        let start = rd as usize & (self.size - 1);
        let first = len.min(self.size - start);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&mem[self.base + start..self.base + start + first]);
        out.extend_from_slice(&mem[self.base..self.base + (len - first)]);
        out
    }

    /// Copies `data` into `mem` starting at cursor `wr` and returns the advanced cursor.
    pub fn write(&self, mem: &mut [u8], wr: u16, data: &[u8]) -> u16 {
        if !self.is_enabled() {
            return wr;
        }
        debug_assert!(data.len() <= self.size);
        let start = wr as usize & (self.size - 1);
        let first = data.len().min(self.size - start);
        mem[self.base + start..self.base + start + first].copy_from_slice(&data[..first]);
        mem[self.base..self.base + (data.len() - first)].copy_from_slice(&data[first..]);
        wr.wrapping_add(data.len() as u16)
    }
}
