use std::collections::VecDeque;
use std::io;

use kcnet_w5100::{DeviceConfig, Notice, W5100};
use tracing::{debug, trace, warn};

use crate::SetupError;

pub const HW_VERSION: u16 = 0x0102;
pub const SW_VERSION: u16 = 0x0102;

/// Range handed out by READ_NEXT_PORT_NUM when the host cannot reserve a port.
pub const PORT_SEQ_FIRST: u16 = 49152;
pub const PORT_SEQ_LAST: u16 = 65535;

pub const IP_SLOTS: usize = 8;

/// Status port: a result byte is waiting on the data port.
pub const STATUS_READY: u8 = 0x80;
/// Status port: a write is being processed.
pub const STATUS_BUSY: u8 = 0x01;

/// How long the firmware may leave an argument or result hanging.
const HANDSHAKE_TIMEOUT_MS: u64 = 524;
const TIMER_WRAP_MS: u64 = 60_000;

/// Facade addresses at and above this map onto the chip window.
const CHIP_WINDOW: u16 = 0x8000;

const DEFAULT_ID_TEXT: &str = "###     KCNET     ### \r\n\
                               \x20WIZnet TCP/IP-Stack  \r\n\
                               ###   by kcnet    ### \r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    WriteBytes = 0,
    ReadBytes = 1,
    WriteAddr = 2,
    ReadTimer = 3,
    WriteByte = 4,
    ReadByte = 5,
    WriteIpAddr = 6,
    ReadIpAddr = 7,
    ReadNextPortNum = 8,
    ReadSwVersion = 9,
    ReadHwVersion = 10,
    ReadLinkStatus = 11,
    ReadId = 12,
    ReadErrorCnt = 13,
}

impl Opcode {
    pub fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::WriteBytes,
            1 => Self::ReadBytes,
            2 => Self::WriteAddr,
            3 => Self::ReadTimer,
            4 => Self::WriteByte,
            5 => Self::ReadByte,
            6 => Self::WriteIpAddr,
            7 => Self::ReadIpAddr,
            8 => Self::ReadNextPortNum,
            9 => Self::ReadSwVersion,
            10 => Self::ReadHwVersion,
            11 => Self::ReadLinkStatus,
            12 => Self::ReadId,
            13 => Self::ReadErrorCnt,
            _ => return None,
        })
    }
}

/// The KCNet interface board: a byte-stream command processor in front of a [`W5100`].
///
/// The firmware talks to it through two ports. Writing the data port feeds one byte of a
/// command; reading it takes the current result byte and lines up the next one. The status port
/// tells whether a result byte is waiting.
pub struct KcNet {
    device: W5100,
    command: Option<Opcode>,
    args: [u8; 4],
    arg_count: usize,
    byte_count: u16,
    addr: u16,
    /// Value currently latched on the data port.
    latched: u8,
    ready: bool,
    out: VecDeque<u8>,
    ip_slots: [[u8; 4]; IP_SLOTS],
    error_count: u16,
    port_seq: u16,
    cycles_per_ms: u64,
    cycle_counter: u64,
    cycles_to_timeout: Option<u64>,
    id_text: Vec<u8>,
}

impl KcNet {
    pub fn new(config: DeviceConfig) -> io::Result<Self> {
        let mut kcnet = Self {
            device: W5100::new(config)?,
            command: None,
            args: [0; 4],
            arg_count: 0,
            byte_count: 0,
            addr: 0,
            latched: 0,
            ready: false,
            out: VecDeque::new(),
            ip_slots: [[0; 4]; IP_SLOTS],
            error_count: 0,
            port_seq: PORT_SEQ_FIRST,
            cycles_per_ms: 0,
            cycle_counter: 0,
            cycles_to_timeout: None,
            id_text: Vec::new(),
        };
        kcnet.set_id_text(DEFAULT_ID_TEXT);
        kcnet.power_on_state();
        Ok(kcnet)
    }

    /// Discovers the host network and applies `KCNET_*` overrides.
    pub fn from_env() -> Result<Self, SetupError> {
        Ok(Self::new(DeviceConfig::from_env()?)?)
    }

    /// Replaces the text returned by READ_ID. A terminating NUL is appended.
    pub fn set_id_text(&mut self, text: &str) {
        self.id_text = text.bytes().chain(std::iter::once(0)).collect();
    }

    pub fn device(&self) -> &W5100 {
        &self.device
    }

    pub fn drain_notices(&self) -> Vec<Notice> {
        self.device.drain_notices()
    }

    /// Bit 7 is set while a result byte waits on the data port. Writes are processed before
    /// [`write_data`](Self::write_data) returns, so [`STATUS_BUSY`] never shows up here.
    pub fn read_status(&self) -> u8 {
        if self.ready {
            STATUS_READY
        } else {
            0
        }
    }

    pub fn write_data(&mut self, value: u8) {
        trace!(value, "kcnet write");
        self.cycles_to_timeout = None;
        match self.command {
            None => self.start(value),
            Some(opcode) => self.argument(opcode, value),
        }
    }

    /// Returns the latched result byte and prepares the next one. A read with nothing left to
    /// deliver ends the current command.
    pub fn read_data(&mut self) -> u8 {
        let value = self.latched;
        trace!(value, "kcnet read");
        self.cycles_to_timeout = None;
        self.ready = false;

        if let Some(next) = self.out.pop_front() {
            self.set_result_byte(next);
        } else if self.command == Some(Opcode::ReadBytes) && self.byte_count > 0 {
            let next = self.read_mem(self.addr);
            self.addr = self.addr.wrapping_add(1);
            self.byte_count -= 1;
            self.set_result_byte(next);
        } else {
            self.set_idle();
        }
        value
    }

    /// Sets the emulated CPU clock. With 0 the timer stands still and handshakes never time out.
    pub fn set_cpu_khz(&mut self, khz: u32) {
        self.cycles_per_ms = u64::from(khz);
    }

    /// Advances emulated time by `cycles` CPU clock cycles.
    pub fn advance_cycles(&mut self, cycles: u64) {
        if self.cycles_per_ms == 0 {
            return;
        }
        let wrap = self.cycles_per_ms * TIMER_WRAP_MS;
        self.cycle_counter = (self.cycle_counter + cycles) % wrap;

        if let Some(left) = self.cycles_to_timeout {
            if cycles >= left {
                self.error_count = self.error_count.wrapping_add(1);
                warn!(
                    command = ?self.command,
                    errors = self.error_count,
                    "kcnet handshake timed out, resetting"
                );
                self.reset(false);
            } else {
                self.cycles_to_timeout = Some(left - cycles);
            }
        }
    }

    pub fn reset(&mut self, power_on: bool) {
        debug!(power_on, "kcnet reset");
        self.device.reset(power_on);
        self.set_idle();
        if power_on {
            self.power_on_state();
        }
    }

    /// Closes every host socket and stops the chip. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.set_idle();
        self.device.destroy();
    }

    fn power_on_state(&mut self) {
        self.addr = 0;
        self.error_count = 0;
        self.cycle_counter = 0;
        self.ip_slots = [[0; 4]; IP_SLOTS];
        if let Some(dns) = self.device.addresses().dns_server {
            self.ip_slots[0] = dns.octets();
        }
    }

    fn start(&mut self, value: u8) {
        self.arg_count = 0;
        let Some(opcode) = Opcode::from_byte(value) else {
            debug!(value, "ignoring unknown kcnet opcode");
            return;
        };
        debug!(?opcode, "kcnet command");

        match opcode {
            Opcode::ReadTimer => {
                let ms = if self.cycles_per_ms > 0 {
                    (self.cycle_counter / self.cycles_per_ms) % TIMER_WRAP_MS
                } else {
                    0
                };
                self.set_result_u16(ms as u16);
            }
            Opcode::ReadNextPortNum => {
                let port = self.next_port();
                // Network byte order, unlike every other 16-bit result.
                self.set_result_bytes(&port.to_be_bytes());
            }
            Opcode::ReadSwVersion => self.set_result_u16(SW_VERSION),
            Opcode::ReadHwVersion => self.set_result_u16(HW_VERSION),
            // The link is always reported as up.
            Opcode::ReadLinkStatus => self.set_result_byte(1),
            Opcode::ReadId => {
                let id = std::mem::take(&mut self.id_text);
                self.set_result_bytes(&id);
                self.id_text = id;
            }
            Opcode::ReadErrorCnt => self.set_result_u16(self.error_count),
            _ => {
                self.command = Some(opcode);
                self.restart_timeout();
            }
        }
    }

    fn argument(&mut self, opcode: Opcode, value: u8) {
        match opcode {
            Opcode::WriteBytes => match self.arg_count {
                0 => self.push_arg(value),
                1 => {
                    self.byte_count = u16::from_le_bytes([self.args[0], value]);
                    if self.byte_count > 0 {
                        self.arg_count += 1;
                        self.restart_timeout();
                    } else {
                        self.set_idle();
                    }
                }
                _ => {
                    self.write_mem(self.addr, value);
                    self.addr = self.addr.wrapping_add(1);
                    self.byte_count -= 1;
                    if self.byte_count > 0 {
                        self.restart_timeout();
                    } else {
                        self.set_idle();
                    }
                }
            },
            Opcode::ReadBytes => match self.arg_count {
                0 => self.push_arg(value),
                1 => {
                    self.byte_count = u16::from_le_bytes([self.args[0], value]);
                    if self.byte_count > 0 {
                        self.arg_count += 1;
                        let first = self.read_mem(self.addr);
                        self.addr = self.addr.wrapping_add(1);
                        self.byte_count -= 1;
                        self.set_result_byte(first);
                    } else {
                        self.set_idle();
                    }
                }
                // A write while bytes are streaming out aborts the transfer.
                _ => self.set_idle(),
            },
            Opcode::WriteAddr => {
                if self.arg_count == 0 {
                    self.push_arg(value);
                } else {
                    self.addr = u16::from_le_bytes([self.args[0], value]);
                    self.set_idle();
                }
            }
            Opcode::WriteByte => {
                if self.arg_count < 2 {
                    self.push_arg(value);
                } else {
                    let addr = u16::from_le_bytes([self.args[0], self.args[1]]);
                    self.write_mem(addr, value);
                    self.set_idle();
                }
            }
            Opcode::ReadByte => {
                if self.arg_count == 0 {
                    self.push_arg(value);
                } else {
                    let addr = u16::from_le_bytes([self.args[0], value]);
                    self.set_idle();
                    let byte = self.read_mem(addr);
                    self.set_result_byte(byte);
                }
            }
            Opcode::WriteIpAddr => {
                if self.arg_count < 4 {
                    self.push_arg(value);
                } else {
                    let [slot, a, b, c] = self.args;
                    if let Some(ip) = self.ip_slots.get_mut(usize::from(slot)) {
                        *ip = [a, b, c, value];
                    }
                    self.set_idle();
                }
            }
            Opcode::ReadIpAddr => {
                self.set_idle();
                let ip = self
                    .ip_slots
                    .get(usize::from(value))
                    .copied()
                    .unwrap_or([0; 4]);
                self.set_result_bytes(&ip);
            }
            _ => self.set_idle(),
        }
    }

    fn push_arg(&mut self, value: u8) {
        self.args[self.arg_count] = value;
        self.arg_count += 1;
        self.restart_timeout();
    }

    fn next_port(&mut self) -> u16 {
        if let Some(port) = self.device.reserve_port() {
            return port;
        }
        let port = self.port_seq;
        self.port_seq = if port >= PORT_SEQ_LAST {
            PORT_SEQ_FIRST
        } else {
            port + 1
        };
        port
    }

    fn read_mem(&self, addr: u16) -> u8 {
        if addr >= CHIP_WINDOW {
            self.device.read_byte(addr & !CHIP_WINDOW)
        } else {
            0
        }
    }

    fn write_mem(&mut self, addr: u16, value: u8) {
        if addr >= CHIP_WINDOW {
            self.device.write_byte(addr & !CHIP_WINDOW, value);
        }
    }

    fn set_result_byte(&mut self, value: u8) {
        self.latched = value;
        self.ready = true;
        self.restart_timeout();
    }

    fn set_result_bytes(&mut self, bytes: &[u8]) {
        self.out = bytes.iter().copied().collect();
        if let Some(first) = self.out.pop_front() {
            self.set_result_byte(first);
        }
    }

    fn set_result_u16(&mut self, value: u16) {
        self.set_result_bytes(&value.to_le_bytes());
    }

    fn set_idle(&mut self) {
        self.cycles_to_timeout = None;
        self.command = None;
        self.arg_count = 0;
        self.byte_count = 0;
        self.out.clear();
        self.ready = false;
    }

    fn restart_timeout(&mut self) {
        self.cycles_to_timeout =
            (self.cycles_per_ms > 0).then(|| self.cycles_per_ms * HANDSHAKE_TIMEOUT_MS);
    }
}

impl std::fmt::Debug for KcNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcNet")
            .field("command", &self.command)
            .field("addr", &format_args!("{:#06x}", self.addr))
            .field("ready", &self.ready)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}
