//! Register memory, per-socket state and the command dispatcher.
//!
//! Everything in here is synchronous and runs under the device's chip lock. Work that has to touch
//! the host network is handed out as [`Effect`]s, which the device forwards to the socket workers
//! once the lock is released.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bridge::HostHandle;
use crate::config::AddressPlan;
use crate::regs::*;
use crate::ring::{RingRegion, RX_BANK, TX_BANK};
use crate::timeouts::retry_timeout;

/// One unit of host work for a socket's control task.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) command: Command,
    /// Token of the socket at dispatch time. A job whose token was cancelled is stale.
    pub(crate) token: CancellationToken,
    /// Host object detached by DISCON/CLOSE, dropped by the control task.
    pub(crate) closing: Option<HostHandle>,
}

#[derive(Debug)]
pub(crate) enum Effect {
    Job(usize, Job),
    Wake(usize),
    ReleaseReservations,
    /// A soft reset ran; workers must be replaced.
    Restart,
}

#[derive(Debug)]
pub(crate) struct SocketState {
    pub(crate) index: usize,
    pub(crate) status: SocketStatus,
    pub(crate) host: HostHandle,
    pub(crate) token: CancellationToken,
    pub(crate) tx_rd: u16,
    pub(crate) tx_wr: u16,
    pub(crate) rx_rd: u16,
    pub(crate) rx_wr: u16,
    pub(crate) recv_enabled: bool,
    /// UDP socket on the DHCP client port that could not be bound on the host. It only ever
    /// talks to the built-in responder.
    pub(crate) dhcp_only: bool,
}

impl SocketState {
    fn new(index: usize) -> Self {
        Self {
            index,
            status: SocketStatus::Closed,
            host: HostHandle::None,
            token: CancellationToken::new(),
            tx_rd: 0,
            tx_wr: 0,
            rx_rd: 0,
            rx_wr: 0,
            recv_enabled: false,
            dhcp_only: false,
        }
    }

    /// Detaches the host object and invalidates every operation started before this call.
    fn detach(&mut self) -> HostHandle {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.recv_enabled = false;
        self.dhcp_only = false;
        std::mem::take(&mut self.host)
    }
}

pub(crate) struct Chip {
    mem: Vec<u8>,
    sockets: [SocketState; SOCKET_COUNT],
    plan: AddressPlan,
}

impl Chip {
    pub(crate) fn new(plan: AddressPlan) -> Self {
        let mut chip = Self {
            mem: vec![0; MEM_SIZE],
            sockets: std::array::from_fn(SocketState::new),
            plan,
        };
        chip.reset(true);
        chip
    }

    pub(crate) fn plan(&self) -> &AddressPlan {
        &self.plan
    }

    /// Replaces the addresses the next cold reset seeds.
    pub(crate) fn set_plan(&mut self, plan: AddressPlan) {
        self.plan = plan;
    }

    /// Stops every socket and reloads register defaults. A cold reset also wipes the whole
    /// window and seeds the address registers; a soft one keeps everything below `0x13`.
    pub(crate) fn reset(&mut self, cold: bool) {
        for socket in &mut self.sockets {
            socket.token.cancel();
            *socket = SocketState::new(socket.index);
        }

        if cold {
            self.mem.fill(0);
            self.mem[REG_SHAR as usize..REG_SHAR as usize + 6].copy_from_slice(&self.plan.mac);
            self.set_ipv4(REG_SIPR, self.plan.ip);
            self.set_ipv4(REG_SUBR, self.plan.subnet_mask);
            self.set_ipv4(REG_GAR, self.plan.gateway);
        } else {
            self.mem[SOFT_RESET_START as usize..].fill(0);
        }

        self.set_word(REG_RTR, 0x07D0);
        self.mem[REG_RCR as usize] = 0x08;
        self.mem[REG_RMSR as usize] = 0x55;
        self.mem[REG_TMSR as usize] = 0x55;
        self.mem[REG_PTIMER as usize] = 0x28;

        for n in 0..SOCKET_COUNT {
            let dhar = socket_reg(n, SN_DHAR) as usize;
            self.mem[dhar..dhar + 6].fill(0xFF);
            self.mem[socket_reg(n, SN_TTL) as usize] = 0x80;
            self.mem[socket_reg(n, SN_SR) as usize] = SocketStatus::Closed as u8;
        }
        debug!(cold, "chip reset");
    }

    pub(crate) fn read_byte(&mut self, addr: u16) -> u8 {
        let Some(reg) = decode(addr) else {
            return 0;
        };
        if let (RegisterKind::Counter(counter), Some(n), 0) = (reg.kind, reg.socket, reg.byte) {
            // Latch the whole word so the following low-byte read matches.
            let value = self.counter_value(n, counter);
            self.set_word(addr, value);
        }
        let value = self.mem[addr as usize];
        trace!(addr = format_args!("{addr:#06x}"), value, "read");
        value
    }

    pub(crate) fn write_byte(&mut self, addr: u16, value: u8, effects: &mut Vec<Effect>) {
        let Some(reg) = decode(addr) else {
            return;
        };
        trace!(addr = format_args!("{addr:#06x}"), value, "write");
        let idx = addr as usize;
        match (reg.kind, reg.socket) {
            (RegisterKind::Mode, _) => {
                if value & MR_RESET != 0 {
                    self.reset(false);
                    effects.push(Effect::Restart);
                }
                self.mem[idx] = value & MR_WRITABLE_MASK;
            }
            (RegisterKind::InterruptClear, _) => self.mem[idx] &= !value,
            (RegisterKind::ReadOnly, _) => {}
            (RegisterKind::SocketCommand, Some(n)) => self.dispatch(n, value, effects),
            (RegisterKind::SocketInterrupt, Some(n)) => {
                let ir = self.mem[idx] & !value;
                self.set_socket_interrupt(n, ir);
            }
            (RegisterKind::Counter(counter), Some(n)) => {
                if counter.guest_writable() {
                    self.mem[idx] = value;
                    if reg.byte == 1 {
                        self.commit_counter(n, counter, addr - 1, effects);
                    }
                }
            }
            _ => self.mem[idx] = value,
        }
    }

    fn counter_value(&self, n: usize, counter: Counter) -> u16 {
        let socket = &self.sockets[n];
        match counter {
            Counter::TxFreeSize => {
                let region = self.tx_region(n);
                region.free(socket.tx_rd, socket.tx_wr) as u16
            }
            Counter::RxReceivedSize => {
                let region = self.rx_region(n);
                region.used(socket.rx_rd, socket.rx_wr) as u16
            }
            Counter::TxReadPtr => socket.tx_rd,
            Counter::TxWritePtr => socket.tx_wr,
            Counter::RxReadPtr => socket.rx_rd,
            Counter::RxWritePtr => socket.rx_wr,
        }
    }

    fn commit_counter(&mut self, n: usize, counter: Counter, high: u16, effects: &mut Vec<Effect>) {
        let value = self.word(high);
        match counter {
            Counter::TxWritePtr => self.sockets[n].tx_wr = value,
            Counter::RxReadPtr => {
                self.sockets[n].rx_rd = value;
                effects.push(Effect::Wake(n));
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, n: usize, value: u8, effects: &mut Vec<Effect>) {
        let Some(command) = Command::from_register(value) else {
            debug!(socket = n, value, "ignoring unknown command");
            self.clear_command_register(n);
            return;
        };
        let status = self.sockets[n].status;
        debug!(socket = n, ?command, ?status, "command");

        match command {
            Command::Open => self.open(n, effects),
            Command::Listen if status == SocketStatus::Init => {
                self.set_status(n, SocketStatus::Listen);
                self.start_job(n, command, None, effects);
            }
            Command::Connect if status == SocketStatus::Init => {
                self.start_job(n, command, None, effects);
            }
            Command::Send if status.receives() => self.start_job(n, command, None, effects),
            Command::Discon | Command::Close => self.close(n, command, effects),
            Command::SendMac => {
                if matches!(status, SocketStatus::Udp | SocketStatus::Established) {
                    let socket = &mut self.sockets[n];
                    socket.tx_rd = socket.tx_wr;
                    self.raise(n, SocketInterrupt::SEND_OK);
                }
                self.clear_command_register(n);
            }
            Command::SendKeep => {
                if matches!(status, SocketStatus::Udp | SocketStatus::Established)
                    && self.sockets[n].host.tcp().is_none()
                {
                    self.raise(n, SocketInterrupt::TIMEOUT);
                }
                self.clear_command_register(n);
            }
            Command::Recv => {
                if status.receives() {
                    self.sockets[n].recv_enabled = true;
                    effects.push(Effect::Wake(n));
                }
                self.clear_command_register(n);
            }
            Command::Send => {
                // Nothing can carry the data; it is consumed so the guest sees the ring drain.
                debug!(socket = n, ?status, "send without a connection, discarding queued data");
                let socket = &mut self.sockets[n];
                socket.tx_rd = socket.tx_wr;
                self.raise(n, SocketInterrupt::SEND_OK);
                self.clear_command_register(n);
            }
            Command::Listen | Command::Connect => {
                debug!(socket = n, ?command, ?status, "command not valid in this state");
                self.clear_command_register(n);
            }
        }
    }

    fn open(&mut self, n: usize, effects: &mut Vec<Effect>) {
        if self.sockets[n].status != SocketStatus::Closed {
            self.abandon(n);
            return;
        }

        let socket = &mut self.sockets[n];
        socket.rx_rd = socket.rx_wr;
        socket.tx_rd = socket.tx_wr;

        match Protocol::from_mode(self.mode(n)) {
            Protocol::Tcp => {
                self.set_status(n, SocketStatus::Init);
                self.clear_command_register(n);
            }
            Protocol::Udp => {
                self.set_status(n, SocketStatus::Udp);
                self.start_job(n, Command::Open, None, effects);
            }
            Protocol::IpRaw => {
                self.set_status(n, SocketStatus::IpRaw);
                self.sockets[n].recv_enabled = true;
                effects.push(Effect::Wake(n));
                self.clear_command_register(n);
            }
            Protocol::Unsupported(mode) => {
                debug!(socket = n, mode, "socket mode not emulated, staying closed");
                self.clear_command_register(n);
            }
        }
    }

    fn close(&mut self, n: usize, command: Command, effects: &mut Vec<Effect>) {
        effects.push(Effect::ReleaseReservations);
        let had_connection = self.sockets[n].host.tcp().is_some();
        let closing = self.sockets[n].detach();

        if had_connection {
            self.set_status(n, SocketStatus::Closing);
            self.start_job(n, command, Some(closing), effects);
            return;
        }
        drop(closing);
        if self.sockets[n].status != SocketStatus::Closed {
            self.set_status(n, SocketStatus::Closed);
        }
        self.clear_command_register(n);
    }

    fn start_job(
        &mut self,
        n: usize,
        command: Command,
        closing: Option<HostHandle>,
        effects: &mut Vec<Effect>,
    ) {
        self.mem[socket_reg(n, SN_CR) as usize] = command as u8;
        effects.push(Effect::Job(
            n,
            Job {
                command,
                token: self.sockets[n].token.clone(),
                closing,
            },
        ));
    }

    // --- accessors used by the workers ---

    pub(crate) fn socket(&self, n: usize) -> &SocketState {
        &self.sockets[n]
    }

    pub(crate) fn socket_mut(&mut self, n: usize) -> &mut SocketState {
        &mut self.sockets[n]
    }

    pub(crate) fn set_status(&mut self, n: usize, status: SocketStatus) {
        if self.sockets[n].status != status {
            debug!(socket = n, from = ?self.sockets[n].status, to = ?status, "status");
        }
        self.sockets[n].status = status;
        self.mem[socket_reg(n, SN_SR) as usize] = status as u8;
    }

    /// Closes socket `n` without interrupts. Pending commands are abandoned along with the
    /// token they were started under, so `Sn_CR` is cleared here.
    pub(crate) fn abandon(&mut self, n: usize) {
        drop(self.sockets[n].detach());
        self.set_status(n, SocketStatus::Closed);
        self.clear_command_register(n);
    }

    pub(crate) fn command_register(&self, n: usize) -> u8 {
        self.mem[socket_reg(n, SN_CR) as usize]
    }

    fn clear_command_register(&mut self, n: usize) {
        self.mem[socket_reg(n, SN_CR) as usize] = 0;
    }

    /// Clears `Sn_CR` if it still holds `command`.
    pub(crate) fn finish_command(&mut self, n: usize, command: Command) {
        if self.command_register(n) == command as u8 {
            self.clear_command_register(n);
        }
    }

    pub(crate) fn raise(&mut self, n: usize, bits: SocketInterrupt) {
        let ir = self.mem[socket_reg(n, SN_IR) as usize] | bits.bits();
        self.set_socket_interrupt(n, ir);
    }

    fn set_socket_interrupt(&mut self, n: usize, value: u8) {
        self.mem[socket_reg(n, SN_IR) as usize] = value;
        let bit = 1u8 << n;
        if value == 0 {
            self.mem[REG_IR as usize] &= !bit;
        } else {
            self.mem[REG_IR as usize] |= bit;
        }
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.mem[REG_IR as usize] & self.mem[REG_IMR as usize] != 0
    }

    pub(crate) fn mode(&self, n: usize) -> u8 {
        self.mem[socket_reg(n, SN_MR) as usize]
    }

    pub(crate) fn ttl(&self, n: usize) -> u8 {
        self.mem[socket_reg(n, SN_TTL) as usize]
    }

    pub(crate) fn ip_protocol(&self, n: usize) -> u8 {
        self.mem[socket_reg(n, SN_PROTO) as usize]
    }

    pub(crate) fn source_port(&self, n: usize) -> u16 {
        self.word(socket_reg(n, SN_PORT))
    }

    pub(crate) fn source_ip(&self) -> Ipv4Addr {
        self.ipv4(REG_SIPR)
    }

    pub(crate) fn destination(&self, n: usize) -> SocketAddrV4 {
        SocketAddrV4::new(
            self.ipv4(socket_reg(n, SN_DIPR)),
            self.word(socket_reg(n, SN_DPORT)),
        )
    }

    pub(crate) fn set_destination(&mut self, n: usize, peer: SocketAddrV4) {
        self.set_ipv4(socket_reg(n, SN_DIPR), *peer.ip());
        self.set_word(socket_reg(n, SN_DPORT), peer.port());
    }

    pub(crate) fn ping_block(&self) -> bool {
        self.mem[REG_MR as usize] & MR_PING_BLOCK != 0
    }

    pub(crate) fn retry_timeout(&self) -> Option<Duration> {
        retry_timeout(self.word(REG_RTR), self.mem[REG_RCR as usize])
    }

    fn tx_region(&self, n: usize) -> RingRegion {
        RingRegion::place(TX_BANK, self.mem[REG_TMSR as usize], n)
    }

    fn rx_region(&self, n: usize) -> RingRegion {
        RingRegion::place(RX_BANK, self.mem[REG_RMSR as usize], n)
    }

    /// Bytes queued for sending, and the write cursor they end at.
    pub(crate) fn tx_pending(&self, n: usize) -> (Vec<u8>, u16) {
        let socket = &self.sockets[n];
        let region = self.tx_region(n);
        let len = region.used(socket.tx_rd, socket.tx_wr);
        (region.read(&self.mem, socket.tx_rd, len), socket.tx_wr)
    }

    /// Completes a SEND. Success consumes up to `wr`; failure drops everything queued so the
    /// guest never waits on data that will not go out.
    pub(crate) fn finish_send(&mut self, n: usize, wr: u16, ok: bool) {
        let socket = &mut self.sockets[n];
        if ok {
            socket.tx_rd = wr;
            self.raise(n, SocketInterrupt::SEND_OK);
        } else {
            socket.tx_rd = socket.tx_wr;
            self.raise(n, SocketInterrupt::TIMEOUT);
        }
    }

    pub(crate) fn rx_size(&self, n: usize) -> usize {
        self.rx_region(n).size
    }

    pub(crate) fn rx_free(&self, n: usize) -> usize {
        let socket = &self.sockets[n];
        let region = self.rx_region(n);
        if !region.is_enabled() {
            return 0;
        }
        region.free(socket.rx_rd, socket.rx_wr)
    }

    /// Appends `parts` to the RX ring, then disarms receive and raises RECV. The caller checks
    /// that everything fits.
    pub(crate) fn commit_rx(&mut self, n: usize, parts: &[&[u8]]) {
        let region = self.rx_region(n);
        let mut wr = self.sockets[n].rx_wr;
        for part in parts {
            wr = region.write(&mut self.mem, wr, part);
        }
        let socket = &mut self.sockets[n];
        socket.rx_wr = wr;
        socket.recv_enabled = false;
        self.raise(n, SocketInterrupt::RECV);
    }

    fn word(&self, addr: u16) -> u16 {
        let a = addr as usize;
        u16::from_be_bytes([self.mem[a], self.mem[a + 1]])
    }

    fn set_word(&mut self, addr: u16, value: u16) {
        let a = addr as usize;
        self.mem[a..a + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn ipv4(&self, addr: u16) -> Ipv4Addr {
        let a = addr as usize;
        Ipv4Addr::new(self.mem[a], self.mem[a + 1], self.mem[a + 2], self.mem[a + 3])
    }

    fn set_ipv4(&mut self, addr: u16, ip: Ipv4Addr) {
        let a = addr as usize;
        self.mem[a..a + 4].copy_from_slice(&ip.octets());
    }
}
