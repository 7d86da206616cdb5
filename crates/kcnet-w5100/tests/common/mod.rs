#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, FutureExt};
use kcnet_w5100::regs::*;
use kcnet_w5100::{DeviceConfig, NetConfig, ProbeOutcome, Reachability, Settings, W5100};

pub const MODE_TCP: u8 = 0x01;
pub const MODE_UDP: u8 = 0x02;
pub const MODE_IPRAW: u8 = 0x03;

const RING_SIZE: usize = 0x800;
const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Answers probes from a fixed table instead of touching the network.
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub reachable: Vec<Ipv4Addr>,
    pub failing: Vec<Ipv4Addr>,
}

impl Reachability for FakeProbe {
    fn probe(&self, target: Ipv4Addr, _timeout: Duration) -> BoxFuture<'static, ProbeOutcome> {
        let outcome = if self.reachable.contains(&target) {
            ProbeOutcome::Reachable
        } else if self.failing.contains(&target) {
            ProbeOutcome::Error
        } else {
            ProbeOutcome::Unreachable
        };
        future::ready(outcome).boxed()
    }
}

pub fn host_config(ip: Ipv4Addr) -> DeviceConfig {
    let host = NetConfig {
        mac: Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        ip: Some(ip),
        subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
        dns_server: Some(Ipv4Addr::new(9, 9, 9, 9)),
    };
    DeviceConfig::new(host, Settings::default())
}

/// Drives the chip the way guest firmware does: byte by byte through the register window.
pub struct Guest {
    pub dev: W5100,
}

impl Guest {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self::with_config(host_config(ip))
    }

    pub fn with_probe(ip: Ipv4Addr, probe: FakeProbe) -> Self {
        Self::with_config(host_config(ip).with_reachability(Arc::new(probe)))
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        init_tracing();
        Self {
            dev: W5100::new(config).expect("device runtime"),
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        self.dev.read_byte(addr)
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        self.dev.write_byte(addr, value);
    }

    pub fn read_word(&self, addr: u16) -> u16 {
        let hi = self.read(addr);
        let lo = self.read(addr + 1);
        u16::from_be_bytes([hi, lo])
    }

    pub fn write_word(&mut self, addr: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.write(addr, hi);
        self.write(addr + 1, lo);
    }

    pub fn write_ip(&mut self, addr: u16, ip: Ipv4Addr) {
        for (i, octet) in ip.octets().into_iter().enumerate() {
            self.write(addr + i as u16, octet);
        }
    }

    pub fn read_ip(&self, addr: u16) -> Ipv4Addr {
        Ipv4Addr::new(
            self.read(addr),
            self.read(addr + 1),
            self.read(addr + 2),
            self.read(addr + 3),
        )
    }

    pub fn status(&self, n: usize) -> u8 {
        self.read(socket_reg(n, SN_SR))
    }

    pub fn interrupts(&self, n: usize) -> SocketInterrupt {
        SocketInterrupt::from_bits_truncate(self.read(socket_reg(n, SN_IR)))
    }

    pub fn clear_interrupts(&mut self, n: usize, bits: SocketInterrupt) {
        self.write(socket_reg(n, SN_IR), bits.bits());
    }

    pub fn command(&mut self, n: usize, command: Command) {
        self.write(socket_reg(n, SN_CR), command as u8);
    }

    pub fn set_destination(&mut self, n: usize, dest: SocketAddrV4) {
        self.write_ip(socket_reg(n, SN_DIPR), *dest.ip());
        self.write_word(socket_reg(n, SN_DPORT), dest.port());
    }

    /// OPEN with the given mode and source port, then waits for the command to complete.
    pub fn open(&mut self, n: usize, mode: u8, port: u16) {
        self.write(socket_reg(n, SN_MR), mode);
        self.write_word(socket_reg(n, SN_PORT), port);
        self.command(n, Command::Open);
        self.wait_for("OPEN to complete", |g| g.read(socket_reg(n, SN_CR)) == 0);
    }

    pub fn wait_for(&self, what: &str, cond: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn wait_interrupt(&self, n: usize, any_of: SocketInterrupt) -> SocketInterrupt {
        self.wait_for("socket interrupt", |g| g.interrupts(n).intersects(any_of));
        self.interrupts(n)
    }

    /// Copies `data` into the TX ring and advances `Sn_TX_WR`.
    pub fn queue_tx(&mut self, n: usize, data: &[u8]) {
        let base = 0x4000 + n * RING_SIZE;
        let wr = self.read_word(socket_reg(n, SN_TX_WR));
        for (i, byte) in data.iter().enumerate() {
            let offset = (wr as usize + i) & (RING_SIZE - 1);
            self.write((base + offset) as u16, *byte);
        }
        self.write_word(socket_reg(n, SN_TX_WR), wr.wrapping_add(data.len() as u16));
    }

    /// Queues `data`, issues SEND and returns the completion interrupt.
    pub fn send(&mut self, n: usize, data: &[u8]) -> SocketInterrupt {
        self.clear_interrupts(n, SocketInterrupt::SEND_OK | SocketInterrupt::TIMEOUT);
        self.queue_tx(n, data);
        self.command(n, Command::Send);
        self.wait_interrupt(n, SocketInterrupt::SEND_OK | SocketInterrupt::TIMEOUT)
            & (SocketInterrupt::SEND_OK | SocketInterrupt::TIMEOUT)
    }

    /// Takes everything queued in the RX ring and advances `Sn_RX_RD`.
    pub fn take_rx(&mut self, n: usize) -> Vec<u8> {
        let base = 0x6000 + n * RING_SIZE;
        let len = self.read_word(socket_reg(n, SN_RX_RSR));
        let rd = self.read_word(socket_reg(n, SN_RX_RD));
        let data = (0..len as usize)
            .map(|i| self.read((base + ((rd as usize + i) & (RING_SIZE - 1))) as u16))
            .collect();
        self.write_word(socket_reg(n, SN_RX_RD), rd.wrapping_add(len));
        data
    }

    /// Waits for RECV, drains the ring and re-arms receive.
    pub fn receive(&mut self, n: usize) -> Vec<u8> {
        self.wait_interrupt(n, SocketInterrupt::RECV);
        self.clear_interrupts(n, SocketInterrupt::RECV);
        let data = self.take_rx(n);
        self.command(n, Command::Recv);
        data
    }
}

/// A port that was free a moment ago.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("ephemeral udp port")
}

pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("ephemeral tcp port")
}
