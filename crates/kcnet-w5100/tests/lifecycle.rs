mod common;

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU8, Ordering};

use common::{free_udp_port, host_config, Guest, MODE_TCP, MODE_UDP};
use kcnet_w5100::regs::*;
use kcnet_w5100::NetConfig;

const OWN: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

#[test]
fn power_on_defaults() {
    let guest = Guest::new(OWN);
    assert_eq!(guest.read_ip(REG_SIPR), OWN);
    assert_eq!(guest.read_ip(REG_SUBR), Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(guest.read_ip(REG_GAR), Ipv4Addr::UNSPECIFIED);
    let mac: Vec<u8> = (0..6).map(|i| guest.read(REG_SHAR + i)).collect();
    assert_eq!(mac, [0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

    assert_eq!(guest.read_word(REG_RTR), 0x07D0);
    assert_eq!(guest.read(REG_RCR), 8);
    assert_eq!(guest.read(REG_RMSR), 0x55);
    assert_eq!(guest.read(REG_TMSR), 0x55);
    assert_eq!(guest.read(REG_PTIMER), 0x28);
    for n in 0..SOCKET_COUNT {
        assert_eq!(guest.status(n), SocketStatus::Closed as u8);
        assert_eq!(guest.read(socket_reg(n, SN_TTL)), 0x80);
        assert_eq!(guest.read(socket_reg(n, SN_DHAR)), 0xFF);
        assert_eq!(guest.read_word(socket_reg(n, SN_TX_FSR)), 0x0800);
        assert_eq!(guest.read_word(socket_reg(n, SN_RX_RSR)), 0);
    }
    assert_eq!(guest.dev.addresses().ip, OWN);
}

#[test]
fn soft_reset_closes_sockets_but_keeps_addresses() {
    let mut guest = Guest::new(OWN);
    guest.write_ip(REG_SIPR, Ipv4Addr::new(10, 1, 1, 1));
    guest.write_word(REG_RTR, 1234);

    let port = free_udp_port();
    guest.open(0, MODE_UDP, port);
    guest.open(1, MODE_TCP, 0);
    assert_eq!(guest.status(1), SocketStatus::Init as u8);

    guest.write(REG_MR, MR_RESET);
    assert_eq!(guest.read(REG_MR) & MR_RESET, 0);
    assert_eq!(guest.read_ip(REG_SIPR), Ipv4Addr::new(10, 1, 1, 1));
    assert_eq!(guest.read_word(REG_RTR), 0x07D0);
    assert_eq!(guest.status(0), SocketStatus::Closed as u8);
    assert_eq!(guest.status(1), SocketStatus::Closed as u8);

    // The host port was given back.
    guest.wait_for("udp port released", |_| {
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    });
}

#[test]
fn cold_reset_reseeds_the_window() {
    let mut guest = Guest::new(OWN);
    guest.write_ip(REG_SIPR, Ipv4Addr::new(10, 1, 1, 1));
    guest.write(0x4000, 0xAB);

    guest.dev.reset(true);
    assert_eq!(guest.read_ip(REG_SIPR), OWN);
    assert_eq!(guest.read(0x4000), 0);

    guest.write_ip(REG_SIPR, Ipv4Addr::new(10, 1, 1, 1));
    guest.dev.reset(false);
    assert_eq!(guest.read_ip(REG_SIPR), Ipv4Addr::new(10, 1, 1, 1));
}

static DISCOVERIES: AtomicU8 = AtomicU8::new(0);

/// A host whose address changes every time it is looked at.
fn roaming_host() -> NetConfig {
    let n = DISCOVERIES.fetch_add(1, Ordering::SeqCst) + 1;
    NetConfig {
        mac: Some([0x02, 0x00, 0x00, 0x00, 0x00, n]),
        ip: Some(Ipv4Addr::new(192, 168, 7, n)),
        subnet_mask: Some(Ipv4Addr::new(255, 255, 0, 0)),
        dns_server: None,
    }
}

#[test]
fn power_on_reset_rediscovers_the_host() {
    let mut guest = Guest::with_config(host_config(OWN).with_rediscovery(roaming_host));
    assert_eq!(guest.read_ip(REG_SIPR), OWN);

    guest.dev.reset(true);
    assert_eq!(guest.read_ip(REG_SIPR), Ipv4Addr::new(192, 168, 7, 1));
    assert_eq!(guest.read_ip(REG_SUBR), Ipv4Addr::new(255, 255, 0, 0));
    assert_eq!(guest.read(REG_SHAR + 5), 1);
    assert_eq!(guest.dev.addresses().ip, Ipv4Addr::new(192, 168, 7, 1));

    // Soft resets leave discovery alone.
    guest.dev.reset(false);
    guest.write(REG_MR, MR_RESET);
    assert_eq!(guest.read_ip(REG_SIPR), Ipv4Addr::new(192, 168, 7, 1));

    guest.dev.reset(true);
    assert_eq!(guest.read_ip(REG_SIPR), Ipv4Addr::new(192, 168, 7, 2));
}

#[test]
fn sockets_work_again_after_a_reset() {
    let mut guest = Guest::new(OWN);
    guest.write(REG_MR, MR_RESET);

    let port = free_udp_port();
    guest.open(2, MODE_UDP, port);
    let peer = UdpSocket::bind((OWN, 0)).unwrap();
    peer.send_to(b"still alive", (OWN, port)).unwrap();
    let data = guest.receive(2);
    assert_eq!(&data[8..], b"still alive");
}

#[test]
fn reopening_an_open_socket_closes_it() {
    let mut guest = Guest::new(OWN);
    guest.open(0, MODE_UDP, free_udp_port());
    assert_eq!(guest.status(0), SocketStatus::Udp as u8);

    guest.command(0, Command::Open);
    assert_eq!(guest.status(0), SocketStatus::Closed as u8);
    assert_eq!(guest.read(socket_reg(0, SN_CR)), 0);
}

#[test]
fn invalid_commands_are_cleared() {
    let mut guest = Guest::new(OWN);
    guest.write(socket_reg(0, SN_CR), 0x77);
    assert_eq!(guest.read(socket_reg(0, SN_CR)), 0);

    // CONNECT outside INIT.
    guest.command(0, Command::Connect);
    assert_eq!(guest.read(socket_reg(0, SN_CR)), 0);
    assert_eq!(guest.status(0), SocketStatus::Closed as u8);
}

#[test]
fn irq_follows_ir_and_imr() {
    let mut guest = Guest::new(OWN);
    guest.write(REG_IMR, 0);
    guest.open(1, MODE_UDP, 0);
    // SEND_KEEP without a TCP connection raises TIMEOUT right away.
    guest.command(1, Command::SendKeep);
    assert_eq!(guest.interrupts(1), SocketInterrupt::TIMEOUT);
    assert_eq!(guest.read(REG_IR), 1 << 1);
    assert!(!guest.dev.irq_pending());

    guest.write(REG_IMR, 1 << 1);
    assert!(guest.dev.irq_pending());

    guest.clear_interrupts(1, SocketInterrupt::TIMEOUT);
    assert_eq!(guest.read(REG_IR), 0);
    assert!(!guest.dev.irq_pending());
}

#[test]
fn destroy_is_idempotent_and_frees_ports() {
    let mut guest = Guest::new(OWN);
    let port = free_udp_port();
    guest.open(0, MODE_UDP, port);
    let reserved = guest.dev.reserve_port().expect("reserved port");

    guest.dev.destroy();
    guest.dev.destroy();
    assert_eq!(guest.status(0), SocketStatus::Closed as u8);
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, reserved)).expect("reserved port released");
    guest.wait_for("socket port released", |_| {
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    });
}
