//! Host address seed and user overrides.
//!
//! [`NetConfig`] is what the host looks like (discovered best-effort), [`Settings`] is what the
//! user asked for. [`DeviceConfig::addresses`] merges both into the values the chip is seeded with.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::probe::{HostProbe, Reachability};

/// Locally administered MAC used when the host's hardware address cannot be read.
pub const FALLBACK_MAC: [u8; 6] = [0x02, 0x4B, 0x43, 0x4E, 0x45, 0x54];

const DEFAULT_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

/// Addresses of the host machine the emulator runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetConfig {
    pub mac: Option<[u8; 6]>,
    pub ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
}

impl NetConfig {
    /// Best-effort discovery of the outbound interface. Never fails; unknown values stay `None`.
    pub fn discover() -> Self {
        let ip = outbound_ipv4();
        let route = ip.and_then(|ip| {
            std::fs::read_to_string("/proc/net/route")
                .ok()
                .and_then(|table| route_for(&table, ip))
        });
        let mac = route
            .as_ref()
            .and_then(|(iface, _)| read_mac(iface))
            .or_else(any_interface_mac);
        let subnet_mask = Some(
            route
                .map(|(_, mask)| mask)
                .filter(|mask| (16..32).contains(&mask_prefix_len(*mask)))
                .unwrap_or(DEFAULT_SUBNET_MASK),
        );
        let dns_server = std::fs::read_to_string("/etc/resolv.conf")
            .ok()
            .and_then(|text| nameserver_from_resolv_conf(&text, ip));

        let config = Self {
            mac,
            ip,
            subnet_mask,
            dns_server,
        };
        debug!(?config, "discovered host network configuration");
        config
    }
}

/// User-facing overrides, read from `KCNET_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub auto_config: bool,
    pub ip_address: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_config: true,
            ip_address: None,
            subnet_mask: None,
            gateway: None,
            dns_server: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let auto_config = match lookup("KCNET_AUTO_CONFIG") {
            None => true,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "" | "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidEnv("KCNET_AUTO_CONFIG")),
            },
        };
        let ip = |name: &'static str| -> Result<Option<Ipv4Addr>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv(name)),
            }
        };

        Ok(Self {
            auto_config,
            ip_address: ip("KCNET_IP_ADDRESS")?,
            subnet_mask: ip("KCNET_SUBNET_MASK")?,
            gateway: ip("KCNET_GATEWAY")?,
            dns_server: ip("KCNET_DNS_SERVER")?,
        })
    }
}

/// The values written into `SHAR`/`SIPR`/`SUBR`/`GAR` on a cold reset, plus the DNS server handed
/// out by DHCP and the firmware's IP slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPlan {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Option<Ipv4Addr>,
}

#[derive(Clone)]
pub struct DeviceConfig {
    pub host: NetConfig,
    pub settings: Settings,
    pub reachability: Arc<dyn Reachability>,
    /// Re-reads `host` on every power-on reset. `None` keeps the addresses given here.
    pub rediscover: Option<fn() -> NetConfig>,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("host", &self.host)
            .field("settings", &self.settings)
            .field("rediscover", &self.rediscover.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceConfig {
    pub fn new(host: NetConfig, settings: Settings) -> Self {
        Self {
            host,
            settings,
            reachability: Arc::new(HostProbe),
            rediscover: None,
        }
    }

    /// Discovered host addresses plus `KCNET_*` overrides. The host is discovered again on each
    /// power-on reset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(NetConfig::discover(), Settings::from_env()?)
            .with_rediscovery(NetConfig::discover))
    }

    pub fn with_rediscovery(mut self, discover: fn() -> NetConfig) -> Self {
        self.rediscover = Some(discover);
        self
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Merges manual settings over discovered values. With auto-configuration off only the
    /// manual values (and the MAC) are used.
    pub fn addresses(&self) -> AddressPlan {
        let auto = self.settings.auto_config;
        let discovered = |value: Option<Ipv4Addr>| if auto { value } else { None };

        AddressPlan {
            mac: self.host.mac.unwrap_or(FALLBACK_MAC),
            ip: self
                .settings
                .ip_address
                .or(discovered(self.host.ip))
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            subnet_mask: self
                .settings
                .subnet_mask
                .or(discovered(self.host.subnet_mask))
                .unwrap_or(if auto {
                    DEFAULT_SUBNET_MASK
                } else {
                    Ipv4Addr::UNSPECIFIED
                }),
            gateway: self.settings.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            dns_server: self.settings.dns_server.or(discovered(self.host.dns_server)),
        }
    }
}

/// Picks the source address the host would use for outbound traffic. `connect` on a UDP socket
/// only selects a route; nothing is sent.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Finds the interface and netmask of the non-default route covering `ip` in a
/// `/proc/net/route` table.
pub(crate) fn route_for(table: &str, ip: Ipv4Addr) -> Option<(String, Ipv4Addr)> {
    let ip = u32::from(ip);
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let iface = cols.first()?;
            let dest = parse_route_hex(cols.get(1)?)?;
            let mask = parse_route_hex(cols.get(7)?)?;
            Some((iface.to_string(), dest, mask))
        })
        .filter(|(_, dest, mask)| u32::from(*mask) != 0 && ip & u32::from(*mask) == u32::from(*dest))
        .max_by_key(|(_, _, mask)| mask_prefix_len(*mask))
        .map(|(iface, _, mask)| (iface, mask))
}

/// `/proc/net/route` prints addresses as the raw in-memory `u32`, i.e. network byte order read
/// as a native integer.
fn parse_route_hex(field: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(field, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_ne_bytes()))
}

fn mask_prefix_len(mask: Ipv4Addr) -> u32 {
    u32::from(mask).leading_ones()
}

fn read_mac(iface: &str) -> Option<[u8; 6]> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{iface}/address")).ok()?;
    parse_mac(&text)
}

fn any_interface_mac() -> Option<[u8; 6]> {
    let mut fallback = None;
    for entry in std::fs::read_dir("/sys/class/net").ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(mac) = read_mac(&name) else {
            continue;
        };
        let up = std::fs::read_to_string(entry.path().join("operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false);
        if up {
            return Some(mac);
        }
        fallback.get_or_insert(mac);
    }
    fallback
}

/// Parses `aa:bb:cc:dd:ee:ff`, rejecting the all-zero loopback address.
pub(crate) fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() || mac == [0; 6] {
        return None;
    }
    Some(mac)
}

/// Picks the IPv4 nameserver sharing the longest prefix with `local`, or the first one listed.
pub(crate) fn nameserver_from_resolv_conf(text: &str, local: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    let servers = text.lines().filter_map(|line| {
        let line = line.split(['#', ';']).next()?.trim();
        let mut words = line.split_whitespace();
        if words.next()? != "nameserver" {
            return None;
        }
        words.next()?.parse::<Ipv4Addr>().ok()
    });

    let Some(local) = local else {
        return servers.into_iter().next();
    };
    let shared_octets = |server: &Ipv4Addr| {
        server
            .octets()
            .iter()
            .zip(local.octets())
            .take_while(|(a, b)| **a == *b)
            .count()
    };
    // `max_by_key` keeps the last maximum; reverse so the earliest entry wins ties.
    let servers: Vec<Ipv4Addr> = servers.collect();
    servers.into_iter().rev().max_by_key(shared_octets)
}
