//! Stack configuration, loadable from TOML.
//!
//! Every section is optional; missing values fall back to the defaults below.
//!
//! ```toml
//! [limits]
//! max_connections = 100
//!
//! [tcp]
//! idle_timeout_ms = 30000
//!
//! [[interfaces]]
//! name = "eth0"
//! mac = "02:00:00:00:00:01"
//! address = "192.168.1.1"
//! netmask = "255.255.255.0"
//! gateway = "192.168.1.254"
//!
//! [[firewall.rules]]
//! dst_port = 23
//! protocol = 6
//! action = "deny"
//! direction = "inbound"
//! description = "No telnet"
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::firewall::{Action, Direction, FirewallRule};
use crate::iface::MacAddr;
use crate::network::{pack_addr, protocol};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid DHCP range {start} - {end}")]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_interfaces: usize,
    pub max_connections: usize,
    pub max_routes: usize,
    pub max_dns_entries: usize,
    pub max_leases: usize,
    pub max_firewall_rules: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_interfaces: 10,
            max_connections: 100,
            max_routes: 50,
            max_dns_entries: 100,
            max_leases: 50,
            max_firewall_rules: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub idle_timeout_ms: u64,
    pub recv_buffer_capacity: usize,
    pub window: u16,
    /// Seed for initial sequence numbers.
    pub initial_sequence: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            idle_timeout_ms: 30_000,
            recv_buffer_capacity: 1500,
            window: 65535,
            initial_sequence: 0x1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticDnsEntry {
    pub name: String,
    pub address: Ipv4Addr,
    #[serde(default = "default_dns_ttl")]
    pub ttl_secs: u32,
}

fn default_dns_ttl() -> u32 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub upstream: Ipv4Addr,
    pub entries: Vec<StaticDnsEntry>,
    /// How long a client waits on an upstream answer before its query is dropped.
    pub query_timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        let entry = |name: &str, address: u32| StaticDnsEntry {
            name: name.to_string(),
            address: Ipv4Addr::from(address),
            ttl_secs: default_dns_ttl(),
        };
        DnsConfig {
            upstream: Ipv4Addr::new(8, 8, 8, 8),
            entries: vec![
                entry("localhost", pack_addr(127, 0, 0, 1)),
                entry("google.com", pack_addr(8, 8, 8, 8)),
                entry("microsoft.com", pack_addr(13, 107, 42, 14)),
            ],
            query_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub enabled: bool,
    /// Server identifier; unspecified means "the address of the receiving interface".
    pub server_address: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub lease_secs: u32,
    pub offer_secs: u32,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        DhcpConfig {
            enabled: true,
            server_address: Ipv4Addr::UNSPECIFIED,
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 199),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(192, 168, 1, 1),
            dns_server: Ipv4Addr::new(192, 168, 1, 1),
            lease_secs: 86_400,
            offer_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub rules: Vec<FirewallRule>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        let allow = |dst_port: u16, proto: u8, description: &str| {
            FirewallRule::from_raw(
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
                dst_port,
                proto,
                Action::Allow,
                Direction::Inbound,
                description,
            )
        };
        FirewallConfig {
            rules: vec![
                allow(80, protocol::TCP, "Allow HTTP"),
                allow(443, protocol::TCP, "Allow HTTPS"),
                allow(53, protocol::UDP, "Allow DNS"),
                allow(67, protocol::UDP, "Allow DHCP"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub mac: MacAddr,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns1: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns2: Option<Ipv4Addr>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface: String,
    #[serde(default)]
    pub metric: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub limits: Limits,
    pub tcp: TcpConfig,
    pub dns: DnsConfig,
    pub dhcp: DhcpConfig,
    pub firewall: FirewallConfig,
    pub interfaces: Vec<InterfaceConfig>,
    pub routes: Vec<RouteConfig>,
}

impl StackConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: StackConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (start, end) = (self.dhcp.range_start, self.dhcp.range_end);
        if u32::from(start) > u32::from(end) {
            return Err(ConfigError::InvalidRange { start, end });
        }
        Ok(())
    }
}
