//! A small IPv4 router stack in Rust
//!
//! This library processes raw IPv4 datagrams and provides:
//! - IPv4 validation, local delivery and first-match forwarding
//! - ICMP echo replies and time-exceeded notices
//! - Passive-open TCP connection management
//! - A first-match firewall
//! - A caching DNS forwarder and a DHCP server
//! - A TUN device link

pub mod config;
pub mod error;
pub mod firewall;
pub mod iface;
pub mod network;
pub mod service;
pub mod stack;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigError, StackConfig};
pub use error::{NetError, Result, Table};
pub use firewall::{Action, Direction, FirewallEngine, FirewallRule, FlowTuple};
pub use iface::{MacAddr, NetworkInterface};
pub use network::icmp::IcmpReport;
pub use network::ipv4::Ipv4Header;
pub use service::dns::UpstreamQuery;
pub use stack::{
    Application, Disposition, Egress, Millis, NetworkStack, NullApplication, StackStats,
    SweepReport,
};
pub use transport::{ConnectionKey, TcpConnection, TcpState, UdpDatagram};
