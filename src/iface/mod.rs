//! Network interface abstraction layer
//!
//! This module provides abstractions for network interfaces and packet processing:
//! - Interface records, addressing and counters
//! - The IP layer: local delivery, forwarding and protocol dispatch
//! - A TUN device link

pub mod interface;
pub mod ipv4;
pub mod tun;

// Re-export commonly used items
pub use interface::{
    Duplex, InterfaceCounters, InterfaceTable, MacAddr, NetworkInterface, ParseMacError,
};
pub use tun::{TunEgress, TunLink};
