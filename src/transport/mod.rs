//! Transport layer protocols implementation
//!
//! This module contains implementations for transport layer protocols:
//! - TCP: Transmission Control Protocol (passive open, simplified close)
//! - UDP: User Datagram Protocol

pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use tcp::{ConnectionKey, ConnectionTable, TcpConnection, TcpHeader, TcpSegment, TcpState};
pub use udp::{UdpDatagram, UdpHeader, UdpUtils};
