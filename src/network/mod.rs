//! Network layer protocols implementation
//!
//! This module contains implementations for network layer protocols:
//! - IPv4: Internet Protocol version 4
//! - ICMP: Internet Control Message Protocol
//! - Routing: the first-match route table used by the forwarding path

pub mod icmp;
pub mod ipv4;
pub mod route;

use std::net::Ipv4Addr;

// Re-export commonly used items
pub use icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use ipv4::{protocol, Ipv4Header};
pub use route::{RouteEntry, RouteTable};

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// This is used for IP, ICMP, TCP and UDP checksums.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// Checksum of a TCP or UDP segment including the IPv4 pseudo header.
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(0, &pseudo);
    fold(sum_words(sum, segment))
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    // Process data in 2-byte chunks
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        // Keep the accumulator from overflowing on jumbo buffers.
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    // Odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Pack four dotted-quad octets into a host-order 32-bit address.
pub fn pack_addr(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_be_bytes([a, b, c, d])
}

/// Split a host-order 32-bit address back into its octets.
pub fn unpack_addr(addr: u32) -> [u8; 4] {
    addr.to_be_bytes()
}

/// Apply `mask` to `addr`.
pub fn network_of(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(mask))
}
