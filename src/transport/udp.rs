//! UDP (User Datagram Protocol) implementation
//!
//! This module provides UDP header parsing, validation and datagram construction.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NetError, Result};
use crate::network::{protocol, pseudo_header_checksum};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < UDP_HEADER_LEN {
            return Err(NetError::MalformedPacket("shorter than UDP header"));
        }

        Ok(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert UDP header to bytes
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// A validated datagram, addressed, with its payload borrowed from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Validate and parse the UDP portion of an IPv4 payload.
    pub fn parse(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, data: &'a [u8]) -> Result<Self> {
        let header = UdpHeader::parse(data)?;

        let length = header.length as usize;
        if length < UDP_HEADER_LEN || length > data.len() {
            return Err(NetError::MalformedPacket("UDP length mismatch"));
        }
        let datagram = &data[..length];

        // A zero checksum means the sender did not compute one.
        if header.checksum != 0 {
            let computed = pseudo_header_checksum(src_addr, dst_addr, protocol::UDP, datagram);
            if computed != 0 {
                return Err(NetError::ChecksumFailed {
                    expected: header.checksum,
                    computed,
                });
            }
        }

        Ok(UdpDatagram {
            src_addr,
            dst_addr,
            src_port: header.src_port,
            dst_port: header.dst_port,
            payload: &datagram[UDP_HEADER_LEN..],
        })
    }
}

pub struct UdpUtils {}

impl UdpUtils {
    /// Creates a complete UDP datagram (header + payload) with its checksum.
    pub fn build_datagram(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = UDP_HEADER_LEN + payload.len();
        let header = UdpHeader {
            src_port,
            dst_port,
            length: total_len as u16,
            checksum: 0,
        };

        let mut packet = Vec::with_capacity(total_len);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);

        let sum = match pseudo_header_checksum(src_addr, dst_addr, protocol::UDP, &packet) {
            // Zero is reserved for "no checksum"; RFC 768 transmits it as all ones.
            0 => 0xFFFF,
            sum => sum,
        };
        BigEndian::write_u16(&mut packet[6..8], sum);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn built_datagram_validates() {
        let bytes = UdpUtils::build_datagram(A, B, 4000, 53, b"query");
        let dgram = UdpDatagram::parse(A, B, &bytes).unwrap();
        assert_eq!(dgram.src_port, 4000);
        assert_eq!(dgram.dst_port, 53);
        assert_eq!(dgram.payload, b"query");
    }

    #[test]
    fn zero_checksum_is_not_verified() {
        let mut bytes = UdpUtils::build_datagram(A, B, 1, 2, b"x");
        bytes[6..8].fill(0);
        assert!(UdpDatagram::parse(Ipv4Addr::new(9, 9, 9, 9), B, &bytes).is_ok());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut bytes = UdpUtils::build_datagram(A, B, 1, 2, b"abcd");
        bytes[9] ^= 0xFF;
        assert!(matches!(
            UdpDatagram::parse(A, B, &bytes),
            Err(NetError::ChecksumFailed { .. })
        ));
    }

    #[test]
    fn length_field_beyond_buffer_is_malformed() {
        let mut bytes = UdpUtils::build_datagram(A, B, 1, 2, b"abcd");
        bytes[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            UdpDatagram::parse(A, B, &bytes),
            Err(NetError::MalformedPacket(_))
        ));
    }
}
