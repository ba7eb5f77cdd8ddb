//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing, validation, and serialization.
//!
//! Features:
//! - Bounds-checked header parsing (network byte order throughout)
//! - Checksum calculation and validation over the on-wire header, options included
//! - Datagram construction with automatic length and checksum
//! - TTL decrement for the forwarding path

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NetError, Result};
use crate::network::checksum;

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
pub const DEFAULT_TTL: u8 = 64;

const CHECKSUM_RANGE: std::ops::Range<usize> = 10..12;
const TTL_OFFSET: usize = 8;

/// IPv4 packet header structure
///
/// Represents the IPv4 header as defined in RFC 791. Options, when present, are
/// covered by the checksum but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length, in 32-bit words
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header for a datagram carrying `payload_len` bytes.
    ///
    /// The checksum is left at zero; [`Ipv4Header::to_bytes`] does not fill it in.
    pub fn new(
        protocol: u8,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        id: u16,
        ttl: u8,
        payload_len: usize,
    ) -> Self {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: DEFAULT_IHL,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id,
            flags_frag_offset: flags::DONT_FRAGMENT,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    /// Parse an IPv4 header from the front of `data`.
    ///
    /// Rejects buffers that are shorter than the fixed header, that are not version 4,
    /// or whose length fields disagree with the buffer.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(NetError::MalformedPacket("shorter than IPv4 header"));
        }

        let version = data[0] >> 4;
        if version != IPV4_VERSION {
            return Err(NetError::MalformedPacket("not IPv4"));
        }

        let header = Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: read_addr(&data[12..16]),
            dst_addr: read_addr(&data[16..20]),
        };

        let header_len = header.header_len();
        if header_len < IPV4_HEADER_LEN {
            return Err(NetError::MalformedPacket("IHL below minimum"));
        }
        if header_len > data.len() {
            return Err(NetError::MalformedPacket("IHL beyond buffer"));
        }
        let total_len = header.total_len as usize;
        if total_len < header_len || total_len > data.len() {
            return Err(NetError::MalformedPacket("total length mismatch"));
        }

        Ok(header)
    }

    /// Serialize the fixed 20-byte header. Options are not emitted.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (self.version << 4) | DEFAULT_IHL;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src_addr.octets());
        bytes[16..20].copy_from_slice(&self.dst_addr.octets());
        bytes
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// True for any piece of a fragmented datagram: more-fragments set or a nonzero offset.
    pub fn is_fragment(&self) -> bool {
        self.flags_frag_offset & (flags::MORE_FRAGMENTS | flags::FRAGMENT_OFFSET_MASK) != 0
    }

    /// Get payload length (total length - header length)
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }
}

fn read_addr(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// A validated IPv4 datagram borrowed from the receive buffer.
#[derive(Debug, Clone)]
pub struct Ipv4Datagram<'a> {
    pub header: Ipv4Header,
    /// The on-wire header bytes, options included.
    pub header_bytes: &'a [u8],
    /// Payload, trimmed to the header's total length.
    pub payload: &'a [u8],
}

impl<'a> Ipv4Datagram<'a> {
    /// Parse and checksum-verify a datagram.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = Ipv4Header::parse(data)?;
        let header_len = header.header_len();
        let header_bytes = &data[..header_len];

        let computed = Ipv4Utils::header_checksum(header_bytes);
        if computed != header.checksum {
            return Err(NetError::ChecksumFailed {
                expected: header.checksum,
                computed,
            });
        }

        let payload = &data[header_len..header.total_len as usize];
        Ok(Ipv4Datagram {
            header,
            header_bytes,
            payload,
        })
    }

    /// The whole datagram as received (header and trimmed payload).
    pub fn len(&self) -> usize {
        self.header.total_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

pub struct Ipv4Utils {}

impl Ipv4Utils {
    /// Checksum of an on-wire header with its checksum field treated as zero.
    pub fn header_checksum(header_bytes: &[u8]) -> u16 {
        if header_bytes.len() < CHECKSUM_RANGE.end {
            return checksum(header_bytes);
        }
        let mut scratch = [0u8; 60];
        let len = header_bytes.len().min(scratch.len());
        scratch[..len].copy_from_slice(&header_bytes[..len]);
        scratch[CHECKSUM_RANGE].fill(0);
        checksum(&scratch[..len])
    }

    /// Create a complete IPv4 datagram around `payload`.
    ///
    /// The total length and header checksum are filled in.
    pub fn build_packet(
        protocol: u8,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        id: u16,
        ttl: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut header = Ipv4Header::new(protocol, src_addr, dst_addr, id, ttl, payload.len());
        header.checksum = checksum(&header.to_bytes());

        let mut packet = Vec::with_capacity(header.total_len as usize);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Decrement the TTL of an on-wire datagram and rewrite its checksum.
    ///
    /// Returns the new TTL. A datagram whose TTL would reach zero is left untouched
    /// and `None` is returned.
    pub fn decrement_ttl(packet: &mut [u8]) -> Option<u8> {
        let header_len = ((packet.first()? & 0x0F) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
            return None;
        }

        let ttl = packet[TTL_OFFSET].checked_sub(1).filter(|ttl| *ttl > 0)?;
        packet[TTL_OFFSET] = ttl;
        let sum = Self::header_checksum(&packet[..header_len]);
        BigEndian::write_u16(&mut packet[CHECKSUM_RANGE], sum);
        Some(ttl)
    }
}
