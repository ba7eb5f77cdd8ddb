//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMP packet parsing and the handful of replies the stack
//! emits: echo replies and time-exceeded notifications. Inbound error messages are
//! turned into [`IcmpReport`]s and handed up the stack.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NetError, Result};
use crate::network::checksum;

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// Code for "time to live exceeded in transit".
pub const ICMP_CODE_TTL_EXCEEDED: u8 = 0;

/// Bytes of the offending datagram's payload quoted in an error message.
const QUOTED_PAYLOAD_LEN: usize = 8;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,
    pub msg_code: u8,
    pub checksum: u16,
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Parse ICMP header from byte slice
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(NetError::MalformedPacket("shorter than ICMP header"));
        }

        Ok(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: [data[4], data[5], data[6], data[7]],
        })
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }
}

/// ICMP messages reported up the stack rather than answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpReport {
    EchoReply {
        from: Ipv4Addr,
        identifier: u16,
        sequence: u16,
    },
    DestinationUnreachable {
        from: Ipv4Addr,
        code: u8,
        quoted: Vec<u8>,
    },
    TimeExceeded {
        from: Ipv4Addr,
        code: u8,
        quoted: Vec<u8>,
    },
}

impl IcmpReport {
    /// Classify an inbound ICMP message that is not an echo request.
    pub fn from_message(from: Ipv4Addr, header: &IcmpHeader, body: &[u8]) -> Result<Self> {
        match header.msg_type {
            ICMP_TYPE_ECHO_REPLY => Ok(IcmpReport::EchoReply {
                from,
                identifier: header.identifier(),
                sequence: header.sequence(),
            }),
            ICMP_TYPE_DEST_UNREACHABLE => Ok(IcmpReport::DestinationUnreachable {
                from,
                code: header.msg_code,
                quoted: body.to_vec(),
            }),
            ICMP_TYPE_TIME_EXCEEDED => Ok(IcmpReport::TimeExceeded {
                from,
                code: header.msg_code,
                quoted: body.to_vec(),
            }),
            _ => Err(NetError::UnsupportedMessage("ICMP type")),
        }
    }
}

pub struct IcmpUtils {}

impl IcmpUtils {
    /// Build the ICMP body of an echo reply answering `request` (ICMP header + data).
    pub fn echo_reply(request: &[u8]) -> Result<Vec<u8>> {
        let header = IcmpHeader::parse(request)?;
        if !header.is_echo_request() {
            return Err(NetError::UnsupportedMessage("not an echo request"));
        }

        let mut reply = request.to_vec();
        reply[0] = ICMP_TYPE_ECHO_REPLY;
        reply[1] = 0;
        Self::fill_checksum(&mut reply);
        Ok(reply)
    }

    /// Build a time-exceeded message quoting the offending header and the first
    /// eight bytes of its payload.
    pub fn time_exceeded(original: &[u8], header_len: usize) -> Vec<u8> {
        let quoted_len = (header_len + QUOTED_PAYLOAD_LEN).min(original.len());

        let mut message = Vec::with_capacity(ICMP_HEADER_LEN + quoted_len);
        message.extend_from_slice(
            &IcmpHeader {
                msg_type: ICMP_TYPE_TIME_EXCEEDED,
                msg_code: ICMP_CODE_TTL_EXCEEDED,
                checksum: 0,
                rest: [0; 4],
            }
            .to_bytes(),
        );
        message.extend_from_slice(&original[..quoted_len]);
        Self::fill_checksum(&mut message);
        message
    }

    fn fill_checksum(message: &mut [u8]) {
        message[2..4].fill(0);
        let sum = checksum(message);
        BigEndian::write_u16(&mut message[2..4], sum);
    }
}
