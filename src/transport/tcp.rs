//! TCP (Transmission Control Protocol) implementation
//!
//! This module provides TCP segment parsing and building, sequence-number
//! arithmetic, the per-peer connection record with its state machine, and the
//! bounded connection table.
//!
//! Only the passive side is modeled: a connection comes into being when a SYN is
//! admitted and ends when its idle timer runs out.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use crate::error::{NetError, Result, Table};
use crate::network::{protocol, pseudo_header_checksum};
use crate::stack::Millis;

pub const TCP_HEADER_LEN: usize = 20;

/// TCP flag bits, as found in the low byte of the offset/flags word.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// `a < b` in sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a > b` in sequence space.
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `a >= b` in sequence space.
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// TCP packet header structure
///
/// Represents the TCP header as defined in RFC 793. Options are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (3 bits) + Flags (9 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Parse TCP header from byte slice
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_HEADER_LEN {
            return Err(NetError::MalformedPacket("shorter than TCP header"));
        }

        let header = TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            data_offset_and_flags: BigEndian::read_u16(&data[12..14]),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
        };

        let offset = header.data_offset();
        if offset < TCP_HEADER_LEN || offset > data.len() {
            return Err(NetError::MalformedPacket("bad TCP data offset"));
        }
        Ok(header)
    }

    /// Convert TCP header to bytes
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u32(&mut bytes[4..8], self.seq_number);
        BigEndian::write_u32(&mut bytes[8..12], self.ack_number);
        BigEndian::write_u16(&mut bytes[12..14], self.data_offset_and_flags);
        BigEndian::write_u16(&mut bytes[14..16], self.window_size);
        BigEndian::write_u16(&mut bytes[16..18], self.checksum);
        BigEndian::write_u16(&mut bytes[18..20], self.urgent_ptr);
        bytes
    }

    pub fn flags(&self) -> u8 {
        (self.data_offset_and_flags & 0x3F) as u8
    }

    fn has(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has(flags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.has(flags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.has(flags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.has(flags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.has(flags::PSH)
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }
}

/// A parsed segment borrowed from the datagram payload.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub header: TcpHeader,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parse a segment and verify its checksum against the IPv4 pseudo header.
    pub fn parse(src: Ipv4Addr, dst: Ipv4Addr, data: &'a [u8]) -> Result<Self> {
        let header = TcpHeader::parse(data)?;

        let computed = pseudo_header_checksum(src, dst, protocol::TCP, data);
        if computed != 0 {
            return Err(NetError::ChecksumFailed {
                expected: header.checksum,
                computed,
            });
        }

        Ok(TcpSegment {
            header,
            payload: &data[header.data_offset()..],
        })
    }
}

pub struct TcpUtils {}

impl TcpUtils {
    /// Build a checksummed TCP segment (header + payload).
    #[allow(clippy::too_many_arguments)]
    pub fn build_segment(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        flags: u8,
        window_size: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            data_offset_and_flags: ((TCP_HEADER_LEN as u16 / 4) << 12) | flags as u16,
            window_size,
            checksum: 0,
            urgent_ptr: 0,
        };

        let mut segment = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
        segment.extend_from_slice(&header.to_bytes());
        segment.extend_from_slice(payload);

        let sum = pseudo_header_checksum(src, dst, protocol::TCP, &segment);
        BigEndian::write_u16(&mut segment[16..18], sum);
        segment
    }
}

/// Connection states. `Listen` and `Closed` are implicit: no record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
}

/// Connections are keyed by the remote endpoint only; the stack has one local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
}

/// Parameters applied to every new connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpParams {
    pub idle_timeout_ms: u64,
    pub recv_buffer_capacity: usize,
    pub window: u16,
}

/// A segment the connection wants sent, before addressing and checksumming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
}

/// What processing one inbound segment produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub replies: Vec<Reply>,
    /// The segment's payload was accepted and should go to the application.
    pub deliver: bool,
}

#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub key: ConnectionKey,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub state: TcpState,
    /// Our initial sequence number.
    pub iss: u32,
    /// Next sequence number we will send.
    pub snd_nxt: u32,
    /// Next sequence number expected from the peer; the acknowledgment we send.
    pub rcv_nxt: u32,
    /// Highest acknowledgment the peer has sent us.
    pub peer_acked: u32,
    pub peer_window: u16,
    pub window: u16,
    recv_buffer: Vec<u8>,
    recv_capacity: usize,
    pub retransmit_count: u32,
    pub last_activity: Millis,
    pub idle_timeout_ms: u64,
}

impl TcpConnection {
    /// Create a record for an admitted SYN and the SYN-ACK answering it.
    pub fn accept(
        key: ConnectionKey,
        local_addr: Ipv4Addr,
        syn: &TcpHeader,
        iss: u32,
        params: TcpParams,
        now: Millis,
    ) -> (Self, Reply) {
        let rcv_nxt = syn.seq_number.wrapping_add(1);
        let conn = TcpConnection {
            key,
            local_addr,
            local_port: syn.dst_port,
            state: TcpState::SynReceived,
            iss,
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt,
            peer_acked: iss,
            peer_window: syn.window_size,
            window: params.window,
            recv_buffer: Vec::new(),
            recv_capacity: params.recv_buffer_capacity,
            retransmit_count: 0,
            last_activity: now,
            idle_timeout_ms: params.idle_timeout_ms,
        };
        let syn_ack = conn.syn_ack();
        (conn, syn_ack)
    }

    fn syn_ack(&self) -> Reply {
        Reply {
            flags: flags::SYN | flags::ACK,
            seq: self.iss,
            ack: self.rcv_nxt,
        }
    }

    fn ack(&self) -> Reply {
        Reply {
            flags: flags::ACK,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
        }
    }

    fn transition(&mut self, to: TcpState) {
        debug!(
            peer = %self.key.peer_addr,
            port = self.key.peer_port,
            "{:?} -> {:?}",
            self.state,
            to
        );
        self.state = to;
    }

    /// Run the state machine for one inbound segment on an existing record.
    pub fn on_segment(&mut self, segment: &TcpSegment<'_>, now: Millis) -> SegmentOutcome {
        let header = &segment.header;
        let mut outcome = SegmentOutcome::default();
        self.last_activity = now;
        self.peer_window = header.window_size;

        if header.is_syn() && self.state == TcpState::SynReceived {
            // The peer did not see our SYN-ACK.
            self.retransmit_count = self.retransmit_count.saturating_add(1);
            outcome.replies.push(self.syn_ack());
            return outcome;
        }

        if header.is_ack() {
            if seq_gt(header.ack_number, self.peer_acked) && seq_le(header.ack_number, self.snd_nxt)
            {
                self.peer_acked = header.ack_number;
            }
            if self.state == TcpState::SynReceived
                && seq_ge(header.ack_number, self.iss.wrapping_add(1))
            {
                self.transition(TcpState::Established);
            }
        }

        let closing = header.is_fin()
            && matches!(self.state, TcpState::SynReceived | TcpState::Established);

        if !segment.payload.is_empty() && self.state == TcpState::Established {
            if header.seq_number == self.rcv_nxt {
                self.buffer(segment.payload);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(segment.payload.len() as u32);
                outcome.deliver = true;
            } else {
                trace!(
                    seq = header.seq_number,
                    expected = self.rcv_nxt,
                    "out-of-order segment, re-acknowledging"
                );
            }
            if !closing {
                outcome.replies.push(self.ack());
            }
        }

        if closing {
            if outcome.deliver || segment.payload.is_empty() {
                self.rcv_nxt = header
                    .seq_number
                    .wrapping_add(segment.payload.len() as u32)
                    .wrapping_add(1);
            }
            outcome.replies.push(self.ack());
            self.transition(TcpState::FinWait1);

            outcome.replies.push(Reply {
                flags: flags::FIN | flags::ACK,
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.transition(TcpState::FinWait2);
        }

        outcome
    }

    fn buffer(&mut self, payload: &[u8]) {
        let room = self.recv_capacity.saturating_sub(self.recv_buffer.len());
        if payload.len() > room {
            debug!(
                peer = %self.key.peer_addr,
                dropped = payload.len() - room,
                "receive buffer full, truncating"
            );
        }
        self.recv_buffer
            .extend_from_slice(&payload[..payload.len().min(room)]);
    }

    /// Payload accumulated so far.
    pub fn received(&self) -> &[u8] {
        &self.recv_buffer
    }

    /// Hand the accumulated payload to the caller and empty the buffer.
    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recv_buffer)
    }

    /// Has the peer acknowledged everything up to (not including) `seq`?
    pub fn is_acknowledged(&self, seq: u32) -> bool {
        seq_le(seq, self.peer_acked)
    }

    pub fn is_idle(&self, now: Millis) -> bool {
        now.saturating_sub(self.last_activity) >= self.idle_timeout_ms
    }
}

/// Bounded table of connection records.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionKey, TcpConnection>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        ConnectionTable {
            connections: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&TcpConnection> {
        self.connections.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut TcpConnection> {
        self.connections.get_mut(key)
    }

    pub fn insert(&mut self, conn: TcpConnection) -> Result<&mut TcpConnection> {
        if self.connections.len() >= self.capacity {
            return Err(NetError::TableFull(Table::Connections));
        }
        Ok(self.connections.entry(conn.key).or_insert(conn))
    }

    pub fn remove(&mut self, key: &ConnectionKey) -> Option<TcpConnection> {
        self.connections.remove(key)
    }

    /// Drop every record whose idle timer has expired.
    pub fn sweep_idle(&mut self, now: Millis) -> Vec<ConnectionKey> {
        let expired: Vec<ConnectionKey> = self
            .connections
            .values()
            .filter(|c| c.is_idle(now))
            .map(|c| c.key)
            .collect();
        for key in &expired {
            if let Some(conn) = self.connections.remove(key) {
                debug!(peer = %key.peer_addr, port = key.peer_port, state = ?conn.state, "idle connection reclaimed");
            }
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &TcpConnection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
