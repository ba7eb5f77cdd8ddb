//! DNS forwarder: query parsing, A-record responses and the TTL-bounded cache.
//!
//! Only the first question of a query is looked at. A cache hit is answered
//! directly; a miss is forwarded upstream and answered once
//! [`NetworkStack::complete_dns_query`](crate::stack::NetworkStack::complete_dns_query)
//! supplies the upstream result.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use crate::error::{NetError, Result, Table};
use crate::stack::Millis;

pub const DNS_PORT: u16 = 53;
const DNS_HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: u8 = 63;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 1 << 15;
const FLAG_RD: u16 = 1 << 8;
const FLAG_RA: u16 = 1 << 7;

/// Canonical cache key: lower case, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// The first question of a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DNS_HEADER_LEN {
            return Err(NetError::MalformedPacket("shorter than DNS header"));
        }
        let id = BigEndian::read_u16(&buf[0..2]);
        let flags = BigEndian::read_u16(&buf[2..4]);
        if flags & FLAG_QR != 0 {
            return Err(NetError::UnsupportedMessage("DNS response on query port"));
        }
        if BigEndian::read_u16(&buf[4..6]) == 0 {
            return Err(NetError::MalformedPacket("DNS query without questions"));
        }

        let (name, offset) = decode_name(buf, DNS_HEADER_LEN)?;
        if offset + 4 > buf.len() {
            return Err(NetError::MalformedPacket("truncated DNS question"));
        }
        Ok(DnsQuery {
            id,
            flags,
            name,
            qtype: BigEndian::read_u16(&buf[offset..offset + 2]),
            qclass: BigEndian::read_u16(&buf[offset + 2..offset + 4]),
        })
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    /// Build a query for `name`, as a client or the upstream forwarder would.
    pub fn build(id: u16, name: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(DNS_HEADER_LEN + name.len() + 6);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&FLAG_RD.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&[0; 6]); // AN/NS/AR counts
        encode_name(name, &mut out);
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    /// Build the answer to this query. Only A/IN questions get an answer record.
    pub fn build_response(&self, addr: Ipv4Addr, ttl_secs: u32) -> Vec<u8> {
        let answer = self.qtype == TYPE_A && self.qclass == CLASS_IN;

        let mut out = Vec::new();
        out.extend_from_slice(&self.id.to_be_bytes());
        let mut flags = FLAG_QR | FLAG_RA;
        if self.recursion_desired() {
            flags |= FLAG_RD;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&(answer as u16).to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&[0; 4]); // NS/AR counts

        let question_offset = out.len();
        encode_name(&self.name, &mut out);
        out.extend_from_slice(&self.qtype.to_be_bytes());
        out.extend_from_slice(&self.qclass.to_be_bytes());

        if answer {
            // Compression pointer back to the question name.
            out.extend_from_slice(&(0xC000u16 | question_offset as u16).to_be_bytes());
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ttl_secs.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&addr.octets());
        }
        out
    }
}

fn encode_name(name: &str, out: &mut Vec<u8>) {
    let trimmed = name.trim_end_matches('.');
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN as usize)];
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
    }
    out.push(0);
}

/// Decode a possibly compressed name; returns it with the offset just past it.
fn decode_name(buf: &[u8], mut offset: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut resume_at = None;
    let mut jumps = 0usize;

    loop {
        let len = *buf
            .get(offset)
            .ok_or(NetError::MalformedPacket("truncated DNS name"))?;

        if len == 0 {
            offset += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *buf
                .get(offset + 1)
                .ok_or(NetError::MalformedPacket("truncated DNS pointer"))?;
            jumps += 1;
            if jumps > buf.len() / 2 {
                return Err(NetError::MalformedPacket("DNS pointer loop"));
            }
            resume_at.get_or_insert(offset + 2);
            offset = (((len & 0x3F) as usize) << 8) | low as usize;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(NetError::MalformedPacket("DNS label too long"));
        }
        let len = len as usize;
        let label = buf
            .get(offset + 1..offset + 1 + len)
            .ok_or(NetError::MalformedPacket("truncated DNS label"))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(
            std::str::from_utf8(label).map_err(|_| NetError::MalformedPacket("DNS label utf8"))?,
        );
        if name.len() > MAX_NAME_LEN {
            return Err(NetError::MalformedPacket("DNS name too long"));
        }
        offset += 1 + len;
    }

    Ok((name, resume_at.unwrap_or(offset)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub address: Ipv4Addr,
    pub inserted_at: Millis,
    pub ttl_secs: u32,
}

impl DnsEntry {
    pub fn is_valid(&self, now: Millis) -> bool {
        self.inserted_at.saturating_add(self.ttl_secs as u64 * 1000) > now
    }
}

/// A bounded name-to-address cache with lazy expiry.
#[derive(Debug)]
pub struct DnsCache {
    entries: HashMap<String, DnsEntry>,
    capacity: usize,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        DnsCache {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Resolve `name` if a live entry exists. Expired entries count as misses.
    pub fn lookup(&self, name: &str, now: Millis) -> Option<Ipv4Addr> {
        let entry = self.entries.get(&normalize_name(name))?;
        if entry.is_valid(now) {
            Some(entry.address)
        } else {
            trace!(name, "dns entry expired");
            None
        }
    }

    /// Insert or overwrite the entry for `name`.
    ///
    /// When the cache is full one expired entry is reclaimed to make room.
    pub fn insert(&mut self, name: &str, address: Ipv4Addr, ttl_secs: u32, now: Millis) -> Result<()> {
        let key = normalize_name(name);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let stale = self
                .entries
                .iter()
                .find(|(_, e)| !e.is_valid(now))
                .map(|(k, _)| k.clone())
                .ok_or(NetError::TableFull(Table::DnsCache))?;
            self.entries.remove(&stale);
        }

        self.entries.insert(
            key,
            DnsEntry {
                address,
                inserted_at: now,
                ttl_secs,
            },
        );
        Ok(())
    }

    /// Drop every expired entry, returning how many went.
    pub fn purge_expired(&mut self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_valid(now));
        before - self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&DnsEntry> {
        self.entries.get(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A cache miss handed to the upstream resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamQuery {
    pub name: String,
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub upstream: Ipv4Addr,
}

/// A client waiting on an upstream answer.
#[derive(Debug, Clone)]
pub(crate) struct PendingQuery {
    pub query: DnsQuery,
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub server_addr: Ipv4Addr,
    pub queued_at: Millis,
}
