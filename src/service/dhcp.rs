//! DHCP server: BOOTP message handling and the lease pool.
//!
//! DISCOVER creates an `Offered` lease, REQUEST turns it into a `Bound` one and
//! RELEASE drops it. Both states hold their address until they expire, so an
//! address is never offered twice while a lease on it is live.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use crate::error::{NetError, Result, Table};
use crate::iface::MacAddr;
use crate::stack::Millis;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Fixed BOOTP header plus the magic cookie.
pub const DHCP_MIN_LEN: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVER: u8 = 6;
const OPT_HOSTNAME: u8 = 12;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// The parts of a client message the server acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub message_type: Option<DhcpMessageType>,
    pub requested_addr: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub hostname: Option<String>,
}

impl DhcpMessage {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DHCP_MIN_LEN {
            return Err(NetError::MalformedPacket("shorter than DHCP header"));
        }
        if buf[236..240] != MAGIC_COOKIE {
            return Err(NetError::MalformedPacket("missing DHCP magic cookie"));
        }

        let mut msg = DhcpMessage {
            op: buf[0],
            xid: BigEndian::read_u32(&buf[4..8]),
            flags: BigEndian::read_u16(&buf[10..12]),
            ciaddr: addr_at(buf, 12),
            chaddr: MacAddr([buf[28], buf[29], buf[30], buf[31], buf[32], buf[33]]),
            message_type: None,
            requested_addr: None,
            server_id: None,
            hostname: None,
        };

        let mut pos = DHCP_MIN_LEN;
        while pos < buf.len() {
            let code = buf[pos];
            match code {
                OPT_PAD => {
                    pos += 1;
                    continue;
                }
                OPT_END => break,
                _ => {}
            }
            let len = *buf
                .get(pos + 1)
                .ok_or(NetError::MalformedPacket("truncated DHCP option"))? as usize;
            let value = buf
                .get(pos + 2..pos + 2 + len)
                .ok_or(NetError::MalformedPacket("truncated DHCP option"))?;
            match (code, value) {
                (OPT_MESSAGE_TYPE, [t]) => msg.message_type = DhcpMessageType::from_u8(*t),
                (OPT_REQUESTED_IP, [a, b, c, d]) => {
                    msg.requested_addr = Some(Ipv4Addr::new(*a, *b, *c, *d))
                }
                (OPT_SERVER_ID, [a, b, c, d]) => msg.server_id = Some(Ipv4Addr::new(*a, *b, *c, *d)),
                (OPT_HOSTNAME, name) => {
                    msg.hostname = Some(String::from_utf8_lossy(name).into_owned())
                }
                _ => {}
            }
            pos += 2 + len;
        }

        Ok(msg)
    }

    /// The address a REQUEST or RELEASE is about.
    pub fn subject_addr(&self) -> Option<Ipv4Addr> {
        self.requested_addr
            .or(Some(self.ciaddr).filter(|a| !a.is_unspecified()))
    }

    /// Build a client message; used by tests and by tools driving the server.
    pub fn build_request(
        message_type: DhcpMessageType,
        xid: u32,
        chaddr: MacAddr,
        ciaddr: Ipv4Addr,
        requested: Option<Ipv4Addr>,
        hostname: Option<&str>,
    ) -> Vec<u8> {
        let mut out = bootp_header(
            BOOTREQUEST,
            xid,
            0x8000,
            ciaddr,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            chaddr,
        );
        push_option(&mut out, OPT_MESSAGE_TYPE, &[message_type as u8]);
        if let Some(addr) = requested {
            push_option(&mut out, OPT_REQUESTED_IP, &addr.octets());
        }
        if let Some(name) = hostname {
            push_option(&mut out, OPT_HOSTNAME, name.as_bytes());
        }
        out.push(OPT_END);
        out
    }
}

fn addr_at(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

fn bootp_header(
    op: u8,
    xid: u32,
    flags: u16,
    ciaddr: Ipv4Addr,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    chaddr: MacAddr,
) -> Vec<u8> {
    let mut out = vec![0u8; DHCP_MIN_LEN];
    out[0] = op;
    out[1] = HTYPE_ETHERNET;
    out[2] = 6;
    BigEndian::write_u32(&mut out[4..8], xid);
    BigEndian::write_u16(&mut out[10..12], flags);
    out[12..16].copy_from_slice(&ciaddr.octets());
    out[16..20].copy_from_slice(&yiaddr.octets());
    out[20..24].copy_from_slice(&siaddr.octets());
    out[28..34].copy_from_slice(&chaddr.0);
    out[236..240].copy_from_slice(&MAGIC_COOKIE);
    out
}

fn push_option(out: &mut Vec<u8>, code: u8, value: &[u8]) {
    let value = &value[..value.len().min(255)];
    out.push(code);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

/// Network parameters handed out with every OFFER and ACK.
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub server_addr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_server: Ipv4Addr,
}

/// Build an OFFER, ACK or NAK answering `request`.
pub fn build_reply(
    request: &DhcpMessage,
    reply_type: DhcpMessageType,
    yiaddr: Ipv4Addr,
    lease_secs: u32,
    params: &ServerParams,
) -> Vec<u8> {
    let mut out = bootp_header(
        BOOTREPLY,
        request.xid,
        request.flags,
        Ipv4Addr::UNSPECIFIED,
        yiaddr,
        params.server_addr,
        request.chaddr,
    );
    push_option(&mut out, OPT_MESSAGE_TYPE, &[reply_type as u8]);
    push_option(&mut out, OPT_SERVER_ID, &params.server_addr.octets());
    if reply_type != DhcpMessageType::Nak {
        push_option(&mut out, OPT_LEASE_TIME, &lease_secs.to_be_bytes());
        push_option(&mut out, OPT_SUBNET_MASK, &params.subnet_mask.octets());
        push_option(&mut out, OPT_ROUTER, &params.router.octets());
        push_option(&mut out, OPT_DNS_SERVER, &params.dns_server.octets());
    }
    out.push(OPT_END);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Offered,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub mac: MacAddr,
    pub duration_secs: u32,
    pub started_at: Millis,
    pub hostname: String,
    pub state: LeaseState,
}

impl Lease {
    pub fn is_active(&self, now: Millis) -> bool {
        self.started_at.saturating_add(self.duration_secs as u64 * 1000) > now
    }
}

#[derive(Debug, Clone)]
pub struct LeasePoolConfig {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_secs: u32,
    pub offer_secs: u32,
    pub capacity: usize,
}

/// Address allocator over an inclusive range.
#[derive(Debug)]
pub struct LeasePool {
    cfg: LeasePoolConfig,
    leases: BTreeMap<Ipv4Addr, Lease>,
}

impl LeasePool {
    pub fn new(cfg: LeasePoolConfig) -> Self {
        LeasePool {
            cfg,
            leases: BTreeMap::new(),
        }
    }

    pub fn lease_secs(&self) -> u32 {
        self.cfg.lease_secs
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(self.cfg.range_start)..=u32::from(self.cfg.range_end)).contains(&u32::from(addr))
    }

    fn is_free(&self, addr: Ipv4Addr, now: Millis) -> bool {
        self.leases.get(&addr).map_or(true, |l| !l.is_active(now))
    }

    fn make_room(&mut self, addr: Ipv4Addr, now: Millis) -> Result<()> {
        if self.leases.contains_key(&addr) || self.leases.len() < self.cfg.capacity {
            return Ok(());
        }
        self.purge_expired(now);
        if self.leases.len() >= self.cfg.capacity {
            return Err(NetError::TableFull(Table::Leases));
        }
        Ok(())
    }

    /// Offer the lowest free address in the range to `mac`.
    pub fn allocate(&mut self, mac: MacAddr, now: Millis) -> Result<Ipv4Addr> {
        let start = u32::from(self.cfg.range_start);
        let end = u32::from(self.cfg.range_end);
        let addr = (start..=end)
            .map(Ipv4Addr::from)
            .find(|addr| self.is_free(*addr, now))
            .ok_or(NetError::PoolExhausted)?;

        self.make_room(addr, now)?;
        self.leases.insert(
            addr,
            Lease {
                address: addr,
                mac,
                duration_secs: self.cfg.offer_secs,
                started_at: now,
                hostname: String::from("Unknown"),
                state: LeaseState::Offered,
            },
        );
        debug!(%addr, %mac, "address offered");
        Ok(addr)
    }

    /// The live lease held by `mac`, if any.
    pub fn lease_for(&self, mac: MacAddr, now: Millis) -> Option<&Lease> {
        self.leases
            .values()
            .find(|l| l.mac == mac && l.is_active(now))
    }

    /// Bind `addr` to `mac` for the full lease time.
    ///
    /// Fails when the address lies outside the range or is held by another client.
    pub fn confirm(
        &mut self,
        addr: Ipv4Addr,
        mac: MacAddr,
        hostname: Option<&str>,
        now: Millis,
    ) -> Result<&Lease> {
        if !self.contains(addr) {
            return Err(NetError::UnsupportedMessage("requested address outside pool"));
        }
        if let Some(existing) = self.leases.get(&addr) {
            if existing.is_active(now) && existing.mac != mac {
                return Err(NetError::UnsupportedMessage("requested address in use"));
            }
        }

        self.make_room(addr, now)?;
        let lease = Lease {
            address: addr,
            mac,
            duration_secs: self.cfg.lease_secs,
            started_at: now,
            hostname: hostname.unwrap_or("Unknown").to_string(),
            state: LeaseState::Bound,
        };
        info!(%addr, %mac, hostname = %lease.hostname, "lease bound");
        match self.leases.entry(addr) {
            Entry::Occupied(mut slot) => {
                slot.insert(lease);
                Ok(slot.into_mut())
            }
            Entry::Vacant(slot) => Ok(slot.insert(lease)),
        }
    }

    /// Remove the lease on `addr` unconditionally.
    pub fn release(&mut self, addr: Ipv4Addr) -> Option<Lease> {
        let lease = self.leases.remove(&addr)?;
        debug!(%addr, mac = %lease.mac, "lease released");
        Some(lease)
    }

    pub fn purge_expired(&mut self, now: Millis) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, l| l.is_active(now));
        before - self.leases.len()
    }

    pub fn get(&self, addr: Ipv4Addr) -> Option<&Lease> {
        self.leases.get(&addr)
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }
}
