//! Services the stack answers itself: a caching DNS forwarder on port 53 and a
//! DHCP server on port 67.

pub mod dhcp;
pub mod dns;

use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::error::{NetError, Result, Table};
use crate::stack::{Application, Egress, Millis, NetworkStack};
use crate::transport::UdpDatagram;

use dhcp::{build_reply, DhcpMessage, DhcpMessageType, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use dns::{normalize_name, DnsQuery, PendingQuery, UpstreamQuery};

pub use dhcp::{Lease, LeasePool, LeaseState};
pub use dns::{DnsCache, DnsEntry};

impl<E: Egress, A: Application> NetworkStack<E, A> {
    pub(crate) fn handle_dns(
        &mut self,
        datagram: &UdpDatagram<'_>,
        local_addr: Ipv4Addr,
        now: Millis,
    ) -> Result<()> {
        let query = DnsQuery::parse(datagram.payload)?;
        let server = if datagram.dst_addr.is_broadcast() {
            local_addr
        } else {
            datagram.dst_addr
        };
        let (client, client_port) = (datagram.src_addr, datagram.src_port);

        if let Some(address) = self.dns_cache.lookup(&query.name, now) {
            let ttl_secs = self
                .dns_cache
                .get(&query.name)
                .map_or(0, |e| remaining_secs(e.inserted_at, e.ttl_secs, now));
            debug!(name = %query.name, %address, "dns cache hit");
            self.answer_dns(&query, server, client, client_port, address, ttl_secs);
            return Ok(());
        }

        let name = normalize_name(&query.name);
        let already_forwarded = self
            .pending_dns
            .iter()
            .any(|p| normalize_name(&p.query.name) == name);
        let duplicate = self.pending_dns.iter().any(|p| {
            p.query.id == query.id && p.client_addr == client && p.client_port == client_port
        });
        if duplicate {
            debug!(%name, %client, "query already pending");
            return Ok(());
        }
        if self.pending_dns.len() >= self.config.limits.max_dns_entries {
            return Err(NetError::TableFull(Table::PendingDns));
        }

        self.pending_dns.push(PendingQuery {
            query,
            client_addr: client,
            client_port,
            server_addr: server,
            queued_at: now,
        });
        if already_forwarded {
            debug!(%name, %client, "dns cache miss, joined pending lookup");
            return Ok(());
        }

        let upstream = UpstreamQuery {
            name,
            client_addr: client,
            client_port,
            upstream: self.config.dns.upstream,
        };
        debug!(name = %upstream.name, upstream = %upstream.upstream, "dns cache miss, forwarding");
        self.egress.forward_dns_query(&upstream);
        Ok(())
    }

    pub(crate) fn handle_dhcp(
        &mut self,
        datagram: &UdpDatagram<'_>,
        local_addr: Ipv4Addr,
        now: Millis,
    ) -> Result<()> {
        let request = DhcpMessage::parse(datagram.payload)?;
        let params = self.dhcp_params(local_addr);
        let mac = request.chaddr;

        match request.message_type {
            Some(DhcpMessageType::Discover) => {
                let offered = match self.leases.lease_for(mac, now) {
                    Some(lease) => lease.address,
                    None => self.leases.allocate(mac, now)?,
                };
                info!(xid = request.xid, %mac, addr = %offered, "DHCP offer");
                let reply = build_reply(
                    &request,
                    DhcpMessageType::Offer,
                    offered,
                    self.config.dhcp.offer_secs,
                    &params,
                );
                self.send_dhcp(params.server_addr, &reply);
                Ok(())
            }
            Some(DhcpMessageType::Request) => {
                if request.server_id.is_some_and(|id| id != params.server_addr) {
                    debug!(xid = request.xid, %mac, "request for another server");
                    if let Some(lease) = self.leases.lease_for(mac, now) {
                        if lease.state == LeaseState::Offered {
                            let addr = lease.address;
                            self.leases.release(addr);
                        }
                    }
                    return Ok(());
                }

                let Some(addr) = request.subject_addr() else {
                    return Err(NetError::UnsupportedMessage("DHCP request without address"));
                };
                let hostname = request.hostname.as_deref();
                match self.leases.confirm(addr, mac, hostname, now) {
                    Ok(lease) => {
                        let lease_secs = lease.duration_secs;
                        info!(xid = request.xid, %mac, %addr, "DHCP ack");
                        let reply =
                            build_reply(&request, DhcpMessageType::Ack, addr, lease_secs, &params);
                        self.send_dhcp(params.server_addr, &reply);
                        Ok(())
                    }
                    Err(err @ NetError::TableFull(_)) => Err(err),
                    Err(err) => {
                        info!(xid = request.xid, %mac, %addr, %err, "DHCP nak");
                        let reply = build_reply(
                            &request,
                            DhcpMessageType::Nak,
                            Ipv4Addr::UNSPECIFIED,
                            0,
                            &params,
                        );
                        self.send_dhcp(params.server_addr, &reply);
                        Ok(())
                    }
                }
            }
            Some(DhcpMessageType::Release) | Some(DhcpMessageType::Decline) => {
                if let Some(addr) = request.subject_addr() {
                    let owned = self.leases.get(addr).is_some_and(|l| l.mac == mac);
                    if owned {
                        self.leases.release(addr);
                    }
                }
                Ok(())
            }
            _ => Err(NetError::UnsupportedMessage("DHCP message type")),
        }
    }

    fn send_dhcp(&mut self, server: Ipv4Addr, reply: &[u8]) {
        self.send_udp(
            server,
            DHCP_SERVER_PORT,
            Ipv4Addr::BROADCAST,
            DHCP_CLIENT_PORT,
            reply,
        );
    }
}

fn remaining_secs(inserted_at: Millis, ttl_secs: u32, now: Millis) -> u32 {
    let elapsed = now.saturating_sub(inserted_at) / 1000;
    (ttl_secs as u64).saturating_sub(elapsed) as u32
}
