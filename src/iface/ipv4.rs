use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::error::{NetError, Result};
use crate::firewall::{Direction, FlowTuple};
use crate::network::icmp::{
    IcmpHeader, IcmpReport, IcmpUtils, ICMP_HEADER_LEN, ICMP_TYPE_DEST_UNREACHABLE,
    ICMP_TYPE_ECHO_REQUEST, ICMP_TYPE_TIME_EXCEEDED,
};
use crate::network::ipv4::{Ipv4Datagram, Ipv4Utils};
use crate::network::{checksum, protocol};
use crate::service::dhcp::DHCP_SERVER_PORT;
use crate::service::dns::DNS_PORT;
use crate::stack::{Application, Disposition, Egress, Millis, NetworkStack};
use crate::transport::tcp::{Reply, TcpUtils};
use crate::transport::{ConnectionKey, TcpConnection, TcpSegment, UdpDatagram};

impl<E: Egress, A: Application> NetworkStack<E, A> {
    /// Entry point for every inbound IPv4 datagram.
    ///
    /// Errors are drops: the datagram was consumed and nothing (other than a
    /// time-exceeded notice) was sent in reply. [`NetError::TableFull`] reports
    /// resource exhaustion the operator should see.
    pub fn process_ip_packet(&mut self, buffer: &[u8], now: Millis) -> Result<Disposition> {
        self.stats.received += 1;
        let result = self.ingress(buffer, now);
        match &result {
            Ok(Disposition::Delivered) => self.stats.delivered += 1,
            Ok(Disposition::Forwarded { .. }) => self.stats.forwarded += 1,
            Err(err) => self.record_drop(err),
        }
        result
    }

    fn ingress(&mut self, buffer: &[u8], now: Millis) -> Result<Disposition> {
        let ip = Ipv4Datagram::parse(buffer)?;
        let dst = ip.header.dst_addr;

        let local_addr = match self.interfaces.local_for(dst) {
            Some(iface) => {
                iface.counters.record_rx(ip.len());
                iface.address
            }
            None => return self.forward(&ip, buffer),
        };

        trace!(
            src = %ip.header.src_addr,
            %dst,
            protocol = ip.header.protocol,
            len = ip.len(),
            "local delivery"
        );

        let result = if ip.header.is_fragment() {
            trace!(src = %ip.header.src_addr, id = ip.header.id, "fragment dropped");
            Err(NetError::UnsupportedMessage("IPv4 fragment"))
        } else {
            self.dispatch(&ip, local_addr, now)
        };

        if result.is_err() {
            if let Some(iface) = self.interfaces.local_for(dst) {
                iface.counters.rx_dropped += 1;
            }
        }
        result.map(|()| Disposition::Delivered)
    }

    fn dispatch(&mut self, ip: &Ipv4Datagram<'_>, local_addr: Ipv4Addr, now: Millis) -> Result<()> {
        match ip.header.protocol {
            protocol::ICMP => self.process_icmpv4(ip, local_addr),
            protocol::TCP => self.process_tcp(ip, local_addr, now),
            protocol::UDP => self.process_udp(ip, local_addr, now),
            other => Err(NetError::UnknownProtocol(other)),
        }
    }

    fn forward(&mut self, ip: &Ipv4Datagram<'_>, buffer: &[u8]) -> Result<Disposition> {
        let dst = ip.header.dst_addr;
        let route = self
            .routes
            .lookup(dst)
            .cloned()
            .ok_or(NetError::NoRoute(dst))?;

        let mut packet = buffer[..ip.len()].to_vec();
        if Ipv4Utils::decrement_ttl(&mut packet).is_none() {
            self.send_time_exceeded(ip, buffer);
            return Err(NetError::TtlExceeded);
        }

        let gateway = route.next_hop(dst);
        debug!(%dst, %gateway, interface = %route.interface, "forwarding");
        if let Some(iface) = self.interfaces.by_name_mut(&route.interface) {
            iface.counters.record_tx(packet.len());
        }
        self.egress.send_packet_to_gateway(&packet, gateway);

        Ok(Disposition::Forwarded {
            gateway,
            interface: route.interface,
        })
    }

    fn send_time_exceeded(&mut self, ip: &Ipv4Datagram<'_>, buffer: &[u8]) {
        let src = ip.header.src_addr;
        if src.is_unspecified() || src.is_broadcast() || is_icmp_error(ip) {
            debug!(%src, "no time exceeded for this datagram");
            return;
        }
        let Some(from) = self.interfaces.source_for(src) else {
            debug!(%src, "no interface to report time exceeded from");
            return;
        };
        let message = IcmpUtils::time_exceeded(&buffer[..ip.len()], ip.header.header_len());
        debug!(%src, dst = %ip.header.dst_addr, "ttl expired in transit");
        self.send_ip(protocol::ICMP, from, src, &message);
    }

    fn process_icmpv4(&mut self, ip: &Ipv4Datagram<'_>, local_addr: Ipv4Addr) -> Result<()> {
        let header = IcmpHeader::parse(ip.payload)?;
        let computed = checksum(ip.payload);
        if computed != 0 {
            return Err(NetError::ChecksumFailed {
                expected: header.checksum,
                computed,
            });
        }

        let src = ip.header.src_addr;
        match header.msg_type {
            ICMP_TYPE_ECHO_REQUEST => {
                trace!(%src, seq = header.sequence(), "echo request");
                let reply = IcmpUtils::echo_reply(ip.payload)?;
                let from = if ip.header.dst_addr.is_broadcast() {
                    local_addr
                } else {
                    ip.header.dst_addr
                };
                self.send_ip(protocol::ICMP, from, src, &reply);
                Ok(())
            }
            _ => {
                let body = &ip.payload[ICMP_HEADER_LEN..];
                let report = IcmpReport::from_message(src, &header, body)?;
                self.app.icmp_report(&report);
                Ok(())
            }
        }
    }

    fn process_tcp(&mut self, ip: &Ipv4Datagram<'_>, local_addr: Ipv4Addr, now: Millis) -> Result<()> {
        let (src, dst) = (ip.header.src_addr, ip.header.dst_addr);
        let segment = TcpSegment::parse(src, dst, ip.payload)?;
        let header = &segment.header;

        let flow = FlowTuple {
            src_addr: src,
            dst_addr: dst,
            src_port: header.src_port,
            dst_port: header.dst_port,
            protocol: protocol::TCP,
        };
        let key = ConnectionKey {
            peer_addr: src,
            peer_port: header.src_port,
        };

        let Some(conn) = self.connections.get_mut(&key) else {
            if !header.is_syn() || header.is_ack() {
                trace!(peer = %src, port = header.src_port, "segment without connection");
                return Err(NetError::NoConnection);
            }
            self.firewall.admit(&flow, Direction::Inbound)?;

            let local = if dst.is_broadcast() { local_addr } else { dst };
            let iss = self.next_isn();
            let (conn, syn_ack) =
                TcpConnection::accept(key, local, header, iss, self.tcp_params, now);
            let window = conn.window;
            if let Err(err) = self.connections.insert(conn) {
                warn!(peer = %src, port = header.src_port, %err, "connection refused");
                return Err(err);
            }
            debug!(peer = %src, port = header.src_port, local_port = header.dst_port, "SYN received");

            self.record_flow(flow, Direction::Inbound, ip.len(), now);
            self.send_tcp(local, header.dst_port, key, syn_ack, window, now);
            return Ok(());
        };

        let outcome = conn.on_segment(&segment, now);
        let (local, local_port, window) = (conn.local_addr, conn.local_port, conn.window);

        self.record_flow(flow, Direction::Inbound, ip.len(), now);
        for reply in outcome.replies {
            self.send_tcp(local, local_port, key, reply, window, now);
        }
        if outcome.deliver {
            if let Some(conn) = self.connections.get(&key) {
                self.app.process_application_data(conn, segment.payload);
            }
        }
        Ok(())
    }

    fn send_tcp(
        &mut self,
        local: Ipv4Addr,
        local_port: u16,
        peer: ConnectionKey,
        reply: Reply,
        window: u16,
        now: Millis,
    ) {
        let segment = TcpUtils::build_segment(
            local,
            peer.peer_addr,
            local_port,
            peer.peer_port,
            reply.seq,
            reply.ack,
            reply.flags,
            window,
            &[],
        );
        let flow = FlowTuple {
            src_addr: peer.peer_addr,
            dst_addr: local,
            src_port: peer.peer_port,
            dst_port: local_port,
            protocol: protocol::TCP,
        };
        self.record_flow(flow, Direction::Outbound, segment.len(), now);
        self.send_ip(protocol::TCP, local, peer.peer_addr, &segment);
    }

    fn process_udp(&mut self, ip: &Ipv4Datagram<'_>, local_addr: Ipv4Addr, now: Millis) -> Result<()> {
        let datagram = UdpDatagram::parse(ip.header.src_addr, ip.header.dst_addr, ip.payload)?;
        let flow = FlowTuple {
            src_addr: datagram.src_addr,
            dst_addr: datagram.dst_addr,
            src_port: datagram.src_port,
            dst_port: datagram.dst_port,
            protocol: protocol::UDP,
        };
        self.firewall.admit(&flow, Direction::Inbound)?;
        self.record_flow(flow, Direction::Inbound, ip.len(), now);

        match datagram.dst_port {
            DNS_PORT => self.handle_dns(&datagram, local_addr, now),
            DHCP_SERVER_PORT if self.config.dhcp.enabled => {
                self.handle_dhcp(&datagram, local_addr, now)
            }
            _ => {
                self.app.process_udp_datagram(&datagram);
                Ok(())
            }
        }
    }
}

/// ICMP errors are never answered with another ICMP error.
fn is_icmp_error(ip: &Ipv4Datagram<'_>) -> bool {
    ip.header.protocol == protocol::ICMP
        && matches!(
            ip.payload.first(),
            Some(&ICMP_TYPE_DEST_UNREACHABLE) | Some(&ICMP_TYPE_TIME_EXCEEDED)
        )
}
