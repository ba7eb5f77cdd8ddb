//! The stack context.
//!
//! [`NetworkStack`] owns every table (interfaces, routes, firewall rules, connections,
//! DNS cache, leases) and is passed explicitly to each operation. Packet processing
//! is run-to-completion: [`NetworkStack::process_ip_packet`] handles one datagram
//! from the IP layer through protocol dispatch before returning. Callers that feed
//! packets from several threads must serialize access to the stack themselves.
//!
//! Outbound traffic leaves through an [`Egress`]. Received TCP data, UDP datagrams
//! for ports the stack does not serve, and ICMP reports go to an [`Application`].

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::error::{NetError, Result, Table};
use crate::firewall::{Direction, FirewallEngine, FirewallRule, FlowTuple};
use crate::iface::{InterfaceTable, MacAddr, NetworkInterface};
use crate::network::icmp::IcmpReport;
use crate::network::ipv4::{Ipv4Utils, DEFAULT_TTL};
use crate::network::route::{RouteTable, DEFAULT_METRIC};
use crate::network::{network_of, protocol};
use crate::service::dhcp::{LeasePool, LeasePoolConfig, ServerParams};
use crate::service::dns::{normalize_name, DnsCache, DnsQuery, PendingQuery, UpstreamQuery, DNS_PORT};
use crate::transport::tcp::TcpParams;
use crate::transport::{ConnectionKey, ConnectionTable, TcpConnection, UdpDatagram, UdpUtils};

/// Milliseconds on the caller's clock.
pub type Millis = u64;

/// Where finished, checksummed IPv4 datagrams go.
pub trait Egress {
    /// Replies originated by the stack: SYN-ACK, ACK, FIN, ICMP, DNS and DHCP responses.
    fn send_packet(&mut self, packet: &[u8]);

    /// Forwarded datagrams, handed to the next hop.
    fn send_packet_to_gateway(&mut self, packet: &[u8], gateway: Ipv4Addr);

    /// A DNS cache miss. The answer comes back through
    /// [`NetworkStack::complete_dns_query`].
    fn forward_dns_query(&mut self, query: &UpstreamQuery);
}

/// Consumer of traffic that terminates at the stack.
///
/// Callbacks must not block.
pub trait Application {
    fn process_application_data(&mut self, _connection: &TcpConnection, _payload: &[u8]) {}

    fn process_udp_datagram(&mut self, _datagram: &UdpDatagram<'_>) {}

    fn icmp_report(&mut self, _report: &IcmpReport) {}
}

/// An [`Application`] that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplication;

impl Application for NullApplication {}

/// What happened to an accepted datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled by this host.
    Delivered,
    /// Sent toward `gateway` through `interface`.
    Forwarded { gateway: Ipv4Addr, interface: String },
}

/// Datagrams dropped, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub malformed: u64,
    pub checksum: u64,
    pub table_full: u64,
    pub no_route: u64,
    pub firewall: u64,
    pub unknown_protocol: u64,
    pub ttl_exceeded: u64,
    pub no_connection: u64,
    pub unsupported: u64,
    pub pool_exhausted: u64,
}

impl DropCounters {
    fn record(&mut self, err: &NetError) {
        let counter = match err {
            NetError::MalformedPacket(_) => &mut self.malformed,
            NetError::ChecksumFailed { .. } => &mut self.checksum,
            NetError::TableFull(_) => &mut self.table_full,
            NetError::NoRoute(_) => &mut self.no_route,
            NetError::FirewallDenied => &mut self.firewall,
            NetError::UnknownProtocol(_) => &mut self.unknown_protocol,
            NetError::TtlExceeded => &mut self.ttl_exceeded,
            NetError::NoConnection => &mut self.no_connection,
            NetError::UnsupportedMessage(_) => &mut self.unsupported,
            NetError::PoolExhausted => &mut self.pool_exhausted,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.malformed
            + self.checksum
            + self.table_full
            + self.no_route
            + self.firewall
            + self.unknown_protocol
            + self.ttl_exceeded
            + self.no_connection
            + self.unsupported
            + self.pool_exhausted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    pub received: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub sent: u64,
    pub dropped: DropCounters,
}

/// Traffic seen on one flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub last_seen: Millis,
}

/// Per-flow counters, bounded like the connection table.
#[derive(Debug)]
pub struct FlowStats {
    flows: HashMap<FlowTuple, FlowCounters>,
    capacity: usize,
}

impl FlowStats {
    pub fn new(capacity: usize) -> Self {
        FlowStats {
            flows: HashMap::new(),
            capacity,
        }
    }

    /// Count `bytes` on `flow`. A new flow is not tracked once the table is full.
    pub fn record(
        &mut self,
        flow: FlowTuple,
        direction: Direction,
        bytes: usize,
        now: Millis,
    ) -> Result<()> {
        if !self.flows.contains_key(&flow) && self.flows.len() >= self.capacity {
            return Err(NetError::TableFull(Table::FlowStats));
        }
        let counters = self.flows.entry(flow).or_default();
        match direction {
            Direction::Inbound => {
                counters.packets_in += 1;
                counters.bytes_in += bytes as u64;
            }
            Direction::Outbound => {
                counters.packets_out += 1;
                counters.bytes_out += bytes as u64;
            }
        }
        counters.last_seen = now;
        Ok(())
    }

    pub fn get(&self, flow: &FlowTuple) -> Option<&FlowCounters> {
        self.flows.get(flow)
    }

    /// Forget flows not seen for `idle_ms`.
    pub fn expire(&mut self, now: Millis, idle_ms: u64) -> usize {
        let before = self.flows.len();
        self.flows
            .retain(|_, c| now.saturating_sub(c.last_seen) < idle_ms);
        before - self.flows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowTuple, &FlowCounters)> {
        self.flows.iter()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// What one [`NetworkStack::poll`] reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub connections: Vec<ConnectionKey>,
    pub dns_entries: usize,
    /// Upstream lookups given up on.
    pub dns_queries: usize,
    pub leases: usize,
    pub flows: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
            && self.dns_entries == 0
            && self.dns_queries == 0
            && self.leases == 0
            && self.flows == 0
    }
}

pub struct NetworkStack<E, A = NullApplication> {
    pub(crate) interfaces: InterfaceTable,
    pub(crate) routes: RouteTable,
    pub(crate) firewall: FirewallEngine,
    pub(crate) connections: ConnectionTable,
    pub(crate) dns_cache: DnsCache,
    pub(crate) pending_dns: Vec<PendingQuery>,
    pub(crate) leases: LeasePool,
    pub(crate) flows: FlowStats,
    pub(crate) stats: StackStats,
    pub(crate) config: StackConfig,
    pub(crate) tcp_params: TcpParams,
    next_isn: u32,
    next_ident: u16,
    pub(crate) egress: E,
    pub(crate) app: A,
}

impl<E: Egress, A: Application> NetworkStack<E, A> {
    /// An empty stack sized and tuned by `config`.
    ///
    /// Interfaces, routes, rules and static DNS entries listed in the configuration
    /// are not applied; see [`NetworkStack::from_config`].
    pub fn new(config: StackConfig, egress: E, app: A) -> Self {
        let limits = &config.limits;
        let leases = LeasePool::new(LeasePoolConfig {
            range_start: config.dhcp.range_start,
            range_end: config.dhcp.range_end,
            lease_secs: config.dhcp.lease_secs,
            offer_secs: config.dhcp.offer_secs,
            capacity: limits.max_leases,
        });
        let tcp_params = TcpParams {
            idle_timeout_ms: config.tcp.idle_timeout_ms,
            recv_buffer_capacity: config.tcp.recv_buffer_capacity,
            window: config.tcp.window,
        };

        NetworkStack {
            interfaces: InterfaceTable::new(limits.max_interfaces),
            routes: RouteTable::new(limits.max_routes),
            firewall: FirewallEngine::new(limits.max_firewall_rules),
            connections: ConnectionTable::new(limits.max_connections),
            dns_cache: DnsCache::new(limits.max_dns_entries),
            pending_dns: Vec::new(),
            leases,
            flows: FlowStats::new(limits.max_connections),
            stats: StackStats::default(),
            next_isn: config.tcp.initial_sequence,
            next_ident: 1,
            tcp_params,
            config,
            egress,
            app,
        }
    }

    /// Build a stack and apply everything the configuration lists.
    pub fn from_config(config: StackConfig, egress: E, app: A) -> Result<Self> {
        let mut stack = Self::new(config.clone(), egress, app);

        for iface in &config.interfaces {
            let mut record =
                NetworkInterface::new(&iface.name, iface.mac, iface.address, iface.netmask, iface.gateway);
            record.primary_dns = iface.dns1;
            record.secondary_dns = iface.dns2;
            if let Some(mtu) = iface.mtu {
                record.mtu = mtu;
            }
            stack.add_interface(record)?;
        }
        for route in &config.routes {
            stack.routes.add(
                route.network,
                route.netmask,
                route.gateway,
                &route.interface,
                route.metric.unwrap_or(DEFAULT_METRIC),
            )?;
        }
        for rule in &config.firewall.rules {
            stack.add_firewall_rule(rule.clone())?;
        }
        for entry in &config.dns.entries {
            stack.dns_cache.insert(&entry.name, entry.address, entry.ttl_secs, 0)?;
        }

        info!(
            interfaces = stack.interfaces.len(),
            routes = stack.routes.len(),
            rules = stack.firewall.rules().len(),
            "network stack configured"
        );
        Ok(stack)
    }

    /// Register an interface and the on-link route for its network.
    pub fn add_network_interface(
        &mut self,
        mac: MacAddr,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        name: &str,
    ) -> Result<()> {
        self.add_interface(NetworkInterface::new(name, mac, address, netmask, gateway))
    }

    /// Register a fully described interface and the on-link route for its network.
    pub fn add_interface(&mut self, iface: NetworkInterface) -> Result<()> {
        let network = network_of(iface.address, iface.netmask);
        let (netmask, gateway, name) = (iface.netmask, iface.gateway, iface.name.clone());
        info!(name = %iface.name, addr = %iface.address, mac = %iface.mac, "interface added");
        self.interfaces.add(iface)?;
        self.routes.add(network, netmask, gateway, &name, DEFAULT_METRIC)
    }

    pub fn add_route(
        &mut self,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        interface: &str,
    ) -> Result<()> {
        self.routes
            .add(network, netmask, gateway, interface, DEFAULT_METRIC)
    }

    pub fn add_firewall_rule(&mut self, rule: FirewallRule) -> Result<()> {
        self.firewall.add_rule(rule)
    }

    /// Insert a resolved name, as an upstream answer or a static entry.
    pub fn add_dns_entry(
        &mut self,
        name: &str,
        address: Ipv4Addr,
        ttl_secs: u32,
        now: Millis,
    ) -> Result<()> {
        self.dns_cache.insert(name, address, ttl_secs, now)
    }

    /// Record an upstream answer and reply to every client waiting on `name`.
    ///
    /// Returns the number of responses sent. Waiting clients are answered even when
    /// the cache has no room for the entry; the [`NetError::TableFull`] is returned
    /// afterwards.
    pub fn complete_dns_query(
        &mut self,
        name: &str,
        address: Ipv4Addr,
        ttl_secs: u32,
        now: Millis,
    ) -> Result<usize> {
        let cached = self.dns_cache.insert(name, address, ttl_secs, now);

        let name = normalize_name(name);
        let (ready, waiting): (Vec<PendingQuery>, Vec<PendingQuery>) =
            std::mem::take(&mut self.pending_dns)
                .into_iter()
                .partition(|p| normalize_name(&p.query.name) == name);
        self.pending_dns = waiting;

        for pending in &ready {
            self.answer_dns(
                &pending.query,
                pending.server_addr,
                pending.client_addr,
                pending.client_port,
                address,
                ttl_secs,
            );
        }
        debug!(%name, %address, answered = ready.len(), cached = cached.is_ok(), "upstream answer");
        cached.map(|()| ready.len())
    }

    /// Give up on `name`; clients waiting on it get no answer.
    pub fn abandon_dns_query(&mut self, name: &str) -> usize {
        let name = normalize_name(name);
        let before = self.pending_dns.len();
        self.pending_dns
            .retain(|p| normalize_name(&p.query.name) != name);
        before - self.pending_dns.len()
    }

    /// Periodic maintenance: reclaim idle connections, expired DNS entries, timed-out
    /// upstream lookups, expired leases and stale flow counters.
    pub fn poll(&mut self, now: Millis) -> SweepReport {
        let report = SweepReport {
            connections: self.connections.sweep_idle(now),
            dns_entries: self.dns_cache.purge_expired(now),
            dns_queries: self.expire_dns_queries(now),
            leases: self.leases.purge_expired(now),
            flows: self.flows.expire(now, self.tcp_params.idle_timeout_ms),
        };
        if !report.is_empty() {
            debug!(?report, "sweep");
        }
        report
    }

    fn expire_dns_queries(&mut self, now: Millis) -> usize {
        let timeout = self.config.dns.query_timeout_ms;
        let before = self.pending_dns.len();
        self.pending_dns
            .retain(|p| now.saturating_sub(p.queued_at) < timeout);
        before - self.pending_dns.len()
    }

    pub(crate) fn next_isn(&mut self) -> u32 {
        let isn = self.next_isn;
        self.next_isn = self.next_isn.wrapping_add(64_000);
        isn
    }

    pub(crate) fn next_ident(&mut self) -> u16 {
        let id = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        id
    }

    /// Wrap `payload` in an IPv4 datagram from `src` and send it directly.
    pub(crate) fn send_ip(&mut self, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        let id = self.next_ident();
        let packet = Ipv4Utils::build_packet(protocol, src, dst, id, DEFAULT_TTL, payload);
        if let Some(iface) = self.interfaces.iter_mut().find(|i| i.address == src) {
            iface.counters.record_tx(packet.len());
        }
        self.stats.sent += 1;
        self.egress.send_packet(&packet);
    }

    pub(crate) fn send_udp(
        &mut self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) {
        let datagram = UdpUtils::build_datagram(src, dst, src_port, dst_port, payload);
        self.send_ip(protocol::UDP, src, dst, &datagram);
    }

    pub(crate) fn answer_dns(
        &mut self,
        query: &DnsQuery,
        server: Ipv4Addr,
        client: Ipv4Addr,
        client_port: u16,
        address: Ipv4Addr,
        ttl_secs: u32,
    ) {
        let response = query.build_response(address, ttl_secs);
        self.send_udp(server, DNS_PORT, client, client_port, &response);
    }

    /// Count a flow, tolerating a full stats table.
    pub(crate) fn record_flow(&mut self, flow: FlowTuple, direction: Direction, bytes: usize, now: Millis) {
        if let Err(err) = self.flows.record(flow, direction, bytes, now) {
            debug!(%err, "flow not tracked");
        }
    }

    pub(crate) fn dhcp_params(&self, local_addr: Ipv4Addr) -> ServerParams {
        let dhcp = &self.config.dhcp;
        let server_addr = if dhcp.server_address.is_unspecified() {
            local_addr
        } else {
            dhcp.server_address
        };
        ServerParams {
            server_addr,
            subnet_mask: dhcp.subnet_mask,
            router: dhcp.router,
            dns_server: dhcp.dns_server,
        }
    }

    pub(crate) fn record_drop(&mut self, err: &NetError) {
        self.stats.dropped.record(err);
        if err.is_silent_drop() {
            debug!(%err, "packet dropped");
        } else {
            warn!(%err, "packet dropped");
        }
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    pub fn interfaces_mut(&mut self) -> &mut InterfaceTable {
        &mut self.interfaces
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut RouteTable {
        &mut self.routes
    }

    pub fn firewall(&self) -> &FirewallEngine {
        &self.firewall
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionTable {
        &mut self.connections
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.dns_cache
    }

    /// Queries waiting on an upstream answer.
    pub fn pending_dns_queries(&self) -> usize {
        self.pending_dns.len()
    }

    pub fn leases(&self) -> &LeasePool {
        &self.leases
    }

    pub fn leases_mut(&mut self) -> &mut LeasePool {
        &mut self.leases
    }

    pub fn flow_stats(&self) -> &FlowStats {
        &self.flows
    }

    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn egress(&self) -> &E {
        &self.egress
    }

    pub fn egress_mut(&mut self) -> &mut E {
        &mut self.egress
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }
}
