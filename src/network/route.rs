//! Static routing table.
//!
//! Lookup walks the entries in insertion order and returns the first one whose
//! network contains the destination. Entries are *not* ordered by prefix length, so
//! overlapping routes resolve by the order they were added.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{NetError, Result, Table};
use crate::network::network_of;

pub const DEFAULT_METRIC: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface: String,
    pub metric: u8,
}

impl RouteEntry {
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        network_of(dst, self.netmask) == self.network
    }

    /// Where a datagram for `dst` is sent: the gateway, or `dst` itself for an
    /// on-link route with no gateway.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        RouteTable {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Append a route.
    pub fn add(
        &mut self,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        interface: &str,
        metric: u8,
    ) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(NetError::TableFull(Table::Routes));
        }

        debug!(%network, %netmask, %gateway, interface, "route added");
        self.entries.push(RouteEntry {
            network: network_of(network, netmask),
            netmask,
            gateway,
            interface: interface.to_string(),
            metric,
        });
        Ok(())
    }

    /// Remove the first route for exactly `network`/`netmask`.
    pub fn remove(&mut self, network: Ipv4Addr, netmask: Ipv4Addr) -> Option<RouteEntry> {
        let network = network_of(network, netmask);
        let index = self
            .entries
            .iter()
            .position(|e| e.network == network && e.netmask == netmask)?;
        debug!(%network, %netmask, "route removed");
        Some(self.entries.remove(index))
    }

    /// First route, in insertion order, whose network contains `dst`.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<&RouteEntry> {
        self.entries.iter().find(|e| e.matches(dst))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
