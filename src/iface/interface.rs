//! Network interface records
//!
//! An interface carries its addressing, link properties and traffic counters. The
//! stack decides whether a datagram is local by asking each enabled interface
//! whether the destination is its unicast address or one of its broadcast addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{NetError, Result, Table};
use crate::network::network_of;

pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_SPEED_BPS: u64 = 1_000_000_000;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Half,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl InterfaceCounters {
    pub fn record_rx(&mut self, bytes: usize) {
        self.rx_packets += 1;
        self.rx_bytes += bytes as u64;
    }

    pub fn record_tx(&mut self, bytes: usize) {
        self.tx_packets += 1;
        self.tx_bytes += bytes as u64;
    }
}

/// Network interface
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: MacAddr,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub primary_dns: Option<Ipv4Addr>,
    pub secondary_dns: Option<Ipv4Addr>,
    pub enabled: bool,
    pub dhcp_client: bool,
    pub mtu: u32,
    pub speed_bps: u64,
    pub duplex: Duplex,
    pub counters: InterfaceCounters,
}

impl NetworkInterface {
    /// Create an enabled interface with default link properties.
    pub fn new(
        name: &str,
        mac: MacAddr,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Self {
        NetworkInterface {
            name: name.to_string(),
            mac,
            address,
            netmask,
            gateway,
            primary_dns: None,
            secondary_dns: None,
            enabled: true,
            dhcp_client: false,
            mtu: DEFAULT_MTU,
            speed_bps: DEFAULT_SPEED_BPS,
            duplex: Duplex::Full,
            counters: InterfaceCounters::default(),
        }
    }

    /// Check if packet is destined for this interface
    pub fn is_for_us(&self, dst_addr: Ipv4Addr) -> bool {
        self.enabled && (dst_addr == self.address || self.is_broadcast_address(dst_addr))
    }

    /// Limited broadcast, or the directed broadcast of this interface's network.
    pub fn is_broadcast_address(&self, addr: Ipv4Addr) -> bool {
        if addr.is_broadcast() {
            return true;
        }
        let directed = u32::from(self.address) | !u32::from(self.netmask);
        u32::from(addr) == directed
    }

    pub fn network_address(&self) -> Ipv4Addr {
        network_of(self.address, self.netmask)
    }

    pub fn is_same_network(&self, addr: Ipv4Addr) -> bool {
        network_of(addr, self.netmask) == self.network_address()
    }
}

/// Bounded, ordered set of interfaces.
#[derive(Debug)]
pub struct InterfaceTable {
    interfaces: Vec<NetworkInterface>,
    capacity: usize,
}

impl InterfaceTable {
    pub fn new(capacity: usize) -> Self {
        InterfaceTable {
            interfaces: Vec::new(),
            capacity,
        }
    }

    pub fn add(&mut self, iface: NetworkInterface) -> Result<()> {
        if self.interfaces.len() >= self.capacity {
            return Err(NetError::TableFull(Table::Interfaces));
        }
        self.interfaces.push(iface);
        Ok(())
    }

    /// The first enabled interface that accepts `dst` as local.
    pub fn local_for(&mut self, dst: Ipv4Addr) -> Option<&mut NetworkInterface> {
        self.interfaces.iter_mut().find(|i| i.is_for_us(dst))
    }

    pub fn is_local(&self, dst: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.is_for_us(dst))
    }

    pub fn by_name(&self, name: &str) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut NetworkInterface> {
        self.interfaces.iter_mut().find(|i| i.name == name)
    }

    /// Source address for traffic the stack originates toward `dst`.
    pub fn source_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        let enabled = || self.interfaces.iter().filter(|i| i.enabled);
        enabled()
            .find(|i| i.is_same_network(dst))
            .or_else(|| enabled().next())
            .map(|i| i.address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkInterface> {
        self.interfaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkInterface> {
        self.interfaces.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface() -> NetworkInterface {
        NetworkInterface::new(
            "eth0",
            MacAddr([2, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 1, 254),
        )
    }

    #[test]
    fn test_network_interface_creation() {
        let iface = iface();
        assert_eq!(iface.address, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(iface.mtu, DEFAULT_MTU);
        assert!(iface.enabled);
    }

    #[test]
    fn test_broadcast_detection() {
        let iface = iface();
        assert!(iface.is_broadcast_address(Ipv4Addr::BROADCAST));
        assert!(iface.is_broadcast_address(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!iface.is_broadcast_address(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_same_network_detection() {
        let iface = iface();
        assert!(iface.is_same_network(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(!iface.is_same_network(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn disabled_interface_accepts_nothing() {
        let mut iface = iface();
        iface.enabled = false;
        assert!(!iface.is_for_us(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn mac_parsing() {
        let mac: MacAddr = "02:AA:bb:cc:dd:0e".parse().unwrap();
        assert_eq!(mac, MacAddr([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x0e]));
        assert_eq!(mac.to_string(), "02:aa:bb:cc:dd:0e");
        assert!("02:aa:bb".parse::<MacAddr>().is_err());
        assert!("02:aa:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn table_capacity_and_source_selection() {
        let mut table = InterfaceTable::new(1);
        table.add(iface()).unwrap();
        assert_eq!(table.add(iface()), Err(NetError::TableFull(Table::Interfaces)));
        assert_eq!(
            table.source_for(Ipv4Addr::new(8, 8, 8, 8)),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert!(table.is_local(Ipv4Addr::new(192, 168, 1, 255)));
    }
}
