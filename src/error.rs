//! Error types shared by every layer of the stack.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// The bounded tables owned by a [`NetworkStack`](crate::stack::NetworkStack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Interfaces,
    Routes,
    FirewallRules,
    Connections,
    DnsCache,
    PendingDns,
    Leases,
    FlowStats,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::Interfaces => "interface",
            Table::Routes => "route",
            Table::FirewallRules => "firewall rule",
            Table::Connections => "connection",
            Table::DnsCache => "dns cache",
            Table::PendingDns => "pending dns query",
            Table::Leases => "lease",
            Table::FlowStats => "flow stats",
        };
        f.write_str(name)
    }
}

/// Why a packet was not accepted, or why an administrative call failed.
///
/// Everything except [`NetError::TableFull`] is a silent drop: no reply leaves the stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("checksum mismatch: header carries {expected:#06x}, computed {computed:#06x}")]
    ChecksumFailed { expected: u16, computed: u16 },

    #[error("{0} table full")]
    TableFull(Table),

    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("denied by firewall")]
    FirewallDenied,

    #[error("unknown IP protocol {0}")]
    UnknownProtocol(u8),

    #[error("time to live exceeded in transit")]
    TtlExceeded,

    #[error("segment for unknown connection")]
    NoConnection,

    #[error("unsupported message: {0}")]
    UnsupportedMessage(&'static str),

    #[error("address pool exhausted")]
    PoolExhausted,
}

impl NetError {
    /// Returns true when the error should be absorbed without notifying the operator.
    pub fn is_silent_drop(&self) -> bool {
        !matches!(self, NetError::TableFull(_))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
