//! Stateless packet filter.
//!
//! Rules are checked top to bottom and the first matching rule decides. A field left
//! as a wildcard (`None`, or zero when built from raw values) matches anything. When
//! no rule matches the packet is allowed.

use std::net::Ipv4Addr;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{NetError, Result, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The fields of a packet a rule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirewallRule {
    #[serde(default)]
    pub src_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub dst_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub src_port: Option<u16>,
    #[serde(default)]
    pub dst_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<u8>,
    pub action: Action,
    pub direction: Direction,
    #[serde(default)]
    pub description: String,
}

impl FirewallRule {
    /// Build a rule from raw field values, where zero means "any".
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
        action: Action,
        direction: Direction,
        description: &str,
    ) -> Self {
        FirewallRule {
            src_addr: Some(src_addr),
            dst_addr: Some(dst_addr),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            protocol: Some(protocol),
            action,
            direction,
            description: description.to_string(),
        }
        .normalized()
    }

    /// Fold explicit zero values into wildcards.
    fn normalized(mut self) -> Self {
        self.src_addr = self.src_addr.filter(|a| !a.is_unspecified());
        self.dst_addr = self.dst_addr.filter(|a| !a.is_unspecified());
        self.src_port = self.src_port.filter(|p| *p != 0);
        self.dst_port = self.dst_port.filter(|p| *p != 0);
        self.protocol = self.protocol.filter(|p| *p != 0);
        self
    }

    pub fn matches(&self, flow: &FlowTuple, direction: Direction) -> bool {
        fn field<T: PartialEq>(rule: Option<T>, value: T) -> bool {
            rule.map_or(true, |r| r == value)
        }

        self.direction == direction
            && field(self.src_addr, flow.src_addr)
            && field(self.dst_addr, flow.dst_addr)
            && field(self.src_port, flow.src_port)
            && field(self.dst_port, flow.dst_port)
            && field(self.protocol, flow.protocol)
    }
}

#[derive(Debug, Clone)]
pub struct FirewallEngine {
    rules: Vec<FirewallRule>,
    capacity: usize,
}

impl FirewallEngine {
    pub fn new(capacity: usize) -> Self {
        FirewallEngine {
            rules: Vec::new(),
            capacity,
        }
    }

    /// Append a rule below every existing rule.
    pub fn add_rule(&mut self, rule: FirewallRule) -> Result<()> {
        if self.rules.len() >= self.capacity {
            return Err(NetError::TableFull(Table::FirewallRules));
        }
        debug!(description = %rule.description, action = ?rule.action, "firewall rule added");
        self.rules.push(rule.normalized());
        Ok(())
    }

    /// Decide the fate of a flow.
    pub fn check(&self, flow: &FlowTuple, direction: Direction) -> Action {
        match self.rules.iter().find(|rule| rule.matches(flow, direction)) {
            Some(rule) => {
                trace!(description = %rule.description, action = ?rule.action, "firewall rule matched");
                rule.action
            }
            None => Action::Allow,
        }
    }

    /// Like [`FirewallEngine::check`], but a deny becomes [`NetError::FirewallDenied`].
    pub fn admit(&self, flow: &FlowTuple, direction: Direction) -> Result<()> {
        match self.check(flow, direction) {
            Action::Allow => Ok(()),
            Action::Deny => {
                debug!(
                    src = %flow.src_addr,
                    dst = %flow.dst_addr,
                    src_port = flow.src_port,
                    dst_port = flow.dst_port,
                    protocol = flow.protocol,
                    "firewall denied flow"
                );
                Err(NetError::FirewallDenied)
            }
        }
    }

    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }
}
