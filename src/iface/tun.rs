//! TUN device link.
//!
//! The device carries raw IPv4 datagrams (no packet information header). Received
//! datagrams are fed to the stack one at a time; everything the stack emits is
//! written back to the same device, and the host kernel routes it from there.

use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use tun_tap::{Iface, Mode};

use crate::service::dns::UpstreamQuery;
use crate::stack::{Application, Egress, Millis, NetworkStack};

const MAX_DATAGRAM: usize = 1504;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// TTL given to names resolved through the host resolver.
const RESOLVED_TTL_SECS: u32 = 300;

pub struct TunLink {
    iface: Arc<Iface>,
    started: Instant,
}

impl TunLink {
    /// Create (or attach to) the TUN device `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let iface = Iface::without_packet_info(name, Mode::Tun)?;
        info!(device = iface.name(), "TUN device created");
        Ok(TunLink {
            iface: Arc::new(iface),
            started: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }

    /// An [`Egress`] writing to this device.
    pub fn egress(&self) -> TunEgress {
        TunEgress {
            iface: Arc::clone(&self.iface),
            dns_forwards: Vec::new(),
        }
    }

    /// Milliseconds since the link was opened.
    pub fn now(&self) -> Millis {
        self.started.elapsed().as_millis() as Millis
    }

    /// Receive and process datagrams until the device fails.
    ///
    /// Upstream DNS queries are answered through the host resolver between packets.
    pub fn run<A: Application>(&self, stack: &mut NetworkStack<TunEgress, A>) -> io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut last_poll = Instant::now();

        loop {
            let nbytes = self.iface.recv(&mut buf)?;
            let now = self.now();
            match stack.process_ip_packet(&buf[..nbytes], now) {
                Ok(disposition) => debug!(bytes = nbytes, ?disposition, "processed"),
                Err(err) if err.is_silent_drop() => {}
                Err(err) => warn!(%err, "packet not processed"),
            }

            for query in stack.egress_mut().take_dns_forwards() {
                resolve(stack, &query, now);
            }

            if last_poll.elapsed() >= POLL_INTERVAL {
                stack.poll(now);
                last_poll = Instant::now();
            }
        }
    }
}

fn resolve<A: Application>(stack: &mut NetworkStack<TunEgress, A>, query: &UpstreamQuery, now: Millis) {
    let address = (query.name.as_str(), 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| {
            addrs.find_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
        });

    match address {
        Some(address) => {
            if let Err(err) = stack.complete_dns_query(&query.name, address, RESOLVED_TTL_SECS, now) {
                warn!(name = %query.name, %err, "could not cache answer");
            }
        }
        None => {
            let dropped = stack.abandon_dns_query(&query.name);
            debug!(name = %query.name, dropped, "host resolver has no IPv4 answer");
        }
    }
}

/// Writes datagrams to a TUN device.
///
/// Forwarded datagrams go back to the host kernel, which routes them itself, so the
/// next hop is only logged. Upstream DNS queries are queued until the link loop
/// resolves them.
pub struct TunEgress {
    iface: Arc<Iface>,
    dns_forwards: Vec<UpstreamQuery>,
}

impl TunEgress {
    /// Upstream queries issued since the last call.
    pub fn take_dns_forwards(&mut self) -> Vec<UpstreamQuery> {
        std::mem::take(&mut self.dns_forwards)
    }

    fn write(&self, packet: &[u8]) {
        if let Err(err) = self.iface.send(packet) {
            warn!(%err, device = self.iface.name(), "failed to write datagram");
        }
    }
}

impl Egress for TunEgress {
    fn send_packet(&mut self, packet: &[u8]) {
        self.write(packet);
    }

    fn send_packet_to_gateway(&mut self, packet: &[u8], gateway: Ipv4Addr) {
        debug!(%gateway, len = packet.len(), "forward");
        self.write(packet);
    }

    fn forward_dns_query(&mut self, query: &UpstreamQuery) {
        info!(name = %query.name, upstream = %query.upstream, "upstream DNS query");
        self.dns_forwards.push(query.clone());
    }
}
