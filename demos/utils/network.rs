use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{bail, Context, Result};

fn ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .context("failed to run `ip`")?;
    if !status.success() {
        bail!("`ip {}` exited with {}", args.join(" "), status);
    }
    Ok(())
}

/// Assign `ip_cidr` to the host side of the device and bring it up.
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> Result<()> {
    ip(&["addr", "add", ip_cidr, "dev", iface_name])
        .with_context(|| format!("configuring {ip_cidr} on {iface_name}"))?;
    ip(&["link", "set", "up", "dev", iface_name])
        .with_context(|| format!("bringing up {iface_name}"))?;

    tracing::info!(iface = iface_name, cidr = ip_cidr, "interface configured and up");
    Ok(())
}

/// Split `a.b.c.d/len` into an address and a netmask.
pub fn parse_ip_cidr(ip_cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let (addr, prefix) = ip_cidr
        .split_once('/')
        .with_context(|| format!("{ip_cidr:?} is not in a.b.c.d/len form"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid address in {ip_cidr:?}"))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("invalid prefix length in {ip_cidr:?}"))?;
    if prefix > 32 {
        bail!("prefix length {prefix} out of range");
    }

    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Ok((addr, Ipv4Addr::from(mask)))
}

/// Hosts `.100` through `.199` of the network `address/netmask`, or `None` when the
/// network is too small to hold them.
pub fn dhcp_pool_for(address: Ipv4Addr, netmask: Ipv4Addr) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let mask = u32::from(netmask);
    if !mask < 200 {
        return None;
    }
    let network = u32::from(address) & mask;
    Some((Ipv4Addr::from(network + 100), Ipv4Addr::from(network + 199)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_follows_the_stack_network() {
        let (address, netmask) = parse_ip_cidr("10.0.0.1/24").unwrap();
        assert_eq!(
            dhcp_pool_for(address, netmask),
            Some((Ipv4Addr::new(10, 0, 0, 100), Ipv4Addr::new(10, 0, 0, 199)))
        );

        let (address, netmask) = parse_ip_cidr("172.16.5.9/16").unwrap();
        assert_eq!(
            dhcp_pool_for(address, netmask),
            Some((Ipv4Addr::new(172, 16, 0, 100), Ipv4Addr::new(172, 16, 0, 199)))
        );
    }

    #[test]
    fn small_networks_get_no_pool() {
        let (address, netmask) = parse_ip_cidr("10.0.0.1/25").unwrap();
        assert_eq!(dhcp_pool_for(address, netmask), None);
    }
}
