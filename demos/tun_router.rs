//! Run the stack on a TUN device.
//!
//! The host side of the device gets `--host-cidr`; the stack answers on
//! `--cidr`. Ping it, open TCP connections to it, ask it for DNS names or run a
//! DHCP client against it:
//!
//! ```sh
//! sudo cargo run --example tun_router -- --tun tun0 --cidr 10.0.0.1/24
//! ping 10.0.0.1
//! dig @10.0.0.1 example.com
//! ```
//!
//! Root privileges are required to create and configure the TUN device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use toy_router::iface::TunLink;
use toy_router::{MacAddr, NetworkStack, NullApplication, StackConfig};

mod utils;
use utils::network::{configure_interface, dhcp_pool_for, parse_ip_cidr};

#[derive(Parser, Debug)]
#[command(about = "Route, filter and answer IPv4 traffic on a TUN device.")]
struct Args {
    /// TUN device name.
    #[arg(long, default_value = "tun0")]
    tun: String,

    /// TOML stack configuration; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address of the stack on the device network.
    #[arg(long, default_value = "10.0.0.1/24")]
    cidr: String,

    /// Address of the host side of the device.
    #[arg(long, default_value = "10.0.0.254/24")]
    host_cidr: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => StackConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StackConfig::default(),
    };

    let link = TunLink::open(&args.tun).context("creating TUN device")?;
    configure_interface(link.name(), &args.host_cidr)?;

    // Without configured interfaces the stack lives on `--cidr`, and DHCP serves that network.
    let own_interface = if config.interfaces.is_empty() {
        let (address, netmask) = parse_ip_cidr(&args.cidr)?;
        match dhcp_pool_for(address, netmask) {
            Some((start, end)) => {
                config.dhcp.range_start = start;
                config.dhcp.range_end = end;
                config.dhcp.subnet_mask = netmask;
                config.dhcp.router = address;
                config.dhcp.dns_server = address;
            }
            None => {
                tracing::warn!(cidr = %args.cidr, "network too small for a DHCP pool, DHCP disabled");
                config.dhcp.enabled = false;
            }
        }
        Some((address, netmask))
    } else {
        None
    };

    let mut stack = NetworkStack::from_config(config, link.egress(), NullApplication)?;
    if let Some((address, netmask)) = own_interface {
        let (gateway, _) = parse_ip_cidr(&args.host_cidr)?;
        stack.add_network_interface(
            MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            address,
            netmask,
            gateway,
            link.name(),
        )?;
    }

    tracing::info!(device = link.name(), stack = %args.cidr, "listening");
    link.run(&mut stack)?;
    Ok(())
}
