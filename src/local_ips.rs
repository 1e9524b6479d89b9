//! Discovery of the local addresses a mapping can be bound to.

use std::fmt::Debug;
use std::net::Ipv4Addr;

use anyhow::{ensure, Result};

/// Source of the host's private IPv4 addresses.
///
/// The portmapper needs to know which local interfaces exist to pick a source
/// address per gateway and to declare the internal client of a mapping. The
/// host environment provides them through this trait; [`SystemAddresses`] is
/// the default implementation backed by the OS interface table.
pub trait LocalAddressProvider: Debug + Send + Sync + 'static {
    /// Returns the private IPv4 addresses of this host, in interface order,
    /// without duplicates.
    fn private_ips(&self) -> Result<Vec<Ipv4Addr>>;
}

/// [`LocalAddressProvider`] backed by the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct SystemAddresses;

impl LocalAddressProvider for SystemAddresses {
    fn private_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let mut ips = Vec::new();
        for iface in default_net::interface::get_interfaces() {
            for net in &iface.ipv4 {
                let ip = net.addr;
                if ip.is_loopback() || ip.is_unspecified() || ip.is_link_local() {
                    continue;
                }
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        ensure!(!ips.is_empty(), "no private ipv4 address found");
        Ok(ips)
    }
}

/// Provider with a fixed address list, for tests and host environments that do
/// their own candidate harvesting.
#[derive(Debug, Clone)]
pub struct StaticAddresses(pub Vec<Ipv4Addr>);

impl LocalAddressProvider for StaticAddresses {
    fn private_ips(&self) -> Result<Vec<Ipv4Addr>> {
        ensure!(!self.0.is_empty(), "no private ipv4 address found");
        Ok(self.0.clone())
    }
}
