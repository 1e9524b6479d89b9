//! A port mapping created with one of the supported protocols.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use url::Url;

use crate::{nat_pmp, pcp, upnp};

/// Protocol a mapping was negotiated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum MappingProtocol {
    #[display("NAT-PMP")]
    NatPmp,
    #[display("PCP")]
    Pcp,
    #[display("UPnP")]
    Upnp,
}

/// An active port mapping.
///
/// Beyond the fields common to every protocol, each variant retains what its
/// protocol needs to delete the mapping later: the PCP nonce and gateway, or
/// the UPnP control url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Lifetime originally asked for, in seconds. 0 requests an infinite
    /// lease.
    requested_lifetime_seconds: u32,
    variant: Variant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Variant {
    NatPmp(nat_pmp::Mapping),
    Pcp(pcp::Mapping),
    Upnp(upnp::Mapping),
}

impl Mapping {
    pub(crate) fn from_nat_pmp(mapping: nat_pmp::Mapping, requested_lifetime_seconds: u32) -> Self {
        Mapping {
            requested_lifetime_seconds,
            variant: Variant::NatPmp(mapping),
        }
    }

    pub(crate) fn from_pcp(mapping: pcp::Mapping, requested_lifetime_seconds: u32) -> Self {
        Mapping {
            requested_lifetime_seconds,
            variant: Variant::Pcp(mapping),
        }
    }

    pub(crate) fn from_upnp(mapping: upnp::Mapping, requested_lifetime_seconds: u32) -> Self {
        Mapping {
            requested_lifetime_seconds,
            variant: Variant::Upnp(mapping),
        }
    }

    /// Protocol this mapping was negotiated with.
    pub fn protocol(&self) -> MappingProtocol {
        match &self.variant {
            Variant::NatPmp(_) => MappingProtocol::NatPmp,
            Variant::Pcp(_) => MappingProtocol::Pcp,
            Variant::Upnp(_) => MappingProtocol::Upnp,
        }
    }

    /// Local address the mapping points at.
    pub fn internal_ip(&self) -> Ipv4Addr {
        match &self.variant {
            Variant::NatPmp(m) => m.local_ip(),
            Variant::Pcp(m) => m.local_ip(),
            Variant::Upnp(m) => m.local_ip(),
        }
    }

    /// Local port the mapping points at.
    pub fn internal_port(&self) -> NonZeroU16 {
        match &self.variant {
            Variant::NatPmp(m) => m.local_port(),
            Variant::Pcp(m) => m.local_port(),
            Variant::Upnp(m) => m.local_port(),
        }
    }

    /// External port of the mapping.
    pub fn external_port(&self) -> NonZeroU16 {
        match &self.variant {
            Variant::NatPmp(m) => m.external_port(),
            Variant::Pcp(m) => m.external_port(),
            Variant::Upnp(m) => m.external_port(),
        }
    }

    /// External address of the mapping. Only PCP responses carry it.
    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        match &self.variant {
            Variant::Pcp(m) => Some(m.external_address()),
            Variant::NatPmp(_) | Variant::Upnp(_) => None,
        }
    }

    /// Lifetime originally asked for, in seconds.
    pub fn requested_lifetime_seconds(&self) -> u32 {
        self.requested_lifetime_seconds
    }

    /// Lifetime the gateway granted, in seconds.
    ///
    /// UPnP gateways grant exactly the requested lease, with 0 meaning
    /// indefinite.
    pub fn lifetime_seconds(&self) -> u32 {
        match &self.variant {
            Variant::NatPmp(m) => m.lifetime_seconds(),
            Variant::Pcp(m) => m.lifetime_seconds(),
            Variant::Upnp(_) => self.requested_lifetime_seconds,
        }
    }

    /// The PCP nonce of the mapping.
    pub fn nonce(&self) -> Option<[u8; 12]> {
        match &self.variant {
            Variant::Pcp(m) => Some(m.nonce()),
            Variant::NatPmp(_) | Variant::Upnp(_) => None,
        }
    }

    /// The control url the mapping was created on, for UPnP mappings.
    pub fn control_url(&self) -> Option<&Url> {
        match &self.variant {
            Variant::Upnp(m) => Some(m.control_url()),
            Variant::NatPmp(_) | Variant::Pcp(_) => None,
        }
    }

    /// Gateway the mapping was registered with, when one was raced for.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        match &self.variant {
            Variant::NatPmp(m) => Some(m.gateway()),
            Variant::Pcp(m) => Some(m.gateway()),
            Variant::Upnp(_) => None,
        }
    }

    /// Ask the gateway to drop this mapping, dispatching on the protocol it
    /// was created with.
    pub(crate) async fn release(
        &self,
        local_ips: &[Ipv4Addr],
        router_cache: &[Ipv4Addr],
        server_port: u16,
    ) -> bool {
        match &self.variant {
            Variant::NatPmp(m) => {
                nat_pmp::release(local_ips, router_cache, server_port, m.local_port()).await
            }
            Variant::Pcp(m) => m.release(server_port).await,
            Variant::Upnp(m) => m.release().await,
        }
    }
}
