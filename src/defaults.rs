//! Default values used in the portmapper.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Gateway addresses routers commonly ship with, used for blind fan-out when no
/// previously responding router is known.
///
/// Order matters: earlier entries are more commonly deployed and are preferred on
/// prefix-length ties.
pub(crate) const DEFAULT_ROUTER_CANDIDATES: [Ipv4Addr; 20] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(192, 168, 0, 254),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 8, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 86, 1),
    Ipv4Addr::new(192, 168, 3, 1),
    Ipv4Addr::new(192, 168, 50, 1),
    Ipv4Addr::new(192, 168, 4, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 2),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(10, 10, 1, 1),
    Ipv4Addr::new(172, 16, 0, 1),
];

/// Time to wait for a router to answer a NAT-PMP or PCP request before moving to
/// the next wave of candidates.
pub(crate) const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Local port used when probing NAT-PMP support.
///
/// The three probe ports are distinct so concurrent probes cannot collide with
/// each other at the gateway.
pub(crate) const NAT_PMP_PROBE_PORT: u16 = 55555;

/// Local port used when probing PCP support.
pub(crate) const PCP_PROBE_PORT: u16 = 55556;

/// Local port used when probing UPnP support.
pub(crate) const UPNP_PROBE_PORT: u16 = 55557;

/// Lifetime requested for probe mappings, in seconds.
///
/// Probe mappings are not tracked nor refreshed, so they are requested short and
/// left to expire at the gateway.
pub(crate) const PROBE_MAPPING_LIFETIME_SECONDS: u32 = 120;

/// Pace at which a mapping with requested lifetime 0 (infinite lease) is
/// re-negotiated.
pub(crate) const INFINITE_LEASE_REFRESH: Duration = Duration::from_secs(60 * 60 * 24);
