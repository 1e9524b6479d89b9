//! Port mapping client for NAT-PMP, PCP and UPnP IGD gateways.
//!
//! The [`Client`] negotiates inbound port mappings with the on-link gateway so
//! a host behind NAT can receive unsolicited traffic on a known external port.
//! Three protocols are tried, in order of how cheap they are to talk to:
//! NAT-PMP, PCP, and UPnP's WANIPConnection service. Whatever succeeds is kept
//! in an active-mapping table, renewed before the granted lease runs out, and
//! released again on [`Client::delete_mapping`] or [`Client::close`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use iroh_metrics::inc;
use tokio::task::AbortHandle;
use tracing::{debug, info_span, trace, Instrument};
use url::Url;

mod addr;
mod defaults;
mod local_ips;
mod mapping;
mod metrics;
mod nat_pmp;
mod pcp;
mod race;
mod upnp;

pub use local_ips::{LocalAddressProvider, StaticAddresses, SystemAddresses};
pub use mapping::{Mapping, MappingProtocol};
pub use metrics::Metrics;

use defaults::{
    INFINITE_LEASE_REFRESH, NAT_PMP_PROBE_PORT, PCP_PROBE_PORT, PROBE_MAPPING_LIFETIME_SECONDS,
    UPNP_PROBE_PORT,
};

/// Why a mapping could not be obtained.
///
/// Engines never panic and never surface protocol errors as exceptions; every
/// failure funnels into this type, whose display string is the last error
/// observed.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, thiserror::Error)]
#[display("{_0}")]
pub struct MappingError(String);

impl MappingError {
    /// Human-readable reason for the failure.
    pub fn reason(&self) -> &str {
        &self.0
    }
}

/// Output of a port mapping probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("portmap={{ UPnP: {upnp}, PMP: {pmp}, PCP: {pcp} }}")]
pub struct ProbeOutput {
    /// If UPnP can be considered available.
    pub upnp: bool,
    /// If PCP can be considered available.
    pub pcp: bool,
    /// If NAT-PMP can be considered available.
    pub pmp: bool,
}

impl ProbeOutput {
    /// Indicates if all port mapping protocols are available.
    pub fn all_available(&self) -> bool {
        self.upnp && self.pcp && self.pmp
    }
}

/// Protocol support discovered by probing.
///
/// Every field is `None` until a probe has run. The UPnP control url is cached
/// here so a later add can skip SSDP discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolSupportCache {
    pub nat_pmp: Option<bool>,
    pub pcp: Option<bool>,
    pub upnp: Option<bool>,
    pub upnp_control_url: Option<Url>,
}

impl ProtocolSupportCache {
    fn is_unset(&self) -> bool {
        self.nat_pmp.is_none() && self.pcp.is_none() && self.upnp.is_none()
    }

    /// The preferred supported protocol, if any is known to work.
    fn preferred(&self) -> Option<MappingProtocol> {
        [
            (MappingProtocol::NatPmp, self.nat_pmp),
            (MappingProtocol::Pcp, self.pcp),
            (MappingProtocol::Upnp, self.upnp),
        ]
        .into_iter()
        .find_map(|(protocol, supported)| (supported == Some(true)).then_some(protocol))
    }
}

/// Configures which port mapping protocols are enabled in the [`Client`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether UPnP is enabled.
    pub enable_upnp: bool,
    /// Whether PCP is enabled.
    pub enable_pcp: bool,
    /// Whether NAT-PMP is enabled.
    pub enable_nat_pmp: bool,
}

impl Default for Config {
    /// By default all port mapping protocols are enabled.
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_pcp: true,
            enable_nat_pmp: true,
        }
    }
}

impl Config {
    fn enabled(&self, protocol: MappingProtocol) -> bool {
        match protocol {
            MappingProtocol::NatPmp => self.enable_nat_pmp,
            MappingProtocol::Pcp => self.enable_pcp,
            MappingProtocol::Upnp => self.enable_upnp,
        }
    }
}

/// Port mapping client.
///
/// Cheap to clone; all clones share the same mapping table and caches.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    provider: Arc<dyn LocalAddressProvider>,
    state: Mutex<State>,
    /// Port NAT-PMP and PCP requests are sent to.
    nat_server_port: u16,
}

#[derive(Debug, Default)]
struct State {
    /// Currently active mappings, keyed by external port.
    active: HashMap<NonZeroU16, ActiveEntry>,
    /// Routers that have answered a request before, in first-success order.
    router_cache: Vec<Ipv4Addr>,
    support: ProtocolSupportCache,
}

#[derive(Debug)]
struct ActiveEntry {
    mapping: Mapping,
    /// Cancellation handle of the pending refresh or expiry timer.
    timer: Option<AbortHandle>,
}

impl ActiveEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Client {
    /// Creates a client using the system's network interfaces as address
    /// source.
    pub fn new(config: Config) -> Self {
        Self::build(config, Arc::new(SystemAddresses), nat_pmp::SERVER_PORT)
    }

    /// Creates a client with a custom local address source.
    pub fn with_provider(config: Config, provider: Arc<dyn LocalAddressProvider>) -> Self {
        Self::build(config, provider, nat_pmp::SERVER_PORT)
    }

    fn build(config: Config, provider: Arc<dyn LocalAddressProvider>, nat_server_port: u16) -> Self {
        Client {
            inner: Arc::new(Inner {
                config,
                provider,
                state: Mutex::new(State::default()),
                nat_server_port,
            }),
        }
    }

    /// Obtains a mapping from local port to external port.
    ///
    /// When no probe has run yet, the protocols are tried in order (NAT-PMP,
    /// then PCP, then UPnP) until one succeeds. Once the support cache is
    /// filled, the call goes straight to the preferred supported protocol.
    ///
    /// An `external_port` of 0 lets the gateway choose for NAT-PMP and PCP;
    /// the granted port is in the returned [`Mapping`]. A `lifetime_seconds`
    /// of 0 requests an infinite lease, renewed daily for the protocols that
    /// cannot grant one.
    pub async fn add_mapping(
        &self,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, MappingError> {
        let support = self.protocol_support_cache();
        if support.is_unset() {
            let mut last_error = MappingError("no port mapping protocol enabled".into());
            for protocol in [
                MappingProtocol::NatPmp,
                MappingProtocol::Pcp,
                MappingProtocol::Upnp,
            ] {
                if !self.inner.config.enabled(protocol) {
                    continue;
                }
                match self
                    .add_mapping_with(protocol, local_port, external_port, lifetime_seconds)
                    .await
                {
                    Ok(mapping) => return Ok(mapping),
                    Err(e) => {
                        debug!("{protocol} mapping failed: {e}");
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        } else {
            match support.preferred() {
                Some(protocol) => {
                    self.add_mapping_with(protocol, local_port, external_port, lifetime_seconds)
                        .await
                }
                None => Err(MappingError("No protocols supported".into())),
            }
        }
    }

    /// Obtains a mapping via NAT-PMP only.
    pub async fn add_mapping_nat_pmp(
        &self,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, MappingError> {
        self.add_mapping_with(MappingProtocol::NatPmp, local_port, external_port, lifetime_seconds)
            .await
    }

    /// Obtains a mapping via PCP only.
    pub async fn add_mapping_pcp(
        &self,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, MappingError> {
        self.add_mapping_with(MappingProtocol::Pcp, local_port, external_port, lifetime_seconds)
            .await
    }

    /// Obtains a mapping via UPnP only.
    pub async fn add_mapping_upnp(
        &self,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, MappingError> {
        self.add_mapping_with(MappingProtocol::Upnp, local_port, external_port, lifetime_seconds)
            .await
    }

    async fn add_mapping_with(
        &self,
        protocol: MappingProtocol,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, MappingError> {
        inc!(Metrics, mapping_attempts);
        match self
            .negotiate(protocol, local_port, external_port, lifetime_seconds)
            .await
        {
            Ok(mapping) => {
                self.register(mapping.clone());
                Ok(mapping)
            }
            Err(e) => {
                inc!(Metrics, mapping_failures);
                Err(MappingError(format!("{e:#}")))
            }
        }
    }

    async fn negotiate(
        &self,
        protocol: MappingProtocol,
        local_port: NonZeroU16,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> anyhow::Result<Mapping> {
        anyhow::ensure!(self.inner.config.enabled(protocol), "{protocol} is disabled");
        let local_ips = self.private_ips_or_err()?;
        let router_cache = self.router_ip_cache();
        let server_port = self.inner.nat_server_port;

        debug!("negotiating {protocol} mapping {local_port} -> {external_port}");
        match protocol {
            MappingProtocol::NatPmp => {
                let mapping = nat_pmp::map(
                    &local_ips,
                    &router_cache,
                    server_port,
                    local_port,
                    external_port,
                    lifetime_seconds,
                )
                .await?;
                self.remember_router(mapping.gateway());
                Ok(Mapping::from_nat_pmp(mapping, lifetime_seconds))
            }
            MappingProtocol::Pcp => {
                let mapping = pcp::map(
                    &local_ips,
                    &router_cache,
                    server_port,
                    local_port,
                    external_port,
                    lifetime_seconds,
                )
                .await?;
                self.remember_router(mapping.gateway());
                Ok(Mapping::from_pcp(mapping, lifetime_seconds))
            }
            MappingProtocol::Upnp => {
                let control_url = self.upnp_control_url();
                let mapping = upnp::Mapping::new(
                    &local_ips,
                    control_url,
                    local_port,
                    external_port,
                    lifetime_seconds,
                )
                .await?;
                self.cache_control_url(mapping.control_url().clone());
                Ok(Mapping::from_upnp(mapping, lifetime_seconds))
            }
        }
    }

    /// Inserts a mapping into the active table and arms its timer.
    ///
    /// A previous mapping on the same external port is displaced: its timer is
    /// cancelled before the new entry takes the slot.
    fn register(&self, mapping: Mapping) {
        let external_port = mapping.external_port();
        let timer = self.arm_timer(&mapping);
        let mut state = self.inner.state.lock().expect("poisoned");
        if let Some(mut old) = state.active.remove(&external_port) {
            old.cancel_timer();
        }
        state.active.insert(external_port, ActiveEntry { mapping, timer });
    }

    /// Arms the one-shot timer keeping an entry fresh.
    ///
    /// With an infinite lease requested the mapping is re-negotiated daily.
    /// When the gateway granted less than requested, the remainder is
    /// re-requested as the grant runs out. A full grant only needs the entry
    /// dropped once it expires. UPnP leases are granted verbatim and never
    /// renewed.
    fn arm_timer(&self, mapping: &Mapping) -> Option<AbortHandle> {
        let protocol = mapping.protocol();
        if protocol == MappingProtocol::Upnp {
            return None;
        }
        let requested = mapping.requested_lifetime_seconds();
        let actual = mapping.lifetime_seconds();
        let external_port = mapping.external_port();
        let local_port = mapping.internal_port();
        let inner = Arc::downgrade(&self.inner);

        let handle = if requested == 0 {
            spawn_refresh(inner, INFINITE_LEASE_REFRESH, protocol, local_port, external_port, 0)
        } else if actual < requested {
            spawn_refresh(
                inner,
                Duration::from_secs(actual.into()),
                protocol,
                local_port,
                external_port,
                requested - actual,
            )
        } else {
            spawn_expiry(inner, Duration::from_secs(actual.into()), external_port)
        };
        Some(handle)
    }

    /// Deletes the mapping on `external_port`.
    ///
    /// Returns whether the gateway acknowledged the deletion; an unknown port
    /// yields `false`. A pending refresh is cancelled before the deletion goes
    /// on the wire.
    pub async fn delete_mapping(&self, external_port: NonZeroU16) -> bool {
        let mapping = {
            let mut state = self.inner.state.lock().expect("poisoned");
            match state.active.get_mut(&external_port) {
                Some(entry) => {
                    entry.cancel_timer();
                    entry.mapping.clone()
                }
                None => return false,
            }
        };

        let local_ips = self.inner.provider.private_ips().unwrap_or_default();
        let router_cache = self.router_ip_cache();
        let released = mapping
            .release(&local_ips, &router_cache, self.inner.nat_server_port)
            .await;
        if released {
            let mut state = self.inner.state.lock().expect("poisoned");
            if let Some(mut entry) = state.active.remove(&external_port) {
                entry.cancel_timer();
            }
        } else {
            debug!("gateway did not acknowledge deletion of {external_port}");
        }
        released
    }

    /// Probes which port mapping protocols the gateway supports and fills the
    /// support cache. The previous cache contents are overwritten.
    pub async fn probe(&self) -> ProbeOutput {
        inc!(Metrics, probes_started);
        let (pmp, pcp, upnp) =
            tokio::join!(self.probe_nat_pmp(), self.probe_pcp(), self.probe_upnp());
        let output = ProbeOutput { upnp, pcp, pmp };
        debug!("probe output {output}");
        output
    }

    /// Probes NAT-PMP support with a blind mapping on the NAT-PMP probe port.
    pub async fn probe_nat_pmp(&self) -> bool {
        if !self.inner.config.enable_nat_pmp {
            self.update_support(|support| support.nat_pmp = Some(false));
            return false;
        }
        inc!(Metrics, pmp_probes);
        let probe_port = NonZeroU16::new(NAT_PMP_PROBE_PORT).expect("probe port is not zero");
        let available = match self
            .negotiate(
                MappingProtocol::NatPmp,
                probe_port,
                NAT_PMP_PROBE_PORT,
                PROBE_MAPPING_LIFETIME_SECONDS,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("nat-pmp probe failed: {e:#}");
                false
            }
        };
        if available {
            inc!(Metrics, pmp_available);
        }
        self.update_support(|support| support.nat_pmp = Some(available));
        available
    }

    /// Probes PCP support with a blind mapping on the PCP probe port.
    pub async fn probe_pcp(&self) -> bool {
        if !self.inner.config.enable_pcp {
            self.update_support(|support| support.pcp = Some(false));
            return false;
        }
        inc!(Metrics, pcp_probes);
        let probe_port = NonZeroU16::new(PCP_PROBE_PORT).expect("probe port is not zero");
        let available = match self
            .negotiate(
                MappingProtocol::Pcp,
                probe_port,
                PCP_PROBE_PORT,
                PROBE_MAPPING_LIFETIME_SECONDS,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("pcp probe failed: {e:#}");
                false
            }
        };
        if available {
            inc!(Metrics, pcp_available);
        }
        self.update_support(|support| support.pcp = Some(available));
        available
    }

    /// Probes UPnP support.
    ///
    /// Locates the WANIPConnection control url (cached for later adds) and
    /// attempts a mapping on the UPnP probe port. A mapping conflict reported
    /// by the gateway counts as support: the service answered, the port just
    /// happens to be taken.
    pub async fn probe_upnp(&self) -> bool {
        if !self.inner.config.enable_upnp {
            self.update_support(|support| support.upnp = Some(false));
            return false;
        }
        inc!(Metrics, upnp_probes);
        let available = self.probe_upnp_inner().await;
        if available {
            inc!(Metrics, upnp_available);
        }
        self.update_support(|support| support.upnp = Some(available));
        available
    }

    async fn probe_upnp_inner(&self) -> bool {
        let local_ips = match self.inner.provider.private_ips() {
            Ok(ips) => ips,
            Err(e) => {
                debug!("upnp probe failed: {e:#}");
                return false;
            }
        };
        let control_url = match self.upnp_control_url() {
            Some(url) => url,
            None => match upnp::discover_control_url().await {
                Ok(url) => {
                    self.cache_control_url(url.clone());
                    url
                }
                Err(e) => {
                    debug!("upnp probe failed: {e:#}");
                    return false;
                }
            },
        };

        let probe_port = NonZeroU16::new(UPNP_PROBE_PORT).expect("probe port is not zero");
        match upnp::Mapping::new(
            &local_ips,
            Some(control_url),
            probe_port,
            UPNP_PROBE_PORT,
            PROBE_MAPPING_LIFETIME_SECONDS,
        )
        .await
        {
            Ok(_) => true,
            Err(e) if upnp::is_conflict(&e) => {
                trace!("mapping conflict during upnp probe, service is live");
                true
            }
            Err(e) => {
                debug!("upnp probe failed: {e:#}");
                false
            }
        }
    }

    /// The currently active mappings, keyed by external port.
    pub fn active_mappings(&self) -> HashMap<NonZeroU16, Mapping> {
        let state = self.inner.state.lock().expect("poisoned");
        state
            .active
            .iter()
            .map(|(port, entry)| (*port, entry.mapping.clone()))
            .collect()
    }

    /// Routers that have answered a request before, in first-success order.
    pub fn router_ip_cache(&self) -> Vec<Ipv4Addr> {
        self.inner.state.lock().expect("poisoned").router_cache.clone()
    }

    /// The protocol support discovered so far.
    pub fn protocol_support_cache(&self) -> ProtocolSupportCache {
        self.inner.state.lock().expect("poisoned").support.clone()
    }

    /// The WANIPConnection control url discovered so far.
    pub fn upnp_control_url(&self) -> Option<Url> {
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .support
            .upnp_control_url
            .clone()
    }

    /// The host's private IPv4 addresses.
    pub fn private_ips(&self) -> Result<Vec<Ipv4Addr>, MappingError> {
        self.inner
            .provider
            .private_ips()
            .map_err(|_| MappingError("getPrivateIps failed".into()))
    }

    /// Releases every active mapping and cancels every pending timer.
    ///
    /// Deletions run concurrently; the call completes once all of them have
    /// settled. Calling this again afterwards completes immediately.
    pub async fn close(&self) {
        let mappings: Vec<Mapping> = {
            let mut state = self.inner.state.lock().expect("poisoned");
            state
                .active
                .drain()
                .map(|(_, mut entry)| {
                    entry.cancel_timer();
                    entry.mapping
                })
                .collect()
        };
        if mappings.is_empty() {
            return;
        }

        let local_ips = self.inner.provider.private_ips().unwrap_or_default();
        let router_cache = self.router_ip_cache();
        let server_port = self.inner.nat_server_port;
        futures::future::join_all(
            mappings
                .iter()
                .map(|mapping| mapping.release(&local_ips, &router_cache, server_port)),
        )
        .await;
    }

    fn private_ips_or_err(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        self.inner
            .provider
            .private_ips()
            .map_err(|_| anyhow::anyhow!("getPrivateIps failed"))
    }

    fn remember_router(&self, gateway: Ipv4Addr) {
        let mut state = self.inner.state.lock().expect("poisoned");
        if !state.router_cache.contains(&gateway) {
            state.router_cache.push(gateway);
        }
    }

    fn cache_control_url(&self, url: Url) {
        let mut state = self.inner.state.lock().expect("poisoned");
        state.support.upnp_control_url = Some(url);
    }

    fn update_support(&self, update: impl FnOnce(&mut ProtocolSupportCache)) {
        let mut state = self.inner.state.lock().expect("poisoned");
        update(&mut state.support);
    }
}

/// Spawns the timer re-negotiating a mapping for `lifetime_seconds` more (0 for
/// another infinite lease) once `delay` has passed.
fn spawn_refresh(
    inner: Weak<Inner>,
    delay: Duration,
    protocol: MappingProtocol,
    local_port: NonZeroU16,
    external_port: NonZeroU16,
    lifetime_seconds: u32,
) -> AbortHandle {
    let task: BoxFuture<'static, ()> = Box::pin(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        // detach this timer from its entry so re-registration does not abort
        // the task performing it
        {
            let mut state = inner.state.lock().expect("poisoned");
            if let Some(entry) = state.active.get_mut(&external_port) {
                entry.timer = None;
            }
        }
        let client = Client { inner };
        trace!("refreshing mapping on {external_port}");
        if let Err(e) = client
            .add_mapping_with(protocol, local_port, external_port.into(), lifetime_seconds)
            .await
        {
            debug!("failed to refresh mapping on {external_port}: {e}");
        }
    });
    tokio::spawn(task.instrument(info_span!("portmapper.refresh"))).abort_handle()
}

/// Spawns the timer dropping an entry whose full grant runs out after `delay`,
/// without renegotiation.
fn spawn_expiry(inner: Weak<Inner>, delay: Duration, external_port: NonZeroU16) -> AbortHandle {
    let task: BoxFuture<'static, ()> = Box::pin(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
            let mut state = inner.state.lock().expect("poisoned");
            if state.active.remove(&external_port).is_some() {
                debug!("mapping on {external_port} expired");
            }
        }
    });
    tokio::spawn(task.instrument(info_span!("portmapper.expiry"))).abort_handle()
}
