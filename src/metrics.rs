use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Enum of metrics for the module
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub probes_started: Counter,
    pub mapping_attempts: Counter,
    pub mapping_failures: Counter,
    pub external_address_updated: Counter,
    pub pmp_probes: Counter,
    pub pmp_available: Counter,
    pub pcp_probes: Counter,
    pub pcp_available: Counter,
    pub upnp_probes: Counter,
    pub upnp_available: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            probes_started: Counter::new("Number of probing tasks started."),
            mapping_attempts: Counter::new("Number of mapping tasks started."),
            mapping_failures: Counter::new("Number of failed mapping tasks."),
            external_address_updated: Counter::new(
                "Number of times the external address obtained via port mapping was updated.",
            ),
            pmp_probes: Counter::new("Number of NAT-PMP probes executed."),
            pmp_available: Counter::new("Number of NAT-PMP probes that found it available."),
            pcp_probes: Counter::new("Number of PCP probes executed."),
            pcp_available: Counter::new("Number of PCP probes that found it available."),
            upnp_probes: Counter::new("Number of UPnP probes executed."),
            upnp_available: Counter::new("Number of UPnP probes that found it available."),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "portmap"
    }
}
