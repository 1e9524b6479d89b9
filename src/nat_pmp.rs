//! Definitions and utilities to interact with a NAT-PMP server.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use anyhow::Context;
use tracing::{debug, trace};

use crate::defaults::ATTEMPT_TIMEOUT;
use crate::{addr, race};

pub(crate) mod protocol;

pub(crate) use protocol::SERVER_PORT;

/// A mapping successfully registered with a NAT-PMP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Local ip of the interface facing the gateway.
    ///
    /// NAT-PMP responses carry no client address, so this is inferred from the
    /// responding gateway by longest prefix match.
    local_ip: Ipv4Addr,
    /// Local port of the mapping.
    local_port: NonZeroU16,
    /// Gateway this mapping was registered with.
    gateway: Ipv4Addr,
    /// External port granted by the gateway.
    external_port: NonZeroU16,
    /// Lifetime granted by the gateway, in seconds.
    lifetime_seconds: u32,
}

impl Mapping {
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_port(&self) -> NonZeroU16 {
        self.local_port
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn external_port(&self) -> NonZeroU16 {
        self.external_port
    }

    pub fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}

/// Attempt to register a mapping with any reachable NAT-PMP gateway.
///
/// Gateways are raced in two waves: first the previously seen routers plus the
/// default candidates on a local subnet, then the remaining default candidates.
/// The first usable reply wins.
pub(crate) async fn map(
    local_ips: &[Ipv4Addr],
    router_cache: &[Ipv4Addr],
    server_port: u16,
    local_port: NonZeroU16,
    preferred_external_port: u16,
    lifetime_seconds: u32,
) -> anyhow::Result<Mapping> {
    let request = protocol::Request {
        local_port: local_port.into(),
        external_port: preferred_external_port,
        lifetime_seconds,
    };

    let (gateway, response) = race_request(local_ips, router_cache, server_port, request)
        .await
        .context("no gateway answered the nat-pmp request")?;

    let external_port = response
        .external_port
        .try_into()
        .map_err(|_| anyhow::anyhow!("gateway granted a zero external port"))?;
    let local_ip = addr::longest_prefix_match(local_ips, gateway)
        .context("no local ip to bind the mapping to")?;

    Ok(Mapping {
        local_ip,
        local_port,
        gateway,
        external_port,
        lifetime_seconds: response.lifetime_seconds,
    })
}

/// Ask every reachable gateway to drop the mapping for `local_port`.
///
/// Returns whether any gateway acknowledged the deletion.
pub(crate) async fn release(
    local_ips: &[Ipv4Addr],
    router_cache: &[Ipv4Addr],
    server_port: u16,
    local_port: NonZeroU16,
) -> bool {
    let request = protocol::Request::unmap(local_port.into());
    race_request(local_ips, router_cache, server_port, request)
        .await
        .is_some()
}

async fn race_request(
    local_ips: &[Ipv4Addr],
    router_cache: &[Ipv4Addr],
    server_port: u16,
    request: protocol::Request,
) -> Option<(Ipv4Addr, protocol::Response)> {
    let (first, second) = addr::router_waves(router_cache, local_ips);
    for wave in [first, second] {
        if wave.is_empty() {
            continue;
        }
        trace!("racing nat-pmp request against {wave:?}");
        let attempts = wave
            .iter()
            .map(|gateway| request_attempt(local_ips, *gateway, server_port, request));
        if let Some(reply) = race::race(attempts, ATTEMPT_TIMEOUT).await {
            return Some(reply);
        }
    }
    None
}

/// Sends the request to a single gateway, resolving to its reply.
///
/// The socket lives only as long as this attempt; mismatched or malformed
/// replies drop the attempt without ending the race.
async fn request_attempt(
    local_ips: &[Ipv4Addr],
    gateway: Ipv4Addr,
    server_port: u16,
    request: protocol::Request,
) -> Option<(Ipv4Addr, protocol::Response)> {
    let local_ip = addr::longest_prefix_match(local_ips, gateway)?;
    let socket = tokio::net::UdpSocket::bind((local_ip, 0)).await.ok()?;
    socket.connect((gateway, server_port)).await.ok()?;
    socket.send(&request.encode()).await.ok()?;

    let mut buffer = vec![0; protocol::Response::ENCODED_SIZE];
    let read = socket.recv(&mut buffer).await.ok()?;
    match protocol::Response::decode(&buffer[..read]) {
        Ok(response) if response.private_port == request.local_port => Some((gateway, response)),
        Ok(response) => {
            debug!("{gateway} answered for local port {}, ignoring", response.private_port);
            None
        }
        Err(e) => {
            debug!("unusable reply from {gateway}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A gateway granting `grant_port` for at most `max_lifetime` seconds.
    async fn fake_gateway(grant_port: u16, max_lifetime: u32) -> u16 {
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (read, peer) = socket.recv_from(&mut buf).await.unwrap();
                let request = protocol::Request::decode(&buf[..read]);
                let deleting = request.lifetime_seconds == 0;
                let response = protocol::Response {
                    epoch_time: 0,
                    private_port: request.local_port,
                    external_port: if deleting { 0 } else { grant_port },
                    lifetime_seconds: request.lifetime_seconds.min(max_lifetime),
                };
                socket.send_to(&response.encode(), peer).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn test_map_against_cached_router() {
        let server_port = fake_gateway(50000, 120).await;
        let local_ips = [Ipv4Addr::LOCALHOST];
        let router_cache = [Ipv4Addr::LOCALHOST];

        let mapping = map(
            &local_ips,
            &router_cache,
            server_port,
            NonZeroU16::new(5000).unwrap(),
            50000,
            120,
        )
        .await
        .unwrap();

        assert_eq!(mapping.external_port(), NonZeroU16::new(50000).unwrap());
        assert_eq!(mapping.lifetime_seconds(), 120);
        assert_eq!(mapping.local_ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(mapping.gateway(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_map_fails_fast_without_candidates() {
        // no cached router and no default candidate on the loopback subnet:
        // both waves are empty and the attempt resolves without waiting for
        // the timeout
        let result = map(
            &[Ipv4Addr::LOCALHOST],
            &[],
            5351,
            NonZeroU16::new(5000).unwrap(),
            0,
            120,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_release_acknowledged() {
        let server_port = fake_gateway(50000, 120).await;
        let released = release(
            &[Ipv4Addr::LOCALHOST],
            &[Ipv4Addr::LOCALHOST],
            server_port,
            NonZeroU16::new(5000).unwrap(),
        )
        .await;
        assert!(released);
    }
}
