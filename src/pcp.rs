//! Definitions and utilities to interact with a PCP server.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use anyhow::Context;
use rand::RngCore;
use tracing::{debug, trace};

use crate::defaults::ATTEMPT_TIMEOUT;
use crate::{addr, race};

pub(crate) mod protocol;

/// A mapping successfully registered with a PCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Local ip used to create this mapping.
    local_ip: Ipv4Addr,
    /// Local port used to create this mapping.
    local_port: NonZeroU16,
    /// Gateway this mapping was registered with.
    gateway: Ipv4Addr,
    /// External port of the mapping.
    external_port: NonZeroU16,
    /// External address of the mapping.
    external_address: Ipv4Addr,
    /// Lifetime granted by the gateway, in seconds.
    lifetime_seconds: u32,
    /// The nonce of the mapping, reused for modifications with the PCP server,
    /// for example releasing the mapping.
    nonce: [u8; 12],
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

    pub fn external_address(&self) -> Ipv4Addr {
        self.external_address
    }

    pub fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }

    pub fn nonce(&self) -> [u8; 12] {
        self.nonce
    }
}

/// Attempt to register a mapping with any reachable PCP gateway.
///
/// Uses the same two-wave strategy as the NAT-PMP engine. PCP carries the
/// client address in the payload and gateways reject requests whose declared
/// address does not match the observed source, so the request is re-encoded
/// per target with the local ip closest to that gateway.
pub(crate) async fn map(
    local_ips: &[Ipv4Addr],
    router_cache: &[Ipv4Addr],
    server_port: u16,
    local_port: NonZeroU16,
    preferred_external_port: u16,
    lifetime_seconds: u32,
) -> anyhow::Result<Mapping> {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let (first, second) = addr::router_waves(router_cache, local_ips);
    for wave in [first, second] {
        if wave.is_empty() {
            continue;
        }
        trace!("racing pcp map against {wave:?}");
        let attempts = wave.iter().map(|gateway| {
            map_attempt(
                local_ips,
                *gateway,
                server_port,
                nonce,
                local_port,
                preferred_external_port,
                lifetime_seconds,
            )
        });
        if let Some(mapping) = race::race(attempts, ATTEMPT_TIMEOUT).await {
            return Ok(mapping);
        }
    }
    anyhow::bail!("no gateway answered the pcp map request")
}

async fn map_attempt(
    local_ips: &[Ipv4Addr],
    gateway: Ipv4Addr,
    server_port: u16,
    nonce: [u8; 12],
    local_port: NonZeroU16,
    preferred_external_port: u16,
    lifetime_seconds: u32,
) -> Option<Mapping> {
    let local_ip = addr::longest_prefix_match(local_ips, gateway)?;
    let request = protocol::Request::mapping(
        nonce,
        local_port.into(),
        local_ip,
        preferred_external_port,
        lifetime_seconds,
    );

    let socket = tokio::net::UdpSocket::bind((local_ip, 0)).await.ok()?;
    socket.connect((gateway, server_port)).await.ok()?;
    socket.send(&request.encode()).await.ok()?;

    let mut buffer = vec![0; protocol::Response::MAX_SIZE];
    let read = socket.recv(&mut buffer).await.ok()?;
    let response = match protocol::Response::decode(&buffer[..read]) {
        Ok(response) => response,
        Err(e) => {
            debug!("unusable reply from {gateway}: {e}");
            return None;
        }
    };

    match verify_map_response(nonce, local_port, local_ip, gateway, response) {
        Ok(mapping) => Some(mapping),
        Err(e) => {
            debug!("rejecting reply from {gateway}: {e}");
            None
        }
    }
}

/// Checks that a response matches the request it is paired with before
/// accepting it as a mapping.
fn verify_map_response(
    nonce: [u8; 12],
    local_port: NonZeroU16,
    local_ip: Ipv4Addr,
    gateway: Ipv4Addr,
    response: protocol::Response,
) -> anyhow::Result<Mapping> {
    let protocol::Response {
        lifetime_seconds,
        epoch_time: _,
        map,
    } = response;

    anyhow::ensure!(map.nonce == nonce, "received nonce does not match sent request");
    anyhow::ensure!(
        map.protocol == protocol::MapProtocol::Udp,
        "received mapping is not for UDP"
    );
    anyhow::ensure!(
        map.local_port == u16::from(local_port),
        "received mapping is for a local port that does not match the requested one"
    );
    let external_port = map
        .external_port
        .try_into()
        .map_err(|_| anyhow::anyhow!("received 0 external port for mapping"))?;
    let external_address = map
        .external_address
        .to_ipv4_mapped()
        .context("received external address is not ipv4")?;

    Ok(Mapping {
        local_ip,
        local_port,
        gateway,
        external_port,
        external_address,
        lifetime_seconds,
        nonce,
    })
}

impl Mapping {
    /// Ask the gateway to drop this mapping, reusing the nonce it was created
    /// with so the gateway can pair the deletion with the original MAP.
    ///
    /// NO_RESOURCES from the gateway means the mapping is already gone and
    /// counts as a successful release.
    pub(crate) async fn release(&self, server_port: u16) -> bool {
        match self.release_fallible(server_port).await {
            Ok(released) => released,
            Err(e) => {
                debug!("pcp release failed: {e}");
                false
            }
        }
    }

    async fn release_fallible(&self, server_port: u16) -> anyhow::Result<bool> {
        let request = protocol::Request::mapping(
            self.nonce,
            self.local_port.into(),
            self.local_ip,
            0,
            0,
        );

        let socket = tokio::net::UdpSocket::bind((self.local_ip, 0)).await?;
        socket.connect((self.gateway, server_port)).await?;
        socket.send(&request.encode()).await?;

        let mut buffer = vec![0; protocol::Response::MAX_SIZE];
        let read = tokio::time::timeout(ATTEMPT_TIMEOUT, socket.recv(&mut buffer)).await??;
        match protocol::Response::decode(&buffer[..read]) {
            Ok(_) => Ok(true),
            Err(protocol::Error::ResultCode(protocol::ErrorCode::NoResources)) => {
                trace!("gateway reported no resources, treating release as done");
                Ok(true)
            }
            Err(e) => {
                debug!("gateway rejected the release: {e}");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    /// A PCP gateway granting `grant_port`/`grant_address` for at most
    /// `max_lifetime` seconds, logging every decoded request.
    async fn fake_gateway(
        grant_port: u16,
        grant_address: Ipv4Addr,
        max_lifetime: u32,
        delete_result_code: u8,
    ) -> (u16, Arc<Mutex<Vec<protocol::Request>>>) {
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let request_log = log.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; protocol::Response::MAX_SIZE];
            loop {
                let (read, peer) = socket.recv_from(&mut buf).await.unwrap();
                let request = protocol::Request::decode(&buf[..read]);
                request_log.lock().unwrap().push(request);

                let deleting = request.lifetime_seconds() == 0;
                let mut response = protocol::Response {
                    lifetime_seconds: request.lifetime_seconds().min(max_lifetime),
                    epoch_time: 0,
                    map: protocol::MapData {
                        external_port: if deleting { 0 } else { grant_port },
                        external_address: if deleting {
                            Ipv4Addr::UNSPECIFIED.to_ipv6_mapped()
                        } else {
                            grant_address.to_ipv6_mapped()
                        },
                        ..*request.map_data()
                    },
                }
                .encode();
                if deleting {
                    response[3] = delete_result_code;
                }
                socket.send_to(&response, peer).await.unwrap();
            }
        });
        (port, log)
    }

    #[tokio::test]
    async fn test_map_grants_reduced_lifetime() {
        let (server_port, log) = fake_gateway(50000, Ipv4Addr::new(203, 0, 113, 7), 3600, 0).await;

        let mapping = map(
            &[Ipv4Addr::LOCALHOST],
            &[Ipv4Addr::LOCALHOST],
            server_port,
            NonZeroU16::new(5000).unwrap(),
            50000,
            7200,
        )
        .await
        .unwrap();

        assert_eq!(mapping.external_port(), NonZeroU16::new(50000).unwrap());
        assert_eq!(mapping.external_address(), Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(mapping.lifetime_seconds(), 3600);

        // the gateway saw the nonce the mapping retains
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].map_data().nonce, mapping.nonce());
    }

    #[tokio::test]
    async fn test_release_reuses_nonce() {
        let (server_port, log) = fake_gateway(50000, Ipv4Addr::new(203, 0, 113, 7), 3600, 0).await;

        let mapping = map(
            &[Ipv4Addr::LOCALHOST],
            &[Ipv4Addr::LOCALHOST],
            server_port,
            NonZeroU16::new(5000).unwrap(),
            50000,
            3600,
        )
        .await
        .unwrap();

        assert!(mapping.release(server_port).await);

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let delete = &seen[1];
        assert_eq!(delete.lifetime_seconds(), 0);
        assert_eq!(delete.map_data().external_port, 0);
        assert_eq!(delete.map_data().nonce, mapping.nonce());
    }

    #[tokio::test]
    async fn test_release_accepts_no_resources() {
        let no_resources: u8 = protocol::ErrorCode::NoResources.into();
        let (server_port, _log) =
            fake_gateway(50000, Ipv4Addr::new(203, 0, 113, 7), 3600, no_resources).await;

        let mapping = map(
            &[Ipv4Addr::LOCALHOST],
            &[Ipv4Addr::LOCALHOST],
            server_port,
            NonZeroU16::new(5000).unwrap(),
            50000,
            3600,
        )
        .await
        .unwrap();

        assert!(mapping.release(server_port).await);
    }
}
