//! UPnP IGD port mapping: SSDP discovery plus SOAP calls against the
//! WANIPConnection service.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, trace};
use url::Url;

use crate::addr;

/// Multicast address SSDP searches are sent to.
const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Port SSDP searches are sent to.
const SSDP_PORT: u16 = 1900;

/// Window during which SSDP responses are accumulated.
const SSDP_COLLECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for fetching a device description document.
const DESCRIPTION_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for a SOAP call against the control url.
const SOAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Device type searched for. Only internet gateways answer it.
const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Service the SOAP calls are addressed to.
const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Description attached to mappings registered by this client.
const PORT_MAPPING_DESCRIPTION: &str = "portmapper";

/// Error of a SOAP invocation against the gateway.
#[derive(Debug, derive_more::Display, thiserror::Error)]
pub enum InvokeError {
    /// The http request could not be performed.
    #[display("http request failed: {_0}")]
    Http(#[from] reqwest::Error),
    /// The gateway did not answer within [`SOAP_TIMEOUT`].
    #[display("gateway did not answer the call in time")]
    Timeout,
    /// The gateway answered 500 with a fault description.
    #[display("gateway rejected the call: {_0}")]
    Fault(String),
    /// The gateway answered with an unexpected http status.
    #[display("gateway answered with status {_0}")]
    Status(u16),
}

/// Whether an error reports a mapping conflict at the gateway.
///
/// A conflict means some mapping already occupies the port, which is evidence
/// the WANIPConnection service is alive even though the call failed.
pub(crate) fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<InvokeError>(),
        Some(InvokeError::Fault(description)) if description.contains("ConflictInMappingEntry")
    )
}

/// A mapping registered with the WANIPConnection service of a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Control url of the service this mapping was created on, retained so
    /// deletion can skip discovery.
    control_url: Url,
    /// Local ip declared as the internal client of the mapping.
    local_ip: Ipv4Addr,
    /// Local port of the mapping.
    local_port: NonZeroU16,
    /// External port of the mapping.
    external_port: NonZeroU16,
}

impl Mapping {
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_port(&self) -> NonZeroU16 {
        self.local_port
    }

    pub fn external_port(&self) -> NonZeroU16 {
        self.external_port
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    /// Register a mapping with the gateway's WANIPConnection service.
    ///
    /// Discovery is skipped when a control url is already known. A preferred
    /// external port of 0 requests the local port, since AddPortMapping has no
    /// gateway-chooses mode.
    pub(crate) async fn new(
        local_ips: &[Ipv4Addr],
        control_url: Option<Url>,
        local_port: NonZeroU16,
        preferred_external_port: u16,
        lifetime_seconds: u32,
    ) -> anyhow::Result<Self> {
        let control_url = match control_url {
            Some(url) => url,
            None => discover_control_url().await?,
        };

        let local_ip = client_ip_for(local_ips, &control_url)
            .context("no local ip to declare as internal client")?;
        let external_port = match NonZeroU16::new(preferred_external_port) {
            Some(port) => port,
            None => local_port,
        };

        let envelope = add_port_mapping_envelope(
            external_port.into(),
            local_port.into(),
            local_ip,
            lifetime_seconds,
        );
        invoke(&control_url, "AddPortMapping", envelope).await?;

        Ok(Mapping {
            control_url,
            local_ip,
            local_port,
            external_port,
        })
    }

    /// Ask the gateway to drop this mapping, reusing the control url it was
    /// created on.
    pub(crate) async fn release(&self) -> bool {
        let envelope = delete_port_mapping_envelope(self.external_port.into());
        match invoke(&self.control_url, "DeletePortMapping", envelope).await {
            Ok(()) => true,
            Err(e) => {
                debug!("upnp release failed: {e}");
                false
            }
        }
    }
}

/// Locates the WANIPConnection control url of a gateway on the local network.
///
/// Sends an SSDP M-SEARCH, accumulates every response within the collection
/// window, then scrapes the advertised device descriptions until one yields a
/// control url.
pub(crate) async fn discover_control_url() -> anyhow::Result<Url> {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let search = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {SEARCH_TARGET}\r\n\
         \r\n"
    );
    socket
        .send_to(search.as_bytes(), (SSDP_MULTICAST_ADDR, SSDP_PORT))
        .await?;

    let mut responses = Vec::new();
    let deadline = tokio::time::sleep(SSDP_COLLECT_TIMEOUT);
    tokio::pin!(deadline);
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            received = socket.recv_from(&mut buf) => {
                let (read, from) = received?;
                trace!("ssdp response from {from}");
                if let Ok(response) = std::str::from_utf8(&buf[..read]) {
                    responses.push(response.to_string());
                }
            }
        }
    }
    drop(socket);
    anyhow::ensure!(!responses.is_empty(), "no gateway answered the ssdp search");

    for response in &responses {
        match control_url_from_ssdp_response(response).await {
            Ok(url) => return Ok(url),
            Err(e) => debug!("discarding ssdp response: {e}"),
        }
    }
    anyhow::bail!("no advertised device exposes a WANIPConnection control url")
}

async fn control_url_from_ssdp_response(response: &str) -> anyhow::Result<Url> {
    let location = location_header(response).context("response carries no LOCATION header")?;
    let location: Url = location.parse().context("LOCATION is not a valid url")?;

    let client = reqwest::Client::new();
    let description = tokio::time::timeout(DESCRIPTION_FETCH_TIMEOUT, async {
        client.get(location.clone()).send().await?.text().await
    })
    .await
    .map_err(|_| anyhow::anyhow!("device description fetch timed out"))??;

    scrape_control_url(&description, &location)
}

/// Extracts the value of the LOCATION header of an SSDP response.
///
/// The header name is matched case-insensitively; the value is kept as the
/// router sent it.
fn location_header(response: &str) -> Option<&str> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("location").then(|| value.trim())
    })
}

/// Finds the control url of the WANIPConnection service in a device
/// description.
///
/// This is a deliberate substring scan rather than an XML parse: plenty of
/// router firmware ships descriptions no conformant parser accepts. The
/// service entry is located by the `WANIPConnection` marker and the control
/// url is the next `<controlURL>` element after it.
fn scrape_control_url(description: &str, location: &Url) -> anyhow::Result<Url> {
    let service = description
        .find("WANIPConnection")
        .map(|at| &description[at..])
        .context("description advertises no WANIPConnection service")?;
    let raw = service
        .find("<controlURL>")
        .and_then(|start| {
            let after = &service[start + "<controlURL>".len()..];
            after.find("</controlURL>").map(|end| &after[..end])
        })
        .context("no controlURL follows the WANIPConnection service")?;
    resolve_control_url(location, raw.trim())
}

/// Resolves a control url against the scheme and host of the description's
/// location.
fn resolve_control_url(location: &Url, raw: &str) -> anyhow::Result<Url> {
    if raw.starts_with("http") {
        return raw.parse().context("controlURL is not a valid url");
    }
    let mut base = location.clone();
    base.set_path("/");
    base.set_query(None);
    base.set_fragment(None);
    base.join(raw.trim_start_matches('/'))
        .context("controlURL does not resolve against the device location")
}

/// Picks the local ip to declare as internal client: the one closest to the
/// gateway's control host.
fn client_ip_for(local_ips: &[Ipv4Addr], control_url: &Url) -> Option<Ipv4Addr> {
    match control_url.host_str().and_then(|host| host.parse().ok()) {
        Some(gateway) => addr::longest_prefix_match(local_ips, gateway),
        None => local_ips.first().copied(),
    }
}

async fn invoke(control_url: &Url, action: &str, envelope: String) -> Result<(), InvokeError> {
    let client = reqwest::Client::new();
    let request = client
        .post(control_url.clone())
        .header("Content-Type", "text/xml")
        .header("SOAPAction", format!("\"{SERVICE_TYPE}#{action}\""))
        .body(envelope);

    let response = tokio::time::timeout(SOAP_TIMEOUT, request.send())
        .await
        .map_err(|_| InvokeError::Timeout)??;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 500 {
        let description = error_description(&body)
            .unwrap_or("gateway answered 500 without a fault description");
        return Err(InvokeError::Fault(description.to_string()));
    }
    Err(InvokeError::Status(status.as_u16()))
}

fn add_port_mapping_envelope(
    external_port: u16,
    local_port: u16,
    local_ip: Ipv4Addr,
    lifetime_seconds: u32,
) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:AddPortMapping xmlns:u="{SERVICE_TYPE}">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{external_port}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
<NewInternalPort>{local_port}</NewInternalPort>
<NewInternalClient>{local_ip}</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>{PORT_MAPPING_DESCRIPTION}</NewPortMappingDescription>
<NewLeaseDuration>{lifetime_seconds}</NewLeaseDuration>
</u:AddPortMapping>
</s:Body>
</s:Envelope>"#
    )
}

fn delete_port_mapping_envelope(external_port: u16) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:DeletePortMapping xmlns:u="{SERVICE_TYPE}">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{external_port}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
</u:DeletePortMapping>
</s:Body>
</s:Envelope>"#
    )
}

/// Extracts the `<errorDescription>` of a SOAP fault body.
fn error_description(body: &str) -> Option<&str> {
    let start = body.find("<errorDescription>")? + "<errorDescription>".len();
    let end = body[start..].find("</errorDescription>")?;
    Some(&body[start..start + end])
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const DEVICE_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1</serviceType>
        <controlURL>/upnp/control/common</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <controlURL>/upnp/control/WANIPConn1</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_location_header() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        Location: http://192.168.1.1:5000/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        assert_eq!(
            location_header(response),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
        assert_eq!(location_header("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn test_scrape_control_url() {
        let location: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        let control = scrape_control_url(DEVICE_DESCRIPTION, &location).unwrap();
        // the WANCommonInterfaceConfig entry before the marker is skipped
        assert_eq!(
            control.as_str(),
            "http://192.168.1.1:5000/upnp/control/WANIPConn1"
        );
    }

    #[test]
    fn test_scrape_control_url_absolute() {
        let description = "... WANIPConnection:1 \
                           <controlURL>http://192.168.1.1:49000/ctl</controlURL>";
        let location: Url = "http://192.168.1.1:5000/rootDesc.xml".parse().unwrap();
        let control = scrape_control_url(description, &location).unwrap();
        assert_eq!(control.as_str(), "http://192.168.1.1:49000/ctl");
    }

    #[test]
    fn test_scrape_control_url_missing_service() {
        let location: Url = "http://192.168.1.1:5000/desc.xml".parse().unwrap();
        assert!(scrape_control_url("<root></root>", &location).is_err());
    }

    #[test]
    fn test_error_description() {
        let body = "<s:Envelope><s:Body><s:Fault>\
                    <errorCode>718</errorCode>\
                    <errorDescription>ConflictInMappingEntry</errorDescription>\
                    </s:Fault></s:Body></s:Envelope>";
        assert_eq!(error_description(body), Some("ConflictInMappingEntry"));
    }

    #[test]
    fn test_add_envelope_fields() {
        let envelope = add_port_mapping_envelope(50001, 5001, Ipv4Addr::new(192, 168, 1, 50), 0);
        assert!(envelope.contains("<NewExternalPort>50001</NewExternalPort>"));
        assert!(envelope.contains("<NewInternalPort>5001</NewInternalPort>"));
        assert!(envelope.contains("<NewInternalClient>192.168.1.50</NewInternalClient>"));
        assert!(envelope.contains("<NewProtocol>UDP</NewProtocol>"));
        assert!(envelope.contains("<NewEnabled>1</NewEnabled>"));
        assert!(envelope.contains("<NewLeaseDuration>0</NewLeaseDuration>"));
    }

    /// Answers every http request on an ephemeral port with `status` and
    /// `body`.
    async fn fake_control_endpoint(status: u16, body: &'static str) -> Url {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = vec![0u8; 4096];
                let _ = stream.read(&mut request).await.unwrap();
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\n\
                     Content-Type: text/xml\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });
        format!("http://127.0.0.1:{port}/upnp/control/WANIPConn1")
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_release_mapping() {
        let control_url = fake_control_endpoint(200, "<s:Envelope></s:Envelope>").await;
        let mapping = Mapping::new(
            &[Ipv4Addr::LOCALHOST],
            Some(control_url.clone()),
            NonZeroU16::new(5001).unwrap(),
            50001,
            0,
        )
        .await
        .unwrap();

        assert_eq!(mapping.external_port(), NonZeroU16::new(50001).unwrap());
        assert_eq!(mapping.control_url(), &control_url);
        assert!(mapping.release().await);
    }

    #[tokio::test]
    async fn test_fault_surfaces_description() {
        let control_url = fake_control_endpoint(
            500,
            "<s:Envelope><errorDescription>ConflictInMappingEntry</errorDescription></s:Envelope>",
        )
        .await;
        let result = Mapping::new(
            &[Ipv4Addr::LOCALHOST],
            Some(control_url),
            NonZeroU16::new(5001).unwrap(),
            50001,
            0,
        )
        .await;

        let err = result.unwrap_err();
        assert!(is_conflict(&err));
        assert!(err.to_string().contains("ConflictInMappingEntry"));
    }
}
