//! A NAT-PMP response.

use num_enum::TryFromPrimitive;

use super::{Opcode, Version};

/// A successful NAT-PMP mapping response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Seconds since the gateway's mapping state was reset.
    pub epoch_time: u32,
    /// Local port this response refers to.
    pub private_port: u16,
    /// External port the gateway granted.
    pub external_port: u16,
    /// Granted lifetime of the mapping in seconds.
    pub lifetime_seconds: u32,
}

/// Result codes a gateway can answer with. See [RFC 6886 section
/// 3.5](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed, e.g. the mapping feature has
    /// been turned off by the user.
    NotAuthorizedOrRefused = 2,
    /// Network failures, e.g. the NAT box itself has not obtained a DHCP lease.
    NetworkFailure = 3,
    /// The NAT box cannot create more mappings at this time.
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

/// Errors that can occur when decoding a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub enum Error {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The response indicator bit is not present.
    #[display("packet does not appear to be a response")]
    NotAResponse,
    #[display("invalid opcode received")]
    InvalidOpcode,
    #[display("invalid version received")]
    InvalidVersion,
    #[display("invalid result code received")]
    InvalidResultCode,
    /// The gateway answered with a non-success result code.
    #[display("gateway error: {_0:?}")]
    ResultCode(ResultCode),
}

impl Response {
    /// Size of an encoded mapping [`Response`], in bytes.
    pub const ENCODED_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a mapping response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;
        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let _: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        let result_bytes = u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| Error::InvalidResultCode)?;
        if result_code != ResultCode::Success {
            return Err(Error::ResultCode(result_code));
        }

        let epoch_time = u32::from_be_bytes(buf[4..8].try_into().expect("slice has the right len"));
        let private_port = u16::from_be_bytes(buf[8..10].try_into().expect("slice has the right len"));
        let external_port = u16::from_be_bytes(buf[10..12].try_into().expect("slice has the right len"));
        let lifetime_seconds =
            u32::from_be_bytes(buf[12..16].try_into().expect("slice has the right len"));

        Ok(Response {
            epoch_time,
            private_port,
            external_port,
            lifetime_seconds,
        })
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let Response {
            epoch_time,
            private_port,
            external_port,
            lifetime_seconds,
        } = self;
        let mut buf = vec![Version::NatPmp.into(), Self::INDICATOR | u8::from(Opcode::MapUdp)];
        buf.extend_from_slice(&0u16.to_be_bytes()); // result code: success
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        buf.extend_from_slice(&private_port.to_be_bytes());
        buf.extend_from_slice(&external_port.to_be_bytes());
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mapping_response() {
        // 50000 granted for 120s, as a gateway would answer a successful add
        let encoded = [
            0, 0x81, 0, 0, 0, 0, 0x4E, 0x20, 0x13, 0x88, 0xC3, 0x50, 0x00, 0x00, 0x00, 0x78,
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(response.private_port, 5000);
        assert_eq!(response.external_port, 50000);
        assert_eq!(response.lifetime_seconds, 120);
        assert_eq!(&response.encode(), &encoded);
    }

    #[test]
    fn test_decode_error_code() {
        let mut encoded = Response {
            epoch_time: 0,
            private_port: 5000,
            external_port: 0,
            lifetime_seconds: 0,
        }
        .encode();
        encoded[3] = 2; // not authorized
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::ResultCode(ResultCode::NotAuthorizedOrRefused))
        );
    }

    #[test]
    fn test_decode_rejects_requests() {
        let encoded = crate::nat_pmp::protocol::Request {
            local_port: 5000,
            external_port: 50000,
            lifetime_seconds: 120,
        }
        .encode();
        let mut padded = encoded.to_vec();
        padded.extend_from_slice(&[0; 4]);
        assert_eq!(Response::decode(&padded), Err(Error::NotAResponse));
    }
}
