//! A PCP response.

use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{MapData, Opcode, Version};

/// Error result codes of a PCP response.
///
/// Refer to [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4);
/// 0 (SUCCESS) is handled separately during decoding.
// NOTE: docs for each variant are largely adapted from the RFC's description of
// each code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display, thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// The version number at the start of the PCP request header is not
    /// recognized by the PCP server.
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    /// The requested operation is disabled for this PCP client, or the PCP
    /// client requested an operation that cannot be fulfilled by the PCP
    /// server's security policy.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// Unsupported opcode.
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    /// Unsupported option, in the mandatory-to-process range.
    #[display("option is not supported")]
    UnsuppOption = 5,
    /// Malformed option (e.g., appears too many times, invalid length).
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The PCP server or the device it controls is experiencing a network
    /// failure of some sort (e.g., has not yet obtained an external IP
    /// address). This is a short lifetime error.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// Request is well-formed and valid, but the server has insufficient
    /// resources to complete the requested operation at this time. This is a
    /// short lifetime error.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// Unsupported transport protocol, e.g., SCTP in a NAT that handles only
    /// UDP and TCP. This is a long lifetime error.
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    /// This attempt to create a new mapping would exceed this subscriber's port
    /// quota. This is a short lifetime error.
    #[display("quota exceeded")]
    UserExQuota = 10,
    /// The suggested external port and/or external address cannot be provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The source IP address of the request packet does not match the contents
    /// of the PCP client's IP address field.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The PCP server was not able to create the filters in this request.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// A successful PCP MAP response.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Granted lifetime of the mapping in seconds.
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    pub epoch_time: u32,
    /// MAP payload of this response.
    pub map: MapData,
}

/// Errors that can occur when decoding a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub enum Error {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The [`Response::INDICATOR`] is not present.
    #[display("packet does not appear to be a response")]
    NotAResponse,
    #[display("invalid opcode received")]
    InvalidOpcode,
    #[display("invalid version received")]
    InvalidVersion,
    #[display("invalid result code received")]
    InvalidResultCode,
    #[display("invalid map payload received")]
    InvalidMapData,
    /// The gateway answered with an error result code.
    #[display("gateway error: {_0}")]
    ResultCode(ErrorCode),
}

impl Response {
    /// Max size of a PCP packet as indicated in [RFC 6887 Common Request and
    /// Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7).
    pub const MAX_SIZE: usize = 1100;

    /// Size of an encoded MAP [`Response`], in bytes.
    pub const ENCODED_SIZE: usize = // parts:
        1 + // version
        1 + // opcode ORd with [`Response::INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12 + // reserved
        MapData::ENCODED_SIZE;

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a MAP response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::ENCODED_SIZE || buf.len() > Self::MAX_SIZE {
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

        // buf[2] reserved

        match buf[3] {
            0 => {}
            code => {
                let code: ErrorCode = code.try_into().map_err(|_| Error::InvalidResultCode)?;
                return Err(Error::ResultCode(code));
            }
        }

        let lifetime_seconds =
            u32::from_be_bytes(buf[4..8].try_into().expect("slice has the right len"));
        let epoch_time = u32::from_be_bytes(buf[8..12].try_into().expect("slice has the right len"));

        // buf[12..24] reserved

        let map = MapData::decode(&buf[24..]).map_err(|_| Error::InvalidMapData)?;

        Ok(Response {
            lifetime_seconds,
            epoch_time,
            map,
        })
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let Response {
            lifetime_seconds,
            epoch_time,
            map,
        } = self;
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        buf.push(Version::Pcp.into());
        buf.push(Self::INDICATOR | u8::from(Opcode::Map));
        buf.push(0); // reserved
        buf.push(0); // result code: success
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        buf.extend_from_slice(&[0; 12]); // reserved
        buf.extend_from_slice(&map.encode());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_encode_decode_map_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let response = Response {
            lifetime_seconds: rand::Rng::gen(&mut gen),
            epoch_time: rand::Rng::gen(&mut gen),
            map: MapData::random(&mut gen),
        };
        let encoded = response.encode();
        assert_eq!(Ok(response), Response::decode(&encoded));
    }

    #[test]
    fn test_decode_known_response_vector() {
        // only test vector in the tailscale impl
        let encoded = [
            2, 129, 0, 0, 0, 0, 28, 32, 0, 2, 155, 237, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 129,
            112, 9, 24, 241, 208, 251, 45, 157, 76, 10, 188, 17, 0, 0, 0, 4, 210, 4, 210, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 255, 255, 135, 180, 175, 246,
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(response.lifetime_seconds, 7200);
        assert_eq!(response.map.local_port, 1234);
        assert_eq!(response.map.external_port, 1234);
        assert_eq!(&response.encode(), &encoded);
    }

    #[test]
    fn test_decode_error_result_code() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let mut encoded = Response {
            lifetime_seconds: 0,
            epoch_time: 0,
            map: MapData::random(&mut gen),
        }
        .encode();
        encoded[3] = ErrorCode::NoResources.into();
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::ResultCode(ErrorCode::NoResources))
        );
    }
}
