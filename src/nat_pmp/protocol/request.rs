//! A NAT-PMP request.

use super::{Opcode, Version};

/// A NAT-PMP UDP mapping request.
///
/// A request with `external_port` and `lifetime_seconds` both 0 asks the
/// gateway to delete the mapping for `local_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Local port to map.
    pub local_port: u16,
    /// External port the gateway is asked for. 0 lets the gateway choose.
    pub external_port: u16,
    /// Requested lifetime of the mapping in seconds.
    pub lifetime_seconds: u32,
}

impl Request {
    /// Size of an encoded [`Request`], in bytes.
    pub const ENCODED_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        2 + // local port
        2 + // external port
        4; // lifetime

    /// Encode this [`Request`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let Request {
            local_port,
            external_port,
            lifetime_seconds,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0] = Version::NatPmp.into();
        buf[1] = Opcode::MapUdp.into();
        // buf[2..4] reserved
        buf[4..6].copy_from_slice(&local_port.to_be_bytes());
        buf[6..8].copy_from_slice(&external_port.to_be_bytes());
        buf[8..12].copy_from_slice(&lifetime_seconds.to_be_bytes());
        buf
    }

    /// The request deleting the mapping registered for `local_port`.
    pub fn unmap(local_port: u16) -> Request {
        Request {
            local_port,
            external_port: 0,
            lifetime_seconds: 0,
        }
    }

    #[cfg(test)]
    #[track_caller]
    pub(crate) fn decode(buf: &[u8]) -> Self {
        let _version: Version = buf[0].try_into().unwrap();
        let _opcode: Opcode = buf[1].try_into().unwrap();
        // buf[2..4] reserved
        let local_port = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let external_port = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        let lifetime_seconds = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        Request {
            local_port,
            external_port,
            lifetime_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{Rng, SeedableRng};

    #[test]
    fn test_map_request_layout() {
        let request = Request {
            local_port: 5000,
            external_port: 50000,
            lifetime_seconds: 120,
        };
        let encoded = request.encode();
        assert_eq!(
            encoded,
            [0, 1, 0, 0, 0x13, 0x88, 0xC3, 0x50, 0x00, 0x00, 0x00, 0x78]
        );
    }

    #[test]
    fn test_unmap_request_zeroes_port_and_lifetime() {
        let encoded = Request::unmap(5000).encode();
        assert_eq!(&encoded[6..8], &[0, 0]);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let request = Request {
            local_port: gen.gen(),
            external_port: gen.gen(),
            lifetime_seconds: gen.gen(),
        };
        assert_eq!(request, Request::decode(&request.encode()));
    }
}
