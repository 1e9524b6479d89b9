//! A PCP request.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::{MapData, MapProtocol, Opcode, Version};

/// A PCP MAP request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// [`Version`] to use in this request.
    pub(super) version: Version,
    /// Requested lifetime in seconds.
    pub(super) lifetime_seconds: u32,
    /// IP address of the client, as an IPv4-mapped IPv6 address.
    ///
    /// The gateway rejects the request when this does not match the source
    /// address it observes, so the caller must set it to the address the
    /// request is sent from.
    pub(super) client_addr: Ipv6Addr,
    /// MAP payload of this request.
    pub(super) map: MapData,
}

impl Request {
    /// Size of an encoded [`Request`], in bytes.
    pub const ENCODED_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16 + // client ip
        MapData::ENCODED_SIZE;

    /// Encode this [`Request`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let Request {
            version,
            lifetime_seconds,
            client_addr,
            map,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0] = (*version).into();
        buf[1] = Opcode::Map.into();
        // buf[2..4] reserved
        buf[4..8].copy_from_slice(&lifetime_seconds.to_be_bytes());
        buf[8..24].copy_from_slice(&client_addr.octets());
        buf[24..].copy_from_slice(&map.encode());
        buf
    }

    /// Create a MAP request.
    ///
    /// An `external_port` of 0 lets the gateway pick; a `lifetime_seconds` of 0
    /// with an `external_port` of 0 deletes the mapping bound to `nonce`.
    pub fn mapping(
        nonce: [u8; 12],
        local_port: u16,
        local_ip: Ipv4Addr,
        external_port: u16,
        lifetime_seconds: u32,
    ) -> Request {
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr: local_ip.to_ipv6_mapped(),
            map: MapData {
                nonce,
                protocol: MapProtocol::Udp,
                local_port,
                external_port,
                external_address: Ipv4Addr::UNSPECIFIED.to_ipv6_mapped(),
            },
        }
    }

    #[cfg(test)]
    #[track_caller]
    pub(crate) fn decode(buf: &[u8]) -> Self {
        let version: Version = buf[0].try_into().unwrap();
        let _opcode: Opcode = buf[1].try_into().unwrap();
        // buf[2..4] reserved
        let lifetime_seconds = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let client_bytes: [u8; 16] = buf[8..24].try_into().unwrap();
        let map = MapData::decode(&buf[24..]).unwrap();
        Request {
            version,
            lifetime_seconds,
            client_addr: client_bytes.into(),
            map,
        }
    }

    #[cfg(test)]
    pub(crate) fn map_data(&self) -> &MapData {
        &self.map
    }

    #[cfg(test)]
    pub(crate) fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_request_layout() {
        let request = Request::mapping(
            [7; 12],
            5000,
            Ipv4Addr::new(192, 168, 1, 50),
            50000,
            7200,
        );
        let encoded = request.encode();
        assert_eq!(encoded.len(), 60);
        assert_eq!(encoded[0], 2); // version
        assert_eq!(encoded[1], 1); // MAP
        assert_eq!(&encoded[4..8], &7200u32.to_be_bytes());
        // client address is IPv4-mapped: ::ffff:192.168.1.50
        assert_eq!(&encoded[8..18], &[0; 10]);
        assert_eq!(&encoded[18..20], &[0xff, 0xff]);
        assert_eq!(&encoded[20..24], &[192, 168, 1, 50]);
        assert_eq!(&encoded[24..36], &[7; 12]); // nonce
        assert_eq!(encoded[36], 17); // UDP
        assert_eq!(&encoded[37..40], &[0; 3]); // reserved
        assert_eq!(&encoded[40..42], &5000u16.to_be_bytes());
        assert_eq!(&encoded[42..44], &50000u16.to_be_bytes());
        // suggested external address is the zero IPv4-mapped address
        assert_eq!(&encoded[44..54], &[0; 10]);
        assert_eq!(&encoded[54..56], &[0xff, 0xff]);
        assert_eq!(&encoded[56..60], &[0; 4]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let request = Request {
            version: Version::Pcp,
            lifetime_seconds: rand::Rng::gen(&mut gen),
            client_addr: Ipv4Addr::new(10, 0, 0, 2).to_ipv6_mapped(),
            map: MapData::random(&mut gen),
        };
        assert_eq!(request, Request::decode(&request.encode()));
    }
}
