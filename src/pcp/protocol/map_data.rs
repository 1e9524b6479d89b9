//! Opcode-specific payload of a MAP request or response.

use std::net::Ipv6Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Payload of a [`super::Opcode::Map`] request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapData {
    /// Nonce binding responses, refreshes and deletions to the original
    /// mapping.
    pub nonce: [u8; 12],
    /// Transport protocol of the mapping.
    pub protocol: MapProtocol,
    /// Local port of the mapping.
    pub local_port: u16,
    /// External port of the mapping. 0 in a request leaves the choice to the
    /// gateway.
    pub external_port: u16,
    /// External address of the mapping, as an IPv4-mapped IPv6 address for an
    /// IPv4 mapping.
    pub external_address: Ipv6Addr,
}

/// Transport protocol for which a mapping is requested, as an IANA protocol
/// number.
// NOTE: technically any IANA protocol is allowed; this client only maps UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    Udp = 17,
}

/// Generic error returned when decoding [`MapData`] fails.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidMapData;

impl MapData {
    /// Size of the encoded MAP payload, in bytes.
    pub const ENCODED_SIZE: usize = // parts:
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // local port
        2 + // external port
        16; // external address

    /// Encode this [`MapData`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&local_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..].copy_from_slice(&external_address.octets());
        buf
    }

    /// Decode a [`MapData`].
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidMapData> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(InvalidMapData);
        }

        let nonce = buf[..12].try_into().expect("slice has the right size");
        let protocol = buf[12].try_into().map_err(|_| InvalidMapData)?;
        // buf[13..16] reserved
        let local_port = u16::from_be_bytes(buf[16..18].try_into().expect("slice has the right size"));
        let external_port =
            u16::from_be_bytes(buf[18..20].try_into().expect("slice has the right size"));
        let external_addr_bytes: [u8; 16] = buf[20..Self::ENCODED_SIZE]
            .try_into()
            .expect("buffer size was verified");

        Ok(MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address: external_addr_bytes.into(),
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> MapData {
        let octets: [u8; 16] = rng.gen();
        MapData {
            nonce: rng.gen(),
            protocol: MapProtocol::Udp,
            local_port: rng.gen(),
            external_port: rng.gen(),
            external_address: octets.into(),
        }
    }
}
