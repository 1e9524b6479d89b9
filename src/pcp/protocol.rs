//! Encoding and decoding of PCP frames.
//!
//! See [RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887).
//!
// NOTE: PCP options and the PEER and ANNOUNCE opcodes are not used by this
// client and therefore not implemented.

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod map_data;
mod request;
mod response;

pub use map_data::{MapData, MapProtocol};
pub use request::Request;
pub use response::{Error, ErrorCode, Response};

/// Port on which the gateway listens for PCP requests. Shared with NAT-PMP, see
/// [RFC 6887 section 19](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
pub const SERVER_PORT: u16 = 5351;

/// PCP version, per [RFC 6887 Version
/// Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    Pcp = 2,
}

/// Opcode of a PCP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Create or delete an endpoint-independent mapping.
    ///
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11).
    Map = 1,
}
