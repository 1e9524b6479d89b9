//! Encoding and decoding of NAT-PMP frames.
//!
//! See [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886).

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod request;
mod response;

pub use request::Request;
pub use response::{Error, Response};

/// Port on which the gateway listens for NAT-PMP requests.
pub const SERVER_PORT: u16 = 5351;

/// NAT-PMP version. The protocol predates PCP's version negotiation and is
/// always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    NatPmp = 0,
}

/// Opcode of a NAT-PMP request.
// NOTE: the RFC also defines external-address (0) and TCP (2) opcodes, which
// this client has no use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Request a UDP mapping. See [RFC 6886 section
    /// 3.3](https://datatracker.ietf.org/doc/html/rfc6886#section-3.3).
    MapUdp = 1,
}
