//! ICMP (Internet Control Message Protocol) - RFC 792
//!
//! The router handles echo request/reply and generates/translates the two
//! error types that carry an embedded datagram: destination unreachable
//! (type 3) and time exceeded (type 11).

use super::checksum::internet_checksum;
use crate::{Error, Result};

/// ICMP header size (type, code, checksum, rest-of-header)
pub const HEADER_SIZE: usize = 8;

/// Bytes of the offending datagram carried by type 3/11 messages:
/// the original IP header plus the first 8 payload bytes.
pub const ERROR_DATA_SIZE: usize = 28;

/// ICMP message types handled by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    EchoRequest = 8,
    TimeExceeded = 11,
}

impl IcmpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IcmpType::EchoReply),
            3 => Some(IcmpType::DestinationUnreachable),
            8 => Some(IcmpType::EchoRequest),
            11 => Some(IcmpType::TimeExceeded),
            _ => None,
        }
    }
}

/// The error messages the router originates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    /// Type 3 code 0: no route, or route loops back out the ingress
    NetUnreachable,
    /// Type 3 code 1: ARP resolution exhausted
    HostUnreachable,
    /// Type 3 code 3: closed port on the router or NAT rejection
    PortUnreachable,
    /// Type 11 code 0: TTL expired in transit
    TimeExceeded,
}

impl IcmpErrorKind {
    pub fn type_and_code(&self) -> (u8, u8) {
        match self {
            IcmpErrorKind::NetUnreachable => (IcmpType::DestinationUnreachable as u8, 0),
            IcmpErrorKind::HostUnreachable => (IcmpType::DestinationUnreachable as u8, 1),
            IcmpErrorKind::PortUnreachable => (IcmpType::DestinationUnreachable as u8, 3),
            IcmpErrorKind::TimeExceeded => (IcmpType::TimeExceeded as u8, 0),
        }
    }
}

/// Owned, mutable ICMP message for inspection and NAT rewriting
#[derive(Debug, Clone)]
pub struct IcmpMessage {
    buffer: Vec<u8>,
}

impl IcmpMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::malformed("icmp", "message too short"));
        }
        Ok(Self {
            buffer: data.to_vec(),
        })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn is_echo(&self) -> bool {
        self.buffer[0] == IcmpType::EchoRequest as u8 || self.buffer[0] == IcmpType::EchoReply as u8
    }

    /// True for the two error types that carry an embedded datagram.
    pub fn is_error(&self) -> bool {
        self.buffer[0] == IcmpType::DestinationUnreachable as u8
            || self.buffer[0] == IcmpType::TimeExceeded as u8
    }

    /// Echo identifier (only meaningful for echo request/reply)
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn set_identifier(&mut self, identifier: u16) {
        self.buffer[4..6].copy_from_slice(&identifier.to_be_bytes());
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// The offending datagram carried by a type 3/11 message.
    pub fn embedded_datagram(&self) -> Option<&[u8]> {
        if self.is_error() && self.buffer.len() > HEADER_SIZE {
            Some(&self.buffer[HEADER_SIZE..])
        } else {
            None
        }
    }

    pub fn embedded_datagram_mut(&mut self) -> Option<&mut [u8]> {
        if self.is_error() && self.buffer.len() > HEADER_SIZE {
            Some(&mut self.buffer[HEADER_SIZE..])
        } else {
            None
        }
    }

    /// Zero and recompute the checksum after mutation.
    pub fn update_checksum(&mut self) {
        self.buffer[2] = 0;
        self.buffer[3] = 0;
        let sum = internet_checksum(&self.buffer);
        self.buffer[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Verify the checksum of a received ICMP payload.
pub fn verify_checksum(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE && internet_checksum(data) == 0
}

/// Build an echo reply from an echo request payload: flip the type,
/// keep identifier, sequence, and data verbatim.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    if request.len() < HEADER_SIZE {
        return Err(Error::malformed("icmp", "echo request too short"));
    }

    let mut reply = request.to_vec();
    reply[0] = IcmpType::EchoReply as u8;
    reply[2] = 0;
    reply[3] = 0;

    let sum = internet_checksum(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());

    Ok(reply)
}

/// Build a type 3 or type 11 message embedding the first
/// [`ERROR_DATA_SIZE`] bytes of the offending datagram (zero-padded when
/// the datagram is shorter).
pub fn build_error(kind: IcmpErrorKind, original_datagram: &[u8]) -> Vec<u8> {
    let (icmp_type, code) = kind.type_and_code();

    let mut message = vec![0u8; HEADER_SIZE + ERROR_DATA_SIZE];
    message[0] = icmp_type;
    message[1] = code;

    let copy_len = original_datagram.len().min(ERROR_DATA_SIZE);
    message[HEADER_SIZE..HEADER_SIZE + copy_len]
        .copy_from_slice(&original_datagram[..copy_len]);

    let sum = internet_checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());

    message
}
