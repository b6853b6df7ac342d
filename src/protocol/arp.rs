//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Fixed 28-byte Ethernet/IPv4 layout only.

use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// ARP packet size for Ethernet/IPv4
pub const PACKET_SIZE: usize = 28;

const HARDWARE_ETHERNET: u16 = 1;
const PROTOCOL_IPV4: u16 = 0x0800;

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// ARP packet (Ethernet/IPv4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < PACKET_SIZE {
            return Err(Error::malformed("arp", "packet too short"));
        }

        if u16::from_be_bytes([buffer[0], buffer[1]]) != HARDWARE_ETHERNET {
            return Err(Error::malformed("arp", "not Ethernet hardware"));
        }
        if u16::from_be_bytes([buffer[2], buffer[3]]) != PROTOCOL_IPV4 {
            return Err(Error::malformed("arp", "not IPv4 protocol"));
        }
        if buffer[4] != 6 || buffer[5] != 4 {
            return Err(Error::malformed("arp", "bad address lengths"));
        }

        let operation = ArpOp::from_u16(u16::from_be_bytes([buffer[6], buffer[7]]))
            .ok_or_else(|| Error::malformed("arp", "unknown operation"))?;

        Ok(Self {
            operation,
            sender_mac: MacAddr(buffer[8..14].try_into().unwrap()),
            sender_ip: Ipv4Addr::new(buffer[14], buffer[15], buffer[16], buffer[17]),
            target_mac: MacAddr(buffer[18..24].try_into().unwrap()),
            target_ip: Ipv4Addr::new(buffer[24], buffer[25], buffer[26], buffer[27]),
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];

        buf[0..2].copy_from_slice(&HARDWARE_ETHERNET.to_be_bytes());
        buf[2..4].copy_from_slice(&PROTOCOL_IPV4.to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());

        buf
    }

    /// Build a broadcast who-has request
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Build a reply answering `request` from `sender_mac`/`sender_ip`
    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Gratuitous announcement: sender and target IP identical.
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = ArpPacket::request(
            MacAddr([0x0e, 0x20, 0xab, 0x92, 0xe8, 0xb1]),
            Ipv4Addr::new(10, 0, 1, 11),
            Ipv4Addr::new(10, 0, 1, 1),
        );

        let bytes = request.to_bytes();
        let parsed = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.operation, ArpOp::Request);
        assert_eq!(parsed.target_mac, MacAddr::ZERO);
    }

    #[test]
    fn test_parse_rejects_bad_hardware() {
        let mut bytes = ArpPacket::request(
            MacAddr::ZERO,
            Ipv4Addr::new(10, 0, 1, 11),
            Ipv4Addr::new(10, 0, 1, 1),
        )
        .to_bytes();
        bytes[1] = 6; // token ring
        assert!(ArpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_too_short() {
        assert!(ArpPacket::parse(&[0u8; 27]).is_err());
    }

    #[test]
    fn test_gratuitous() {
        let garp = ArpPacket::request(
            MacAddr([1, 2, 3, 4, 5, 6]),
            Ipv4Addr::new(10, 0, 1, 5),
            Ipv4Addr::new(10, 0, 1, 5),
        );
        assert!(garp.is_gratuitous());
    }
}
