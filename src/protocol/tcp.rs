//! TCP header handling - RFC 793
//!
//! The router never terminates TCP; it inspects the control bits relevant
//! to the NAT state machine (SYN, FIN) and rewrites ports, recomputing the
//! checksum over the pseudo-header.

use super::checksum::pseudo_header_checksum;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum TCP header size (no options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP protocol number for the pseudo-header
pub const PROTOCOL_NUMBER: u8 = 6;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;

/// Owned, mutable TCP segment for NAT rewriting
#[derive(Debug, Clone)]
pub struct TcpSegment {
    buffer: Vec<u8>,
}

impl TcpSegment {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::malformed("tcp", "segment too short"));
        }

        let header_len = ((data[12] >> 4) as usize) * 4;
        if header_len < MIN_HEADER_SIZE || data.len() < header_len {
            return Err(Error::malformed("tcp", "data offset invalid"));
        }

        Ok(Self {
            buffer: data.to_vec(),
        })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.buffer[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn is_syn(&self) -> bool {
        self.buffer[13] & FLAG_SYN != 0
    }

    pub fn is_fin(&self) -> bool {
        self.buffer[13] & FLAG_FIN != 0
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[16], self.buffer[17]])
    }

    /// Zero and recompute the checksum over the pseudo-header for the
    /// given address pair.
    pub fn update_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.buffer[16] = 0;
        self.buffer[17] = 0;
        let sum = pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, &self.buffer);
        self.buffer[16..18].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Verify a received segment's checksum against the addresses it was
/// carried between.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    segment.len() >= MIN_HEADER_SIZE
        && pseudo_header_checksum(src, dst, PROTOCOL_NUMBER, segment) == 0
}

/// Source port of a (possibly truncated) TCP header. Used when parsing
/// the 8 transport bytes embedded in an ICMP error.
pub fn embedded_src_port(data: &[u8]) -> Option<u16> {
    data.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Destination port of a (possibly truncated) TCP header.
pub fn embedded_dst_port(data: &[u8]) -> Option<u16> {
    data.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syn_segment(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut seg = Vec::with_capacity(MIN_HEADER_SIZE);
        seg.extend_from_slice(&src_port.to_be_bytes());
        seg.extend_from_slice(&dst_port.to_be_bytes());
        seg.extend_from_slice(&1u32.to_be_bytes()); // seq
        seg.extend_from_slice(&0u32.to_be_bytes()); // ack
        seg.push(0x50); // data offset 5
        seg.push(FLAG_SYN);
        seg.extend_from_slice(&0x7210u16.to_be_bytes()); // window
        seg.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
        seg
    }

    #[test]
    fn test_parse_and_flags() {
        let mut bytes = syn_segment(12345, 80);
        let seg = TcpSegment::from_bytes(&bytes).unwrap();
        assert_eq!(seg.src_port(), 12345);
        assert_eq!(seg.dst_port(), 80);
        assert!(seg.is_syn());
        assert!(!seg.is_fin());

        bytes[13] = FLAG_FIN | 0x10;
        let seg = TcpSegment::from_bytes(&bytes).unwrap();
        assert!(seg.is_fin());
        assert!(!seg.is_syn());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(TcpSegment::from_bytes(&[0u8; 19]).is_err());

        let mut bytes = syn_segment(1, 2);
        bytes[12] = 0x40; // data offset 4 words
        assert!(TcpSegment::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rewrite_port_and_checksum() {
        let src = Ipv4Addr::new(10, 0, 1, 50);
        let dst = Ipv4Addr::new(203, 0, 113, 7);
        let external = Ipv4Addr::new(107, 23, 115, 113);

        let mut seg = TcpSegment::from_bytes(&syn_segment(12345, 80)).unwrap();
        seg.update_checksum(src, dst);
        assert!(verify_checksum(src, dst, seg.as_bytes()));

        seg.set_src_port(50010);
        seg.update_checksum(external, dst);
        assert_eq!(seg.src_port(), 50010);
        assert!(verify_checksum(external, dst, seg.as_bytes()));
        assert!(!verify_checksum(src, dst, seg.as_bytes()));
    }

    #[test]
    fn test_embedded_ports() {
        let seg = syn_segment(50010, 80);
        assert_eq!(embedded_src_port(&seg[..8]), Some(50010));
        assert_eq!(embedded_dst_port(&seg[..8]), Some(80));
        assert_eq!(embedded_dst_port(&seg[..3]), None);
    }
}
