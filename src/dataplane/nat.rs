//! NAT packet pipeline
//!
//! Direction classification and bidirectional rewriting. Interface
//! `eth1` (configurable) faces the internal network; every other
//! interface is external. Internal hosts share the egress interface's
//! address: outbound traffic gets its source rewritten to the external
//! address and its port/identifier to the mapping's external value,
//! inbound traffic the reverse. ICMP errors are rewritten on both the
//! outer header and the embedded datagram so the endpoint that sent the
//! original segment still recognizes the error as its own flow.
//!
//! State updates happen under the NAT lock; translation then works on a
//! snapshot of the mapping, and egress goes through the forwarder.

use crate::dataplane::nat_table::{NatKind, NatMapping, TcpConnState, TcpConnection};
use crate::dataplane::router::{FrameBatch, Router};
use crate::dataplane::Interface;
use crate::protocol::checksum::internet_checksum;
use crate::protocol::icmp::{self, IcmpErrorKind, IcmpMessage};
use crate::protocol::ipv4::{Ipv4Header, Ipv4Packet, Protocol};
use crate::protocol::tcp::{self, TcpSegment};
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Outcome of the inbound TCP admission decision.
enum InboundVerdict {
    /// Translate and forward using this mapping snapshot.
    Translate(NatMapping),
    /// Answer with ICMP port-unreachable.
    Reject,
    /// Swallow the packet without a response (queued or retried SYN).
    Silent,
    /// Drop without a response.
    Drop,
}

impl Router {
    /// Entry point for every validated IPv4 datagram while NAT is on.
    pub(crate) fn nat_handle_datagram(&self, datagram: &[u8], iface: &Interface) -> FrameBatch {
        let header = match Ipv4Header::parse(datagram) {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };

        match header.protocol() {
            p if p == Protocol::Tcp as u8 => self.nat_handle_tcp(datagram, &header, iface),
            p if p == Protocol::Icmp as u8 => self.nat_handle_icmp(datagram, &header, iface),
            other => {
                debug!("NAT: unsupported IP protocol {}, dropping", other);
                self.metrics.packets_dropped.inc();
                Vec::new()
            }
        }
    }

    fn nat_internal_interface(&self) -> &str {
        &self.nat.as_ref().unwrap().internal_interface
    }

    fn nat_internal_ip(&self) -> Option<Ipv4Addr> {
        self.interfaces
            .by_name(self.nat_internal_interface())
            .map(|i| i.ip)
    }

    /// External-to-external transit: forwarded untouched, unless it is
    /// aimed into the internal network.
    fn nat_forward_deflected(&self, datagram: &[u8], header: &Ipv4Header, iface: &Interface) -> FrameBatch {
        if let Some(route) = self.routes.lookup(header.dst_addr()) {
            if route.interface == self.nat_internal_interface() {
                debug!(
                    "NAT: unsolicited packet for internal host {}, dropping",
                    header.dst_addr()
                );
                self.metrics.nat_rejects.inc();
                return Vec::new();
            }
        }
        self.forward_datagram(datagram.to_vec(), &iface.name)
    }

    fn nat_handle_tcp(&self, datagram: &[u8], header: &Ipv4Header, iface: &Interface) -> FrameBatch {
        let ip_payload = header.payload();
        if !tcp::verify_checksum(header.src_addr(), header.dst_addr(), ip_payload) {
            debug!("NAT: TCP segment with bad checksum, dropping");
            return Vec::new();
        }
        let segment = match TcpSegment::from_bytes(ip_payload) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let internal = iface.name == self.nat_internal_interface();
        let for_us = self.interfaces.owns_ip(header.dst_addr());
        let now = Instant::now();

        if internal {
            if for_us {
                return self.handle_local(datagram);
            }
            match self.nat_admit_outbound_tcp(header, &segment, now) {
                Some(mapping) => self.nat_translate_outbound(datagram, &mapping, iface),
                None => {
                    debug!("NAT: outbound TCP without mapping, dropping");
                    self.metrics.packets_dropped.inc();
                    Vec::new()
                }
            }
        } else {
            if !for_us {
                return self.nat_forward_deflected(datagram, header, iface);
            }
            if Some(header.dst_addr()) == self.nat_internal_ip() {
                debug!("NAT: external packet for internal interface address, dropping");
                self.metrics.nat_rejects.inc();
                return Vec::new();
            }

            match self.nat_admit_inbound_tcp(datagram, header, &segment, now) {
                InboundVerdict::Translate(mapping) => {
                    self.nat_translate_inbound(datagram, &mapping, iface)
                }
                InboundVerdict::Reject => {
                    debug!(
                        "NAT: unsolicited inbound TCP to port {}, answering port-unreachable",
                        segment.dst_port()
                    );
                    self.metrics.nat_rejects.inc();
                    self.send_icmp_error(IcmpErrorKind::PortUnreachable, datagram)
                }
                InboundVerdict::Silent => Vec::new(),
                InboundVerdict::Drop => {
                    debug!("NAT: inbound TCP with no matching connection, dropping");
                    self.metrics.packets_dropped.inc();
                    Vec::new()
                }
            }
        }
    }

    /// Outbound TCP admission and state update, under the NAT lock.
    /// Returns the mapping snapshot to translate with, or None to drop.
    fn nat_admit_outbound_tcp(
        &self,
        header: &Ipv4Header,
        segment: &TcpSegment,
        now: Instant,
    ) -> Option<NatMapping> {
        let nat = self.nat.as_ref().unwrap();
        let mut table = nat.table.lock().unwrap();

        let src = header.src_addr();
        let sport = segment.src_port();
        let peer_ip = header.dst_addr();
        let peer_port = segment.dst_port();

        let exists = table.get_internal_mut(src, sport, NatKind::Tcp).is_some();

        if !exists {
            if !segment.is_syn() {
                // Mid-stream segment on a connection the NAT never saw.
                return None;
            }

            // A parked unsolicited SYN from this peer means we are the
            // second half of a simultaneous open: adopt its external
            // port and come up connected, discarding the parked copy.
            let (aux_ext, state) = match table.take_candidate(peer_ip, peer_port) {
                Some(candidate) => (Some(candidate.aux_ext), TcpConnState::Connected),
                None => (None, TcpConnState::OutboundSyn),
            };
            match aux_ext {
                Some(aux_ext) => {
                    table.insert_mapping_with_aux(src, sport, NatKind::Tcp, aux_ext, now)
                }
                None => table.insert_mapping(src, sport, NatKind::Tcp, now),
            };
            self.metrics.nat_mappings_created.inc();

            let mapping = table.get_internal_mut(src, sport, NatKind::Tcp).unwrap();
            mapping.conns.push(TcpConnection {
                state,
                last_accessed: now,
                queued_inbound_syn: None,
                peer_ip,
                peer_port,
            });
            return Some(mapping.clone());
        }

        let mapping = table.get_internal_mut(src, sport, NatKind::Tcp).unwrap();
        mapping.last_updated = now;

        if segment.is_syn() {
            match mapping.find_conn_mut(peer_ip, peer_port) {
                None => {
                    mapping.conns.push(TcpConnection {
                        state: TcpConnState::OutboundSyn,
                        last_accessed: now,
                        queued_inbound_syn: None,
                        peer_ip,
                        peer_port,
                    });
                    debug!(
                        "NAT: new connection {}:{} -> {}:{}",
                        src, sport, peer_ip, peer_port
                    );
                }
                Some(conn) => {
                    conn.last_accessed = now;
                    match conn.state {
                        TcpConnState::TimeWait => {
                            // Client reopening a closed connection
                            conn.state = TcpConnState::OutboundSyn;
                        }
                        TcpConnState::InboundSynPending => {
                            // Simultaneous open completes; the parked
                            // unsolicited SYN is discarded.
                            conn.state = TcpConnState::Connected;
                            conn.queued_inbound_syn = None;
                            debug!(
                                "NAT: simultaneous open with {}:{} established",
                                peer_ip, peer_port
                            );
                        }
                        // OutboundSyn or Connected: a retransmission
                        _ => {}
                    }
                }
            }
        } else if let Some(conn) = mapping.find_conn_mut(peer_ip, peer_port) {
            conn.last_accessed = now;
            // Only an established connection closes on FIN; a FIN seen
            // in any other state has no listed transition
            if conn.state == TcpConnState::Connected && segment.is_fin() {
                conn.state = TcpConnState::TimeWait;
            }
        }

        Some(mapping.clone())
    }

    /// Inbound TCP admission and state update, under the NAT lock.
    fn nat_admit_inbound_tcp(
        &self,
        datagram: &[u8],
        header: &Ipv4Header,
        segment: &TcpSegment,
        now: Instant,
    ) -> InboundVerdict {
        let nat = self.nat.as_ref().unwrap();
        let mut table = nat.table.lock().unwrap();

        let peer_ip = header.src_addr();
        let peer_port = segment.src_port();
        let ext_port = segment.dst_port();

        if table.get_external_mut(ext_port, NatKind::Tcp).is_none() {
            if segment.is_syn() {
                // Possible first half of a simultaneous open: park the
                // SYN and wait for the internal host's own SYN.
                if table.park_inbound_syn(ext_port, peer_ip, peer_port, datagram, now) {
                    debug!(
                        "NAT: inbound SYN from {}:{} to port {} parked for simultaneous open",
                        peer_ip, peer_port, ext_port
                    );
                }
                return InboundVerdict::Silent;
            }
            return InboundVerdict::Reject;
        }

        let mapping = match table.get_external_mut(ext_port, NatKind::Tcp) {
            Some(m) => m,
            None => return InboundVerdict::Reject,
        };
        mapping.last_updated = now;

        if segment.is_syn() {
            match mapping.find_conn_mut(peer_ip, peer_port) {
                None => {
                    // Simultaneous-open candidate: park a copy of the
                    // SYN and wait for the internal host's own SYN.
                    mapping.conns.push(TcpConnection {
                        state: TcpConnState::InboundSynPending,
                        last_accessed: now,
                        queued_inbound_syn: Some(datagram.to_vec()),
                        peer_ip,
                        peer_port,
                    });
                    debug!(
                        "NAT: inbound SYN from {}:{} parked for simultaneous open",
                        peer_ip, peer_port
                    );
                    InboundVerdict::Silent
                }
                Some(conn) => match conn.state {
                    TcpConnState::InboundSynPending => InboundVerdict::Silent,
                    TcpConnState::OutboundSyn => {
                        conn.state = TcpConnState::Connected;
                        conn.last_accessed = now;
                        InboundVerdict::Translate(mapping.clone())
                    }
                    _ => {
                        conn.last_accessed = now;
                        InboundVerdict::Translate(mapping.clone())
                    }
                },
            }
        } else {
            match mapping.find_conn_mut(peer_ip, peer_port) {
                None => InboundVerdict::Drop,
                Some(conn) => {
                    conn.last_accessed = now;
                    match conn.state {
                        // Only an established connection closes on FIN
                        TcpConnState::Connected if segment.is_fin() => {
                            conn.state = TcpConnState::TimeWait;
                        }
                        // Any matching non-SYN answer completes the
                        // handshake, FIN included
                        TcpConnState::OutboundSyn => {
                            conn.state = TcpConnState::Connected;
                        }
                        _ => {}
                    }
                    InboundVerdict::Translate(mapping.clone())
                }
            }
        }
    }

    fn nat_handle_icmp(&self, datagram: &[u8], header: &Ipv4Header, iface: &Interface) -> FrameBatch {
        let ip_payload = header.payload();
        if !icmp::verify_checksum(ip_payload) {
            debug!("NAT: ICMP with bad checksum, dropping");
            return Vec::new();
        }
        let message = match IcmpMessage::from_bytes(ip_payload) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };

        let internal = iface.name == self.nat_internal_interface();
        let for_us = self.interfaces.owns_ip(header.dst_addr());
        let now = Instant::now();

        if internal {
            if for_us {
                return self.handle_local(datagram);
            }

            if message.is_echo() {
                let nat = self.nat.as_ref().unwrap();
                let mapping = {
                    let mut table = nat.table.lock().unwrap();
                    match table.lookup_internal(
                        header.src_addr(),
                        message.identifier(),
                        NatKind::Icmp,
                        now,
                    ) {
                        Some(m) => m,
                        None => {
                            self.metrics.nat_mappings_created.inc();
                            table.insert_mapping(
                                header.src_addr(),
                                message.identifier(),
                                NatKind::Icmp,
                                now,
                            )
                        }
                    }
                };
                return self.nat_translate_outbound(datagram, &mapping, iface);
            }

            if message.is_error() {
                let mapping = message
                    .embedded_datagram()
                    .and_then(|data| self.nat_lookup_embedded_outbound(data, now));
                return match mapping {
                    Some(m) => self.nat_translate_outbound(datagram, &m, iface),
                    None => {
                        debug!("NAT: outbound ICMP error references no known flow, dropping");
                        self.metrics.packets_dropped.inc();
                        Vec::new()
                    }
                };
            }

            debug!(
                "NAT: unsupported outbound ICMP type {}, dropping",
                message.icmp_type()
            );
            Vec::new()
        } else {
            if !for_us {
                return self.nat_forward_deflected(datagram, header, iface);
            }
            if Some(header.dst_addr()) == self.nat_internal_ip() {
                debug!("NAT: external ping of internal interface address, dropping");
                self.metrics.nat_rejects.inc();
                return Vec::new();
            }

            if message.is_echo() {
                let nat = self.nat.as_ref().unwrap();
                let mapping = {
                    let mut table = nat.table.lock().unwrap();
                    table.lookup_external(message.identifier(), NatKind::Icmp, now)
                };
                return match mapping {
                    Some(m) => self.nat_translate_inbound(datagram, &m, iface),
                    // No mapping: the ping is addressed to the router
                    None => self.handle_local(datagram),
                };
            }

            if message.is_error() {
                let mapping = message
                    .embedded_datagram()
                    .and_then(|data| self.nat_lookup_embedded_inbound(data, now));
                return match mapping {
                    Some(m) => self.nat_translate_inbound(datagram, &m, iface),
                    None => {
                        debug!("NAT: inbound ICMP error references no known flow, dropping");
                        self.metrics.packets_dropped.inc();
                        Vec::new()
                    }
                };
            }

            debug!(
                "NAT: unsupported inbound ICMP type {}, dropping",
                message.icmp_type()
            );
            Vec::new()
        }
    }

    /// Locate the mapping an outbound ICMP error refers to. The
    /// embedded datagram is the inbound-translated leg of the flow
    /// (external peer -> internal host), so the internal side is its
    /// destination.
    fn nat_lookup_embedded_outbound(&self, data: &[u8], now: Instant) -> Option<NatMapping> {
        let embedded = EmbeddedDatagram::parse(data)?;
        let nat = self.nat.as_ref().unwrap();
        let mut table = nat.table.lock().unwrap();

        match embedded.protocol {
            p if p == Protocol::Tcp as u8 => {
                let port = tcp::embedded_dst_port(embedded.transport)?;
                table.lookup_internal(embedded.dst, port, NatKind::Tcp, now)
            }
            p if p == Protocol::Icmp as u8 => {
                let ident = embedded.icmp_echo_identifier()?;
                table.lookup_internal(embedded.dst, ident, NatKind::Icmp, now)
            }
            _ => None,
        }
    }

    /// Locate the mapping an inbound ICMP error refers to. The embedded
    /// datagram is the outbound-translated leg (egress IP -> external
    /// peer), so the external side is its source.
    fn nat_lookup_embedded_inbound(&self, data: &[u8], now: Instant) -> Option<NatMapping> {
        let embedded = EmbeddedDatagram::parse(data)?;
        let nat = self.nat.as_ref().unwrap();
        let mut table = nat.table.lock().unwrap();

        match embedded.protocol {
            p if p == Protocol::Tcp as u8 => {
                let port = tcp::embedded_src_port(embedded.transport)?;
                table.lookup_external(port, NatKind::Tcp, now)
            }
            p if p == Protocol::Icmp as u8 => {
                let ident = embedded.icmp_echo_identifier()?;
                table.lookup_external(ident, NatKind::Icmp, now)
            }
            _ => None,
        }
    }

    /// Rewrite an internal-to-external datagram to the mapping's
    /// external form and forward it.
    fn nat_translate_outbound(
        &self,
        datagram: &[u8],
        mapping: &NatMapping,
        iface: &Interface,
    ) -> FrameBatch {
        let mut packet = match Ipv4Packet::from_bytes(datagram) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        // The shared external address is the egress interface's
        let external_ip = {
            let route = match self.routes.lookup(packet.dst_addr()) {
                Some(r) => r,
                None => {
                    debug!("NAT: no route for outbound {}", packet.dst_addr());
                    self.metrics.packets_dropped.inc();
                    return Vec::new();
                }
            };
            match self.interfaces.by_name(&route.interface) {
                Some(i) => i.ip,
                None => {
                    warn!("route references unknown interface {}", route.interface);
                    return Vec::new();
                }
            }
        };

        match packet.protocol() {
            p if p == Protocol::Icmp as u8 => {
                let mut message = match IcmpMessage::from_bytes(packet.payload()) {
                    Ok(m) => m,
                    Err(_) => return Vec::new(),
                };

                if message.is_echo() {
                    message.set_identifier(mapping.aux_ext);
                } else if let Some(data) = message.embedded_datagram_mut() {
                    // Restore the embedded datagram to the form the
                    // external peer originally addressed
                    rewrite_embedded(data, EmbeddedRewrite::Destination {
                        ip: external_ip,
                        aux: mapping.aux_ext,
                    });
                }
                message.update_checksum();

                let bytes = message.as_bytes();
                packet.payload_mut()[..bytes.len()].copy_from_slice(bytes);
            }
            p if p == Protocol::Tcp as u8 => {
                let mut segment = match TcpSegment::from_bytes(packet.payload()) {
                    Ok(s) => s,
                    Err(_) => return Vec::new(),
                };
                segment.set_src_port(mapping.aux_ext);
                segment.update_checksum(external_ip, packet.dst_addr());

                let bytes = segment.as_bytes();
                packet.payload_mut()[..bytes.len()].copy_from_slice(bytes);
            }
            _ => return Vec::new(),
        }

        packet.set_src_addr(external_ip);
        packet.refresh_checksum();

        self.metrics.nat_translations.inc();
        trace!(
            "NAT: outbound {}:{} rewritten to {}:{}",
            mapping.ip_int,
            mapping.aux_int,
            external_ip,
            mapping.aux_ext
        );
        self.forward_datagram(packet.into_bytes(), &iface.name)
    }

    /// Rewrite an external-to-internal datagram back to the internal
    /// host's addressing and forward it.
    fn nat_translate_inbound(
        &self,
        datagram: &[u8],
        mapping: &NatMapping,
        iface: &Interface,
    ) -> FrameBatch {
        let mut packet = match Ipv4Packet::from_bytes(datagram) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        match packet.protocol() {
            p if p == Protocol::Icmp as u8 => {
                let mut message = match IcmpMessage::from_bytes(packet.payload()) {
                    Ok(m) => m,
                    Err(_) => return Vec::new(),
                };

                if message.is_echo() {
                    message.set_identifier(mapping.aux_int);
                } else if let Some(data) = message.embedded_datagram_mut() {
                    // Restore the internal host's own addressing inside
                    // the error so its stack can match the flow
                    rewrite_embedded(data, EmbeddedRewrite::Source {
                        ip: mapping.ip_int,
                        aux: mapping.aux_int,
                    });
                }
                message.update_checksum();

                let bytes = message.as_bytes();
                packet.payload_mut()[..bytes.len()].copy_from_slice(bytes);
            }
            p if p == Protocol::Tcp as u8 => {
                let src = packet.src_addr();
                let mut segment = match TcpSegment::from_bytes(packet.payload()) {
                    Ok(s) => s,
                    Err(_) => return Vec::new(),
                };
                segment.set_dst_port(mapping.aux_int);
                segment.update_checksum(src, mapping.ip_int);

                let bytes = segment.as_bytes();
                packet.payload_mut()[..bytes.len()].copy_from_slice(bytes);
            }
            _ => return Vec::new(),
        }

        packet.set_dst_addr(mapping.ip_int);
        packet.refresh_checksum();

        self.metrics.nat_translations.inc();
        trace!(
            "NAT: inbound rewritten to {}:{}",
            mapping.ip_int,
            mapping.aux_int
        );
        self.forward_datagram(packet.into_bytes(), &iface.name)
    }
}

/// Which endpoint of the embedded datagram to rewrite.
enum EmbeddedRewrite {
    /// Outbound error: embedded destination becomes the external form.
    Destination { ip: Ipv4Addr, aux: u16 },
    /// Inbound error: embedded source becomes the internal form.
    Source { ip: Ipv4Addr, aux: u16 },
}

/// Read-only view of the (possibly truncated) datagram inside an ICMP
/// error: the original IP header plus up to 8 transport bytes.
struct EmbeddedDatagram<'a> {
    protocol: u8,
    dst: Ipv4Addr,
    transport: &'a [u8],
}

impl<'a> EmbeddedDatagram<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 20 || data[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < 20 || data.len() < header_len {
            return None;
        }
        Some(Self {
            protocol: data[9],
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            transport: &data[header_len..],
        })
    }

    /// Echo identifier of an embedded ICMP query, if present.
    fn icmp_echo_identifier(&self) -> Option<u16> {
        let t = *self.transport.first()?;
        if t != 0 && t != 8 {
            return None;
        }
        self.transport
            .get(4..6)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Rewrite one endpoint of the embedded datagram in place and refresh
/// its IP header checksum. The embedded transport checksum cannot be
/// recomputed from 8 bytes and is left as carried.
fn rewrite_embedded(data: &mut [u8], rewrite: EmbeddedRewrite) {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return;
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < 20 || data.len() < header_len {
        return;
    }
    let protocol = data[9];

    let (ip, aux, ip_range, aux_offset) = match rewrite {
        EmbeddedRewrite::Destination { ip, aux } => {
            let aux_offset = match protocol {
                p if p == Protocol::Tcp as u8 => header_len + 2, // dst port
                p if p == Protocol::Icmp as u8 => header_len + 4, // identifier
                _ => return,
            };
            (ip, aux, 16..20, aux_offset)
        }
        EmbeddedRewrite::Source { ip, aux } => {
            let aux_offset = match protocol {
                p if p == Protocol::Tcp as u8 => header_len, // src port
                p if p == Protocol::Icmp as u8 => header_len + 4, // identifier
                _ => return,
            };
            (ip, aux, 12..16, aux_offset)
        }
    };

    data[ip_range].copy_from_slice(&ip.octets());
    if data.len() >= aux_offset + 2 {
        data[aux_offset..aux_offset + 2].copy_from_slice(&aux.to_be_bytes());
    }

    // Refresh the embedded IP header checksum
    data[10] = 0;
    data[11] = 0;
    let sum = internet_checksum(&data[..header_len]);
    data[10..12].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::nat_table::NatTimeouts;
    use crate::dataplane::{InterfaceTable, Route, RoutingTable};
    use crate::protocol::checksum::pseudo_header_checksum;
    use crate::protocol::ethernet::{Frame, FrameBuilder};
    use crate::protocol::ipv4::Ipv4Builder;
    use crate::protocol::{EtherType, MacAddr};
    use crate::telemetry::MetricsRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    const LAN_MAC: MacAddr = MacAddr([0x76, 0xfb, 0x5e, 0xa7, 0x04, 0x87]);
    const WAN_MAC: MacAddr = MacAddr([0xfa, 0xa4, 0x0c, 0x89, 0xd7, 0xdc]);
    const HOST_MAC: MacAddr = MacAddr([0x0e, 0x20, 0xab, 0x80, 0x00, 0x02]);
    const GW_MAC: MacAddr = MacAddr([0x02, 0x42, 0xac, 0x14, 0x00, 0x01]);

    const FLAG_FIN: u8 = 0x01;
    const FLAG_SYN: u8 = 0x02;
    const FLAG_ACK: u8 = 0x10;

    fn lan_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 1, 1)
    }

    fn wan_ip() -> Ipv4Addr {
        Ipv4Addr::new(172, 64, 3, 1)
    }

    fn gateway() -> Router {
        let interfaces = InterfaceTable::new(vec![
            Interface {
                name: "eth1".into(),
                mac: LAN_MAC,
                ip: lan_ip(),
            },
            Interface {
                name: "eth2".into(),
                mac: WAN_MAC,
                ip: wan_ip(),
            },
        ]);

        let mut routes = RoutingTable::new();
        routes.add(Route {
            destination: Ipv4Addr::new(10, 0, 1, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::UNSPECIFIED,
            interface: "eth1".into(),
        });
        routes.add(Route {
            destination: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::new(172, 64, 3, 254),
            interface: "eth2".into(),
        });

        let mut router = Router::new(interfaces, routes, Arc::new(MetricsRegistry::new()));
        router.enable_nat("eth1".into(), NatTimeouts::default());

        // Warm the neighbor caches so frames emit instead of queueing
        let gw_reply = crate::protocol::arp::ArpPacket::reply(
            GW_MAC,
            Ipv4Addr::new(172, 64, 3, 254),
            WAN_MAC,
            wan_ip(),
        );
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Arp, &gw_reply.to_bytes()),
            "eth2",
        );
        let host_reply = crate::protocol::arp::ArpPacket::reply(
            HOST_MAC,
            Ipv4Addr::new(10, 0, 1, 50),
            LAN_MAC,
            lan_ip(),
        );
        router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Arp, &host_reply.to_bytes()),
            "eth1",
        );

        router
    }

    fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
        FrameBuilder::new()
            .dst_mac(dst)
            .src_mac(src)
            .ethertype(ethertype as u16)
            .payload(payload)
            .build()
    }

    fn tcp_datagram(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut segment = vec![0u8; 20];
        segment[0..2].copy_from_slice(&sport.to_be_bytes());
        segment[2..4].copy_from_slice(&dport.to_be_bytes());
        segment[12] = 0x50;
        segment[13] = flags;
        let sum = pseudo_header_checksum(src, dst, 6, &segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());

        Ipv4Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .ttl(64)
            .protocol(Protocol::Tcp as u8)
            .payload(&segment)
            .build()
    }

    fn parse_tcp(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr, u16, u16) {
        let parsed = Frame::parse(frame).unwrap();
        let header = Ipv4Header::parse(parsed.payload()).unwrap();
        let transport = header.payload();
        (
            header.src_addr(),
            header.dst_addr(),
            u16::from_be_bytes([transport[0], transport[1]]),
            u16::from_be_bytes([transport[2], transport[3]]),
        )
    }

    fn conn_state(
        router: &Router,
        ip_int: Ipv4Addr,
        aux_int: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
    ) -> TcpConnState {
        let nat = router.nat.as_ref().unwrap();
        let mut table = nat.table.lock().unwrap();
        table
            .get_internal_mut(ip_int, aux_int, NatKind::Tcp)
            .unwrap()
            .find_conn_mut(peer_ip, peer_port)
            .unwrap()
            .state
    }

    #[test]
    fn test_outbound_non_syn_without_mapping_dropped() {
        let router = gateway();
        let stray = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_ACK,
        );
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &stray),
            "eth1",
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_bad_tcp_checksum_dropped() {
        let router = gateway();
        let mut syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_SYN,
        );
        let len = syn.len();
        syn[len - 4] ^= 0xFF; // clobber the segment, not the IP header
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_retransmitted_syn_reuses_mapping() {
        let router = gateway();
        let syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_SYN,
        );

        let first = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let second = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );

        let (_, _, first_port, _) = parse_tcp(&first[0].1);
        let (_, _, second_port, _) = parse_tcp(&second[0].1);
        assert_eq!(first_port, second_port);
        assert_eq!(router.metrics.nat_mappings_created.get(), 1);
    }

    #[test]
    fn test_inbound_syn_on_mapped_port_completes_simultaneous_open() {
        let router = gateway();

        // Mapping established toward one peer
        let syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_SYN,
        );
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let (_, _, ext_port, _) = parse_tcp(&out[0].1);

        // A different peer SYNs the mapped port: held on the mapping,
        // nothing forwarded
        let stranger_syn = tcp_datagram(
            Ipv4Addr::new(203, 0, 113, 7),
            wan_ip(),
            80,
            ext_port,
            FLAG_SYN,
        );
        let out = router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &stranger_syn),
            "eth2",
        );
        assert!(out.is_empty());

        // A retry of the held SYN stays silent
        let out = router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &stranger_syn),
            "eth2",
        );
        assert!(out.is_empty());

        // The internal host opens toward that peer: connection comes up
        // and the outbound SYN is translated and forwarded
        let own_syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(203, 0, 113, 7),
            12345,
            80,
            FLAG_SYN,
        );
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &own_syn),
            "eth1",
        );
        assert_eq!(out.len(), 1);
        let (src, dst, sport, dport) = parse_tcp(&out[0].1);
        assert_eq!(src, wan_ip());
        assert_eq!(dst, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(sport, ext_port);
        assert_eq!(dport, 80);
    }

    #[test]
    fn test_pending_syn_timeout_answers_port_unreachable() {
        let router = gateway();

        let syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_SYN,
        );
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let (_, _, ext_port, _) = parse_tcp(&out[0].1);

        let stranger_syn = tcp_datagram(
            Ipv4Addr::new(203, 0, 113, 7),
            wan_ip(),
            80,
            ext_port,
            FLAG_SYN,
        );
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &stranger_syn),
            "eth2",
        );

        // Window closes without the matching outbound SYN
        let start = Instant::now();
        let out = router.nat_tick_at(start + Duration::from_secs(7));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "eth2");
        let frame = Frame::parse(&out[0].1).unwrap();
        let header = Ipv4Header::parse(frame.payload()).unwrap();
        assert_eq!(header.dst_addr(), Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(header.src_addr(), wan_ip());
        assert_eq!(header.payload()[0], 3);
        assert_eq!(header.payload()[1], 3);
    }

    #[test]
    fn test_fin_outside_established_leaves_state_alone() {
        let router = gateway();
        let host = Ipv4Addr::new(10, 0, 1, 50);
        let peer = Ipv4Addr::new(198, 51, 100, 9);

        // Open half-way: the connection sits in OutboundSyn
        let syn = tcp_datagram(host, peer, 12345, 443, FLAG_SYN);
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let (_, _, ext_port, _) = parse_tcp(&out[0].1);
        assert_eq!(
            conn_state(&router, host, 12345, peer, 443),
            TcpConnState::OutboundSyn
        );

        // An outbound FIN before establishment must not reach TimeWait
        let early_fin = tcp_datagram(host, peer, 12345, 443, FLAG_FIN | FLAG_ACK);
        router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &early_fin),
            "eth1",
        );
        assert_eq!(
            conn_state(&router, host, 12345, peer, 443),
            TcpConnState::OutboundSyn
        );

        // An inbound FIN while still OutboundSyn is a matching non-SYN
        // answer: the connection establishes instead of closing
        let inbound_fin = tcp_datagram(peer, wan_ip(), 443, ext_port, FLAG_FIN | FLAG_ACK);
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &inbound_fin),
            "eth2",
        );
        assert_eq!(
            conn_state(&router, host, 12345, peer, 443),
            TcpConnState::Connected
        );

        // Now established: a further FIN closes it
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &inbound_fin),
            "eth2",
        );
        assert_eq!(
            conn_state(&router, host, 12345, peer, 443),
            TcpConnState::TimeWait
        );
    }

    #[test]
    fn test_fin_while_inbound_syn_pending_keeps_pending() {
        let router = gateway();
        let host = Ipv4Addr::new(10, 0, 1, 50);
        let stranger = Ipv4Addr::new(203, 0, 113, 7);

        // Mapping via outbound SYN, then a stranger parks a SYN on it
        let syn = tcp_datagram(host, Ipv4Addr::new(198, 51, 100, 9), 12345, 443, FLAG_SYN);
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let (_, _, ext_port, _) = parse_tcp(&out[0].1);

        let stranger_syn = tcp_datagram(stranger, wan_ip(), 80, ext_port, FLAG_SYN);
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &stranger_syn),
            "eth2",
        );
        assert_eq!(
            conn_state(&router, host, 12345, stranger, 80),
            TcpConnState::InboundSynPending
        );

        // A FIN from the stranger has no listed transition
        let stranger_fin = tcp_datagram(stranger, wan_ip(), 80, ext_port, FLAG_FIN | FLAG_ACK);
        router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &stranger_fin),
            "eth2",
        );
        assert_eq!(
            conn_state(&router, host, 12345, stranger, 80),
            TcpConnState::InboundSynPending
        );
    }

    #[test]
    fn test_outbound_icmp_error_translation() {
        let router = gateway();

        // Establish the flow and pull the inbound-translated form that
        // the internal host would be reporting about
        let syn = tcp_datagram(
            Ipv4Addr::new(10, 0, 1, 50),
            Ipv4Addr::new(198, 51, 100, 9),
            12345,
            443,
            FLAG_SYN,
        );
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &syn),
            "eth1",
        );
        let (_, _, ext_port, _) = parse_tcp(&out[0].1);

        let inbound = tcp_datagram(
            Ipv4Addr::new(198, 51, 100, 9),
            wan_ip(),
            443,
            ext_port,
            FLAG_SYN | FLAG_ACK,
        );
        let out = router.handle_packet(
            &eth_frame(WAN_MAC, GW_MAC, EtherType::Ipv4, &inbound),
            "eth2",
        );
        let delivered = Frame::parse(&out[0].1).unwrap().payload().to_vec();

        // Internal host reports port-unreachable about the delivered
        // segment
        let mut error = vec![3u8, 3, 0, 0, 0, 0, 0, 0];
        error.extend_from_slice(&delivered[..28]);
        let sum = internet_checksum(&error);
        error[2..4].copy_from_slice(&sum.to_be_bytes());

        let error_datagram = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(10, 0, 1, 50))
            .dst_addr(Ipv4Addr::new(198, 51, 100, 9))
            .ttl(64)
            .protocol(Protocol::Icmp as u8)
            .payload(&error)
            .build();
        let out = router.handle_packet(
            &eth_frame(LAN_MAC, HOST_MAC, EtherType::Ipv4, &error_datagram),
            "eth1",
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "eth2");
        let frame = Frame::parse(&out[0].1).unwrap();
        let header = Ipv4Header::parse(frame.payload()).unwrap();
        // Outer source hidden behind the external address
        assert_eq!(header.src_addr(), wan_ip());
        assert_eq!(header.dst_addr(), Ipv4Addr::new(198, 51, 100, 9));

        let message = header.payload();
        assert!(icmp::verify_checksum(message));
        let embedded = &message[8..];
        // Embedded destination restored to the external form the peer
        // originally sent to
        assert_eq!(&embedded[16..20], &wan_ip().octets());
        assert_eq!(
            &embedded[22..24],
            &ext_port.to_be_bytes(),
            "embedded destination port must be the external port"
        );
        assert_eq!(internet_checksum(&embedded[..20]), 0);
    }

    fn embedded_tcp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
        let mut data = vec![0u8; 28];
        data[0] = 0x45;
        data[2..4].copy_from_slice(&28u16.to_be_bytes());
        data[8] = 64;
        data[9] = Protocol::Tcp as u8;
        data[12..16].copy_from_slice(&src.octets());
        data[16..20].copy_from_slice(&dst.octets());
        data[20..22].copy_from_slice(&sport.to_be_bytes());
        data[22..24].copy_from_slice(&dport.to_be_bytes());
        let sum = internet_checksum(&data[..20]);
        data[10..12].copy_from_slice(&sum.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_embedded_tcp() {
        let data = embedded_tcp(
            Ipv4Addr::new(107, 23, 115, 113),
            Ipv4Addr::new(203, 0, 113, 7),
            50010,
            80,
        );
        let embedded = EmbeddedDatagram::parse(&data).unwrap();
        assert_eq!(embedded.protocol, 6);
        assert_eq!(embedded.dst, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(tcp::embedded_src_port(embedded.transport), Some(50010));
        assert_eq!(tcp::embedded_dst_port(embedded.transport), Some(80));
    }

    #[test]
    fn test_parse_embedded_rejects_truncated() {
        assert!(EmbeddedDatagram::parse(&[0x45; 19]).is_none());
        let mut bad = embedded_tcp(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            1,
            2,
        );
        bad[0] = 0x65;
        assert!(EmbeddedDatagram::parse(&bad).is_none());
    }

    #[test]
    fn test_rewrite_embedded_source() {
        let mut data = embedded_tcp(
            Ipv4Addr::new(107, 23, 115, 113),
            Ipv4Addr::new(203, 0, 113, 7),
            50010,
            80,
        );
        rewrite_embedded(
            &mut data,
            EmbeddedRewrite::Source {
                ip: Ipv4Addr::new(10, 0, 1, 50),
                aux: 12345,
            },
        );

        let embedded = EmbeddedDatagram::parse(&data).unwrap();
        assert_eq!(tcp::embedded_src_port(embedded.transport), Some(12345));
        assert_eq!(&data[12..16], &[10, 0, 1, 50]);
        // Embedded header checksum refreshed
        assert_eq!(internet_checksum(&data[..20]), 0);
    }

    #[test]
    fn test_rewrite_embedded_destination() {
        let mut data = embedded_tcp(
            Ipv4Addr::new(203, 0, 113, 7),
            Ipv4Addr::new(10, 0, 1, 50),
            80,
            12345,
        );
        rewrite_embedded(
            &mut data,
            EmbeddedRewrite::Destination {
                ip: Ipv4Addr::new(107, 23, 115, 113),
                aux: 50010,
            },
        );

        let embedded = EmbeddedDatagram::parse(&data).unwrap();
        assert_eq!(tcp::embedded_dst_port(embedded.transport), Some(50010));
        assert_eq!(&data[16..20], &[107, 23, 115, 113]);
        assert_eq!(internet_checksum(&data[..20]), 0);
    }
}
