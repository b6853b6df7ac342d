//! Packet processing router
//!
//! Owns the interface table, routing table, ARP cache, and (optionally)
//! the NAT table, and drives the pipeline: Ethernet demux, ARP
//! termination, IPv4 validation, local delivery, forwarding, and the two
//! 1-second maintenance sweeps.

use crate::config::Config;
use crate::dataplane::arp_cache::{ArpCache, PendingFrame};
use crate::dataplane::forwarder::{plan_forward, ForwardDecision};
use crate::dataplane::nat_table::{NatTable, NatTimeouts};
use crate::dataplane::{Interface, InterfaceTable, Route, RoutingTable};
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ethernet::{self, Frame, FrameBuilder};
use crate::protocol::icmp::{self, IcmpErrorKind, IcmpType};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Header, Protocol};
use crate::protocol::{EtherType, MacAddr};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Frames to emit, as (egress interface, frame bytes) pairs.
pub type FrameBatch = Vec<(String, Vec<u8>)>;

/// Cadence of the ARP retry and NAT expiry sweeps.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct NatState {
    pub(crate) table: Mutex<NatTable>,
    pub(crate) internal_interface: String,
}

/// The router core. All entry points take `&self`; shared state sits
/// behind the ARP and NAT locks, which are never held at the same time.
pub struct Router {
    pub(crate) interfaces: InterfaceTable,
    pub(crate) routes: RoutingTable,
    pub(crate) arp: Mutex<ArpCache>,
    pub(crate) nat: Option<NatState>,
    ident: AtomicU16,
    pub(crate) metrics: Arc<MetricsRegistry>,
}

impl Router {
    pub fn new(
        interfaces: InterfaceTable,
        routes: RoutingTable,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        for iface in interfaces.iter() {
            metrics.register_interface(&iface.name);
        }
        Self {
            interfaces,
            routes,
            arp: Mutex::new(ArpCache::new()),
            nat: None,
            ident: AtomicU16::new(0),
            metrics,
        }
    }

    /// Activate NAT with the given internal interface and timeouts.
    pub fn enable_nat(&mut self, internal_interface: String, timeouts: NatTimeouts) {
        debug!("enabling NAT, internal interface {}", internal_interface);
        self.nat = Some(NatState {
            table: Mutex::new(NatTable::new(timeouts)),
            internal_interface,
        });
    }

    pub fn is_nat_enabled(&self) -> bool {
        self.nat.is_some()
    }

    /// Build a router from a validated configuration.
    pub fn from_config(config: &Config, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        let mut interfaces = Vec::new();
        for iface in &config.interfaces {
            interfaces.push(Interface {
                name: iface.name.clone(),
                mac: iface
                    .mac
                    .parse()
                    .map_err(|_| Error::Config(format!("bad MAC for {}", iface.name)))?,
                ip: iface
                    .address
                    .parse()
                    .map_err(|_| Error::Config(format!("bad address for {}", iface.name)))?,
            });
        }

        let mut routes = RoutingTable::new();
        for route in &config.routing.static_routes {
            let parse = |s: &str| -> Result<Ipv4Addr> {
                s.parse()
                    .map_err(|_| Error::Config(format!("bad route field {}", s)))
            };
            routes.add(Route {
                destination: parse(&route.destination)?,
                mask: parse(&route.mask)?,
                gateway: parse(&route.gateway)?,
                interface: route.interface.clone(),
            });
        }

        let mut router = Router::new(InterfaceTable::new(interfaces), routes, metrics);
        if config.nat.enabled {
            router.enable_nat(
                config.nat.internal_interface.clone(),
                NatTimeouts {
                    icmp: Duration::from_secs(config.nat.icmp_timeout_s),
                    tcp_established: Duration::from_secs(config.nat.tcp_established_timeout_s),
                    tcp_transitory: Duration::from_secs(config.nat.tcp_transitory_timeout_s),
                },
            );
        }
        Ok(router)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.name.clone()).collect()
    }

    /// Identification for a router-originated datagram.
    pub(crate) fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Process one received Ethernet frame.
    ///
    /// Returns the frames to emit. Frames addressed to neither the
    /// receiving interface's MAC nor broadcast are dropped.
    pub fn handle_packet(&self, frame: &[u8], iface_name: &str) -> FrameBatch {
        self.metrics.record_rx(iface_name, frame.len());

        let iface = match self.interfaces.by_name(iface_name) {
            Some(i) => i,
            None => {
                warn!("frame received on unknown interface {}", iface_name);
                return Vec::new();
            }
        };

        let parsed = match Frame::parse(frame) {
            Ok(f) => f,
            Err(e) => {
                trace!("unparseable frame on {}: {}", iface_name, e);
                self.metrics.record_rx_drop(iface_name);
                return Vec::new();
            }
        };

        let dst_mac = parsed.dst_mac();
        if dst_mac != iface.mac && !dst_mac.is_broadcast() {
            trace!("frame for {} not addressed to us, dropping", dst_mac);
            self.metrics.record_rx_drop(iface_name);
            return Vec::new();
        }

        let out = match parsed.ethertype() {
            x if x == EtherType::Arp as u16 => self.handle_arp(parsed.payload(), iface),
            x if x == EtherType::Ipv4 as u16 => self.handle_ipv4(parsed.payload(), iface),
            other => {
                trace!("unsupported ethertype 0x{:04x}, dropping", other);
                Vec::new()
            }
        };

        for (name, bytes) in &out {
            self.metrics.record_tx(name, bytes.len());
        }
        out
    }

    /// ARP termination: answer requests for our addresses, learn from
    /// replies addressed to us, and flush frames parked on resolution.
    fn handle_arp(&self, payload: &[u8], iface: &Interface) -> FrameBatch {
        let packet = match ArpPacket::parse(payload) {
            Ok(p) => p,
            Err(e) => {
                trace!("bad ARP packet on {}: {}", iface.name, e);
                return Vec::new();
            }
        };

        match packet.operation {
            ArpOp::Request => {
                if packet.target_ip != iface.ip || packet.is_gratuitous() {
                    trace!("ARP request for {} ignored", packet.target_ip);
                    return Vec::new();
                }

                self.metrics.arp_replies_sent.inc();
                debug!(
                    "ARP: answering who-has {} for {}",
                    iface.ip, packet.sender_ip
                );
                let reply =
                    ArpPacket::reply(iface.mac, iface.ip, packet.sender_mac, packet.sender_ip);
                let frame = FrameBuilder::new()
                    .dst_mac(packet.sender_mac)
                    .src_mac(iface.mac)
                    .ethertype(EtherType::Arp as u16)
                    .payload(&reply.to_bytes())
                    .build();
                vec![(iface.name.clone(), frame)]
            }
            ArpOp::Reply => {
                if packet.target_ip != iface.ip {
                    trace!("ARP reply for {} not ours, ignoring", packet.target_ip);
                    return Vec::new();
                }

                let now = Instant::now();
                let flushed = {
                    let mut arp = self.arp.lock().unwrap();
                    arp.insert(packet.sender_ip, packet.sender_mac, now);
                    self.metrics.set_arp_cache_size(arp.entry_count());
                    arp.take_request(packet.sender_ip)
                };

                let mut out = Vec::new();
                if let Some(request) = flushed {
                    debug!(
                        "ARP: {} is-at {}, flushing {} queued frames",
                        packet.sender_ip,
                        packet.sender_mac,
                        request.queued.len()
                    );
                    for mut pending in request.queued {
                        ethernet::set_dst_mac(&mut pending.frame, packet.sender_mac);
                        out.push((pending.out_iface, pending.frame));
                    }
                }
                out
            }
        }
    }

    /// IPv4 ingress: structural validation, checksum verification, then
    /// dispatch to the NAT pipeline or the plain for-us/forward split.
    fn handle_ipv4(&self, payload: &[u8], iface: &Interface) -> FrameBatch {
        let header = match Ipv4Header::parse_validated(payload) {
            Ok(h) => h,
            Err(e) => {
                debug!("invalid IPv4 datagram on {}: {}", iface.name, e);
                self.metrics.record_rx_drop(&iface.name);
                return Vec::new();
            }
        };

        // Frames may be padded below the Ethernet minimum; everything
        // past total_length is not part of the datagram.
        let datagram = &payload[..header.total_length() as usize];

        if self.nat.is_some() {
            return self.nat_handle_datagram(datagram, iface);
        }

        if self.interfaces.owns_ip(header.dst_addr()) {
            self.handle_local(datagram)
        } else {
            self.forward_datagram(datagram.to_vec(), &iface.name)
        }
    }

    /// Forward a transit datagram, generating ICMP errors as needed.
    pub(crate) fn forward_datagram(&self, datagram: Vec<u8>, ingress: &str) -> FrameBatch {
        match plan_forward(&datagram, ingress, &self.interfaces, &self.routes) {
            ForwardDecision::Forward {
                datagram: rewritten,
                route,
            } => {
                self.metrics.packets_forwarded.inc();
                self.send_via_route(rewritten, &route)
            }
            ForwardDecision::Local => self.handle_local(&datagram),
            ForwardDecision::TimeExceeded => {
                self.metrics.packets_dropped.inc();
                debug!("TTL exhausted, answering with time-exceeded");
                self.send_icmp_error(IcmpErrorKind::TimeExceeded, &datagram)
            }
            ForwardDecision::NoRoute => {
                self.metrics.packets_dropped.inc();
                debug!("no usable route, answering with network-unreachable");
                self.send_icmp_error(IcmpErrorKind::NetUnreachable, &datagram)
            }
            ForwardDecision::Drop => {
                self.metrics.packets_dropped.inc();
                Vec::new()
            }
        }
    }

    /// A datagram addressed to the router itself.
    pub(crate) fn handle_local(&self, datagram: &[u8]) -> FrameBatch {
        let header = match Ipv4Header::parse(datagram) {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };

        if header.protocol() != Protocol::Icmp as u8 {
            // The router runs no transport services.
            debug!(
                "IP protocol {} addressed to router, answering port-unreachable",
                header.protocol()
            );
            return self.send_icmp_error(IcmpErrorKind::PortUnreachable, datagram);
        }

        let icmp_payload = header.payload();
        if !icmp::verify_checksum(icmp_payload) {
            debug!("ICMP to router with bad checksum, dropping");
            return Vec::new();
        }

        if icmp_payload[0] != IcmpType::EchoRequest as u8 {
            debug!(
                "ICMP type {} to router ignored",
                icmp_payload[0]
            );
            return Vec::new();
        }

        let reply_icmp = match icmp::build_echo_reply(icmp_payload) {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };

        let reply = Ipv4Builder::new()
            .src_addr(header.dst_addr())
            .dst_addr(header.src_addr())
            .protocol(Protocol::Icmp as u8)
            .identification(self.next_ident())
            .payload(&reply_icmp)
            .build();

        self.metrics.icmp_echo_replies.inc();
        debug!("echo reply to {}", header.src_addr());
        self.send_ip_datagram(reply)
    }

    /// Send a router-originated datagram: route toward its destination
    /// and hand to the link layer.
    pub(crate) fn send_ip_datagram(&self, datagram: Vec<u8>) -> FrameBatch {
        let dst = match Ipv4Header::parse(&datagram) {
            Ok(h) => h.dst_addr(),
            Err(_) => return Vec::new(),
        };

        let route = match self.routes.lookup(dst) {
            Some(r) => r,
            None => {
                debug!("no route for router-originated packet to {}", dst);
                return Vec::new();
            }
        };

        self.send_via_route(datagram, route)
    }

    /// Construct and send an ICMP error about `original` toward its
    /// sender. The source address is the IP of the interface the reply
    /// routes out of; errors about our own packets are swallowed so a
    /// failure can never echo back and forth.
    pub(crate) fn send_icmp_error(&self, kind: IcmpErrorKind, original: &[u8]) -> FrameBatch {
        let header = match Ipv4Header::parse(original) {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };

        let sender = header.src_addr();
        if self.interfaces.owns_ip(sender) {
            debug!("undeliverable router-originated packet, dropping");
            return Vec::new();
        }

        let route = match self.routes.lookup(sender) {
            Some(r) => r,
            None => {
                debug!("no route back to {} for ICMP error", sender);
                return Vec::new();
            }
        };
        let src_iface = match self.interfaces.by_name(&route.interface) {
            Some(i) => i,
            None => {
                warn!("route references unknown interface {}", route.interface);
                return Vec::new();
            }
        };

        let message = icmp::build_error(kind, original);
        let datagram = Ipv4Builder::new()
            .src_addr(src_iface.ip)
            .dst_addr(sender)
            .protocol(Protocol::Icmp as u8)
            .identification(self.next_ident())
            .payload(&message)
            .build();

        self.metrics.icmp_errors_sent.inc();
        debug!("ICMP {:?} to {}", kind, sender);
        self.send_via_route(datagram, route)
    }

    /// Link-layer send: fill the Ethernet header and either emit (ARP
    /// hit) or park the frame behind an ARP request (miss).
    pub(crate) fn send_via_route(&self, datagram: Vec<u8>, route: &Route) -> FrameBatch {
        let iface = match self.interfaces.by_name(&route.interface) {
            Some(i) => i,
            None => {
                warn!("route references unknown interface {}", route.interface);
                return Vec::new();
            }
        };

        let dst = match Ipv4Header::parse(&datagram) {
            Ok(h) => h.dst_addr(),
            Err(_) => return Vec::new(),
        };
        let next_hop = route.next_hop(dst);

        let mut frame = FrameBuilder::new()
            .dst_mac(MacAddr::ZERO)
            .src_mac(iface.mac)
            .ethertype(EtherType::Ipv4 as u16)
            .payload(&datagram)
            .build();

        let now = Instant::now();
        let mut arp = self.arp.lock().unwrap();
        if let Some(mac) = arp.lookup(next_hop, now) {
            drop(arp);
            ethernet::set_dst_mac(&mut frame, mac);
            trace!("sending {} bytes to {} via {}", frame.len(), next_hop, iface.name);
            return vec![(iface.name.clone(), frame)];
        }

        let is_new = arp.enqueue(
            next_hop,
            &iface.name,
            PendingFrame {
                frame,
                out_iface: iface.name.clone(),
            },
            now,
        );
        drop(arp);

        if is_new {
            self.metrics.arp_requests_sent.inc();
            debug!("ARP: who-has {}, tell {}", next_hop, iface.ip);
            vec![(iface.name.clone(), self.build_arp_request_frame(iface, next_hop))]
        } else {
            Vec::new()
        }
    }

    fn build_arp_request_frame(&self, iface: &Interface, target: Ipv4Addr) -> Vec<u8> {
        let request = ArpPacket::request(iface.mac, iface.ip, target);
        FrameBuilder::new()
            .dst_mac(MacAddr::BROADCAST)
            .src_mac(iface.mac)
            .ethertype(EtherType::Arp as u16)
            .payload(&request.to_bytes())
            .build()
    }

    /// The 1-second ARP sweep: re-broadcast stale requests, and answer
    /// every frame queued behind an exhausted request with ICMP
    /// host-unreachable.
    pub fn arp_tick(&self) -> FrameBatch {
        self.arp_tick_at(Instant::now())
    }

    pub(crate) fn arp_tick_at(&self, now: Instant) -> FrameBatch {
        let sweep = {
            let mut arp = self.arp.lock().unwrap();
            arp.evict_expired(now);
            let sweep = arp.sweep(now);
            self.metrics.set_arp_cache_size(arp.entry_count());
            sweep
        };

        let mut out = Vec::new();

        for (iface_name, target) in sweep.retries {
            if let Some(iface) = self.interfaces.by_name(&iface_name) {
                self.metrics.arp_requests_sent.inc();
                trace!("ARP: retrying who-has {} on {}", target, iface_name);
                out.push((iface_name, self.build_arp_request_frame(iface, target)));
            }
        }

        for request in sweep.failures {
            self.metrics.arp_resolution_failures.inc();
            warn!(
                "ARP: {} unresolved after {} attempts, failing {} queued frames",
                request.ip,
                request.times_sent,
                request.queued.len()
            );
            for pending in request.queued {
                if pending.frame.len() > ethernet::HEADER_SIZE {
                    let datagram = &pending.frame[ethernet::HEADER_SIZE..];
                    out.extend(self.send_icmp_error(IcmpErrorKind::HostUnreachable, datagram));
                }
            }
        }

        out
    }

    /// The 1-second NAT sweep: expire idle mappings and connections,
    /// answering any timed-out simultaneous-open SYN with
    /// port-unreachable.
    pub fn nat_tick(&self) -> FrameBatch {
        self.nat_tick_at(Instant::now())
    }

    pub(crate) fn nat_tick_at(&self, now: Instant) -> FrameBatch {
        let nat = match &self.nat {
            Some(n) => n,
            None => return Vec::new(),
        };

        let sweep = {
            let mut table = nat.table.lock().unwrap();
            let sweep = table.sweep(now);
            self.metrics.set_nat_mapping_count(table.len());
            sweep
        };

        if sweep.expired_mappings > 0 {
            self.metrics
                .nat_mappings_expired
                .add(sweep.expired_mappings as u64);
        }

        let mut out = Vec::new();
        for syn in sweep.timed_out_syns {
            debug!("simultaneous-open window closed, answering queued SYN");
            out.extend(self.send_icmp_error(IcmpErrorKind::PortUnreachable, &syn));
        }
        out
    }
}
