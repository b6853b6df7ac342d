//! IPv4 forwarding decisions
//!
//! Pure decision logic for transit datagrams: for-us classification, TTL
//! handling, and route selection. The router executes the decision
//! (building frames, consulting ARP, generating ICMP errors).

use crate::dataplane::{InterfaceTable, Route, RoutingTable};
use crate::protocol::ipv4::Ipv4Packet;

/// What to do with a transit datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    /// TTL decremented and checksum refreshed; hand to the link layer.
    Forward { datagram: Vec<u8>, route: Route },
    /// Addressed to one of the router's own interfaces.
    Local,
    /// TTL reached zero; answer with ICMP time-exceeded and drop.
    TimeExceeded,
    /// No route, or the route leads back out the ingress interface;
    /// answer with ICMP network-unreachable and drop.
    NoRoute,
    /// Structurally unusable; drop without a response.
    Drop,
}

/// Decide the fate of a validated IPv4 datagram received on `ingress`.
pub fn plan_forward(
    datagram: &[u8],
    ingress: &str,
    interfaces: &InterfaceTable,
    routes: &RoutingTable,
) -> ForwardDecision {
    let mut packet = match Ipv4Packet::from_bytes(datagram) {
        Ok(p) => p,
        Err(_) => return ForwardDecision::Drop,
    };

    let dst = packet.dst_addr();
    if interfaces.owns_ip(dst) {
        return ForwardDecision::Local;
    }

    if !packet.decrement_ttl() {
        return ForwardDecision::TimeExceeded;
    }
    packet.refresh_checksum();

    let route = match routes.lookup(dst) {
        Some(r) => r.clone(),
        None => return ForwardDecision::NoRoute,
    };

    if route.interface == ingress {
        return ForwardDecision::NoRoute;
    }

    ForwardDecision::Forward {
        datagram: packet.into_bytes(),
        route,
    }
}
