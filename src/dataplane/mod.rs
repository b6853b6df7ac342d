//! Data plane components
//!
//! Packet pipeline: interface and routing tables, ARP resolution with
//! pending-frame queues, the NAT table and translator, the IPv4
//! forwarder, and the router tying them together.

mod arp_cache;
mod forwarder;
mod interface;
mod nat;
mod nat_table;
mod router;
mod routing;

pub use arp_cache::{ArpCache, ArpRequest, ArpSweep, PendingFrame};
pub use forwarder::{plan_forward, ForwardDecision};
pub use interface::{Interface, InterfaceTable};
pub use nat_table::{
    NatKind, NatMapping, NatSweep, NatTable, NatTimeouts, TcpConnState, TcpConnection,
};
pub use router::{FrameBatch, Router, MAINTENANCE_INTERVAL};
pub use routing::{Route, RoutingTable};
