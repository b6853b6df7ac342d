//! natgate - Software IPv4 router with an integrated NAPT gateway
//!
//! Receives raw Ethernet frames from a transport, routes IPv4 traffic
//! between one internal and one or more external networks, terminates ARP
//! on each interface, answers ICMP echoes addressed to itself, and (when
//! NAT is enabled) rewrites ICMP identifiers and TCP ports so internal
//! hosts share a single external address per egress interface.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
