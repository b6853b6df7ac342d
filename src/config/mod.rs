//! Configuration management
//!
//! Loads and validates config.toml: interfaces, static routes, and NAT
//! options. The routing table and interface list are supplied per run;
//! nothing is persisted.

mod types;

pub use types::*;

use crate::protocol::MacAddr;
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Validate a parsed configuration: addresses parse, names are unique,
/// and every route (and the NAT internal interface, when enabled) refers
/// to a declared interface.
pub fn validate(config: &Config) -> Result<()> {
    if config.interfaces.is_empty() {
        return Err(Error::Config("no interfaces declared".into()));
    }

    let mut names = HashSet::new();
    for iface in &config.interfaces {
        if !names.insert(iface.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate interface name {}",
                iface.name
            )));
        }
        iface.mac.parse::<MacAddr>().map_err(|_| {
            Error::Config(format!("interface {}: bad MAC {}", iface.name, iface.mac))
        })?;
        iface.address.parse::<Ipv4Addr>().map_err(|_| {
            Error::Config(format!(
                "interface {}: bad address {}",
                iface.name, iface.address
            ))
        })?;
    }

    for route in &config.routing.static_routes {
        for (field, value) in [
            ("destination", &route.destination),
            ("mask", &route.mask),
            ("gateway", &route.gateway),
        ] {
            value.parse::<Ipv4Addr>().map_err(|_| {
                Error::Config(format!("route {}: bad {} {}", route.destination, field, value))
            })?;
        }
        if !names.contains(route.interface.as_str()) {
            return Err(Error::Config(format!(
                "route {} references unknown interface {}",
                route.destination, route.interface
            )));
        }
    }

    if config.nat.enabled && !names.contains(config.nat.internal_interface.as_str()) {
        return Err(Error::Config(format!(
            "NAT internal interface {} is not declared",
            config.nat.internal_interface
        )));
    }

    Ok(())
}
