//! Configuration types

use serde::Deserialize;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub nat: NatConfig,
    #[serde(default)]
    pub log: LogSection,
}

/// One router interface: a name, a MAC, and an IPv4 address.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub mac: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
}

/// A routing table row: destination/netmask, gateway, egress interface.
/// A gateway of "0.0.0.0" marks a directly connected network.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticRoute {
    pub destination: String,
    pub mask: String,
    pub gateway: String,
    pub interface: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_internal_interface")]
    pub internal_interface: String,
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_s: u64,
    #[serde(default = "default_tcp_established_timeout")]
    pub tcp_established_timeout_s: u64,
    #[serde(default = "default_tcp_transitory_timeout")]
    pub tcp_transitory_timeout_s: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            internal_interface: default_internal_interface(),
            icmp_timeout_s: default_icmp_timeout(),
            tcp_established_timeout_s: default_tcp_established_timeout(),
            tcp_transitory_timeout_s: default_tcp_transitory_timeout(),
        }
    }
}

fn default_internal_interface() -> String {
    "eth1".to_string()
}

fn default_icmp_timeout() -> u64 {
    60
}

fn default_tcp_established_timeout() -> u64 {
    7440
}

fn default_tcp_transitory_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
