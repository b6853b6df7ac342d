//! Packet-processing metrics.
//!
//! Thread-safe counters shared between the ingress worker and the
//! maintenance timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Atomic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface rx/tx statistics
#[derive(Debug, Default)]
pub struct InterfaceStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    pub rx_drops: Counter,
}

impl InterfaceStats {
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    pub fn record_rx_drop(&self) {
        self.rx_drops.inc();
    }
}

/// Global metrics registry for the router
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    interfaces: RwLock<HashMap<String, InterfaceStats>>,

    // ARP
    pub arp_requests_sent: Counter,
    pub arp_replies_sent: Counter,
    pub arp_resolution_failures: Counter,

    // Forwarding
    pub packets_forwarded: Counter,
    pub packets_dropped: Counter,

    // ICMP
    pub icmp_echo_replies: Counter,
    pub icmp_errors_sent: Counter,

    // NAT
    pub nat_mappings_created: Counter,
    pub nat_mappings_expired: Counter,
    pub nat_translations: Counter,
    pub nat_rejects: Counter,

    // Gauges
    pub arp_cache_size: AtomicU64,
    pub nat_mapping_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_interface(&self, name: &str) {
        let mut interfaces = self.interfaces.write().unwrap();
        interfaces.entry(name.to_string()).or_default();
    }

    pub fn record_rx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.record_rx(bytes);
        }
    }

    pub fn record_tx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.record_tx(bytes);
        }
    }

    pub fn record_rx_drop(&self, interface: &str) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.record_rx_drop();
        }
    }

    pub fn set_arp_cache_size(&self, size: usize) {
        self.arp_cache_size.store(size as u64, Ordering::Relaxed);
    }

    pub fn set_nat_mapping_count(&self, count: usize) {
        self.nat_mapping_count.store(count as u64, Ordering::Relaxed);
    }

    /// Export all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("arp_requests_sent".into(), self.arp_requests_sent.get()),
            ("arp_replies_sent".into(), self.arp_replies_sent.get()),
            (
                "arp_resolution_failures".into(),
                self.arp_resolution_failures.get(),
            ),
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("packets_dropped".into(), self.packets_dropped.get()),
            ("icmp_echo_replies".into(), self.icmp_echo_replies.get()),
            ("icmp_errors_sent".into(), self.icmp_errors_sent.get()),
            (
                "nat_mappings_created".into(),
                self.nat_mappings_created.get(),
            ),
            (
                "nat_mappings_expired".into(),
                self.nat_mappings_expired.get(),
            ),
            ("nat_translations".into(), self.nat_translations.get()),
            ("nat_rejects".into(), self.nat_rejects.get()),
            (
                "arp_cache_size".into(),
                self.arp_cache_size.load(Ordering::Relaxed),
            ),
            (
                "nat_mapping_count".into(),
                self.nat_mapping_count.load(Ordering::Relaxed),
            ),
        ];

        let interfaces = self.interfaces.read().unwrap();
        for (name, stats) in interfaces.iter() {
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_rx_drops", name), stats.rx_drops.get()),
            ]);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_registry_export() {
        let registry = MetricsRegistry::new();
        registry.register_interface("eth3");

        registry.record_rx("eth3", 98);
        registry.record_tx("eth3", 98);
        registry.packets_forwarded.inc();
        registry.set_arp_cache_size(2);

        let metrics = registry.export();
        assert!(metrics.contains(&("packets_forwarded".into(), 1)));
        assert!(metrics.contains(&("arp_cache_size".into(), 2)));
        assert!(metrics.contains(&("eth3_rx_packets".into(), 1)));
        assert!(metrics.contains(&("eth3_rx_bytes".into(), 98)));
    }

    #[test]
    fn test_unregistered_interface_ignored() {
        let registry = MetricsRegistry::new();
        registry.record_rx("eth9", 100);
        assert!(!registry
            .export()
            .iter()
            .any(|(k, _)| k.starts_with("eth9")));
    }
}
