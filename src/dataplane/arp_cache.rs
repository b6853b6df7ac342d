//! ARP cache and request queue
//!
//! Maps next-hop IPv4 addresses to MACs with a 15-second freshness TTL,
//! and tracks outstanding requests. Each request holds the frames queued
//! behind it; the retry sweep re-broadcasts once per second and fails the
//! request after five unanswered attempts.

use crate::protocol::MacAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Cache entries are considered fresh this long after insertion.
pub const ENTRY_TTL: Duration = Duration::from_secs(15);

/// Minimum spacing between broadcasts of the same request.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A request is abandoned after this many unanswered broadcasts.
pub const MAX_ATTEMPTS: u8 = 5;

#[derive(Debug, Clone)]
struct ArpEntry {
    mac: MacAddr,
    inserted_at: Instant,
}

/// An outbound frame parked until its next hop resolves. The Ethernet
/// destination is filled in when the reply arrives.
#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub frame: Vec<u8>,
    pub out_iface: String,
}

/// One outstanding ARP resolution, with the frames queued behind it.
#[derive(Debug)]
pub struct ArpRequest {
    pub ip: Ipv4Addr,
    pub iface: String,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub times_sent: u8,
    pub queued: Vec<PendingFrame>,
}

/// What the 1-second sweep decided.
#[derive(Debug, Default)]
pub struct ArpSweep {
    /// (interface, target IP) pairs to re-broadcast.
    pub retries: Vec<(String, Ipv4Addr)>,
    /// Requests that exhausted their attempts, with their queued frames.
    pub failures: Vec<ArpRequest>,
}

/// ARP cache plus outstanding-request queue
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    requests: Vec<ArpRequest>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Instant) {
        self.entries.insert(
            ip,
            ArpEntry {
                mac,
                inserted_at: now,
            },
        );
    }

    /// Fresh-entry lookup. Expired entries are misses.
    pub fn lookup(&self, ip: Ipv4Addr, now: Instant) -> Option<MacAddr> {
        self.entries
            .get(&ip)
            .filter(|e| now.duration_since(e.inserted_at) < ENTRY_TTL)
            .map(|e| e.mac)
    }

    /// Park a frame behind the request for `ip`, creating the request if
    /// absent. Returns true when the request is new and the caller must
    /// broadcast the first ARP request (already accounted as sent).
    pub fn enqueue(
        &mut self,
        ip: Ipv4Addr,
        iface: &str,
        pending: PendingFrame,
        now: Instant,
    ) -> bool {
        if let Some(request) = self.requests.iter_mut().find(|r| r.ip == ip) {
            request.queued.push(pending);
            return false;
        }

        self.requests.push(ArpRequest {
            ip,
            iface: iface.to_string(),
            first_sent: now,
            last_sent: now,
            times_sent: 1,
            queued: vec![pending],
        });
        true
    }

    /// Remove and return the request for `ip`, if any. Called when a
    /// reply arrives so the queued frames can be flushed.
    pub fn take_request(&mut self, ip: Ipv4Addr) -> Option<ArpRequest> {
        let pos = self.requests.iter().position(|r| r.ip == ip)?;
        Some(self.requests.remove(pos))
    }

    /// The 1-second retry sweep. Requests due for another broadcast are
    /// returned in `retries` with their send counters updated; requests
    /// out of attempts are removed and returned in `failures`.
    pub fn sweep(&mut self, now: Instant) -> ArpSweep {
        let mut report = ArpSweep::default();

        let mut idx = 0;
        while idx < self.requests.len() {
            let due = now.duration_since(self.requests[idx].last_sent) >= RETRY_INTERVAL;
            if !due {
                idx += 1;
                continue;
            }

            if self.requests[idx].times_sent >= MAX_ATTEMPTS {
                report.failures.push(self.requests.remove(idx));
                continue;
            }

            let request = &mut self.requests[idx];
            request.times_sent += 1;
            request.last_sent = now;
            report.retries.push((request.iface.clone(), request.ip));
            idx += 1;
        }

        report
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    /// Drop entries past their TTL. Misses already ignore them; this
    /// keeps the map from growing without bound.
    pub fn evict_expired(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) < ENTRY_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x0e, 0x20, 0xab, 0x80, 0x00, 0x02]);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 1, last)
    }

    fn pending() -> PendingFrame {
        PendingFrame {
            frame: vec![0u8; 60],
            out_iface: "eth3".into(),
        }
    }

    #[test]
    fn test_lookup_fresh_and_expired() {
        let mut cache = ArpCache::new();
        let now = Instant::now();

        cache.insert(ip(1), MAC, now);
        assert_eq!(cache.lookup(ip(1), now), Some(MAC));
        assert_eq!(
            cache.lookup(ip(1), now + Duration::from_secs(14)),
            Some(MAC)
        );
        assert_eq!(cache.lookup(ip(1), now + Duration::from_secs(15)), None);
    }

    #[test]
    fn test_insert_refreshes_ttl() {
        let mut cache = ArpCache::new();
        let now = Instant::now();

        cache.insert(ip(1), MAC, now);
        cache.insert(ip(1), MAC, now + Duration::from_secs(10));
        assert_eq!(
            cache.lookup(ip(1), now + Duration::from_secs(20)),
            Some(MAC)
        );
    }

    #[test]
    fn test_enqueue_single_request_per_ip() {
        let mut cache = ArpCache::new();
        let now = Instant::now();

        assert!(cache.enqueue(ip(1), "eth3", pending(), now));
        assert!(!cache.enqueue(ip(1), "eth3", pending(), now));
        assert_eq!(cache.pending_count(), 1);

        let request = cache.take_request(ip(1)).unwrap();
        assert_eq!(request.queued.len(), 2);
        assert_eq!(request.times_sent, 1);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_sweep_retries_then_fails() {
        let mut cache = ArpCache::new();
        let start = Instant::now();
        cache.enqueue(ip(1), "eth3", pending(), start);

        // Not due yet
        let report = cache.sweep(start + Duration::from_millis(500));
        assert!(report.retries.is_empty() && report.failures.is_empty());

        // Four more broadcasts, one per second
        for i in 1..=4u64 {
            let report = cache.sweep(start + Duration::from_secs(i));
            assert_eq!(report.retries, vec![("eth3".to_string(), ip(1))]);
            assert!(report.failures.is_empty());
        }

        // Fifth sweep after five sends: give up
        let report = cache.sweep(start + Duration::from_secs(5));
        assert!(report.retries.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].times_sent, MAX_ATTEMPTS);
        assert_eq!(report.failures[0].queued.len(), 1);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_sweep_leaves_other_requests_alone() {
        let mut cache = ArpCache::new();
        let start = Instant::now();
        cache.enqueue(ip(1), "eth3", pending(), start);
        cache.enqueue(ip(2), "eth1", pending(), start + Duration::from_millis(900));

        let report = cache.sweep(start + Duration::from_secs(1));
        assert_eq!(report.retries, vec![("eth3".to_string(), ip(1))]);
        assert_eq!(cache.pending_count(), 2);
    }

    #[test]
    fn test_evict_expired() {
        let mut cache = ArpCache::new();
        let now = Instant::now();
        cache.insert(ip(1), MAC, now);
        cache.insert(ip(2), MAC, now + Duration::from_secs(10));

        cache.evict_expired(now + Duration::from_secs(16));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.lookup(ip(2), now + Duration::from_secs(16)), Some(MAC));
    }
}
