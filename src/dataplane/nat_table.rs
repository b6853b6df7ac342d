//! NAT translation table
//!
//! Endpoint-independent mappings for ICMP queries and TCP connections,
//! with per-mapping idle timeouts and a per-connection TCP state machine
//! (including the simultaneous-open grace window). All mutation happens
//! under the table's lock; lookups hand out owned snapshots.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// First external port / ICMP identifier handed out.
pub const PORT_RANGE_START: u16 = 50_000;

/// Last external port / ICMP identifier before the counter wraps.
pub const PORT_RANGE_END: u16 = 59_999;

/// How long an unsolicited inbound SYN may wait for the matching
/// outbound SYN of a simultaneous open.
pub const SIM_OPEN_WINDOW: Duration = Duration::from_secs(6);

/// Mapping kind: ICMP query identifiers or TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Icmp,
    Tcp,
}

/// Per-connection TCP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpConnState {
    /// Internal host sent SYN, no answer seen yet
    OutboundSyn,
    /// Traffic flowing in both directions
    Connected,
    /// FIN observed from either side
    TimeWait,
    /// Unsolicited inbound SYN parked awaiting a simultaneous open
    InboundSynPending,
}

/// One TCP connection through a mapping, keyed by the external peer.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub state: TcpConnState,
    pub last_accessed: Instant,
    pub queued_inbound_syn: Option<Vec<u8>>,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
}

/// One NAT table entry.
///
/// Invariants: `(kind, ip_int, aux_int)` is unique and `(kind, aux_ext)`
/// is unique across the table. `conns` is empty for ICMP mappings.
#[derive(Debug, Clone)]
pub struct NatMapping {
    pub kind: NatKind,
    pub ip_int: Ipv4Addr,
    pub aux_int: u16,
    pub aux_ext: u16,
    pub last_updated: Instant,
    pub conns: Vec<TcpConnection>,
}

impl NatMapping {
    pub fn find_conn_mut(
        &mut self,
        peer_ip: Ipv4Addr,
        peer_port: u16,
    ) -> Option<&mut TcpConnection> {
        self.conns
            .iter_mut()
            .find(|c| c.peer_ip == peer_ip && c.peer_port == peer_port)
    }
}

/// Idle-expiry configuration.
#[derive(Debug, Clone)]
pub struct NatTimeouts {
    pub icmp: Duration,
    pub tcp_established: Duration,
    pub tcp_transitory: Duration,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            icmp: Duration::from_secs(60),
            tcp_established: Duration::from_secs(7440),
            tcp_transitory: Duration::from_secs(300),
        }
    }
}

/// An unsolicited inbound SYN aimed at an external port with no mapping
/// yet, parked for the simultaneous-open window. If an internal host
/// opens to the same peer in time, the new mapping adopts `aux_ext`.
#[derive(Debug, Clone)]
pub struct SynCandidate {
    pub aux_ext: u16,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub created_at: Instant,
    pub queued_syn: Vec<u8>,
}

/// Side effects collected by the 1-second expiry sweep.
#[derive(Debug, Default)]
pub struct NatSweep {
    /// Queued inbound SYN datagrams whose simultaneous-open window
    /// closed; each is answered with ICMP port-unreachable.
    pub timed_out_syns: Vec<Vec<u8>>,
    /// Number of mappings destroyed.
    pub expired_mappings: usize,
}

/// The NAT translation table.
#[derive(Debug)]
pub struct NatTable {
    mappings: Vec<NatMapping>,
    candidates: Vec<SynCandidate>,
    timeouts: NatTimeouts,
    next_tcp_port: u16,
    next_icmp_ident: u16,
}

impl NatTable {
    pub fn new(timeouts: NatTimeouts) -> Self {
        Self {
            mappings: Vec::new(),
            candidates: Vec::new(),
            timeouts,
            next_tcp_port: PORT_RANGE_START,
            next_icmp_ident: PORT_RANGE_START,
        }
    }

    /// Snapshot lookup by internal (ip, port/identifier). Touches the
    /// mapping's `last_updated`.
    pub fn lookup_internal(
        &mut self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
        now: Instant,
    ) -> Option<NatMapping> {
        let mapping = self
            .mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.ip_int == ip_int && m.aux_int == aux_int)?;
        mapping.last_updated = now;
        Some(mapping.clone())
    }

    /// Snapshot lookup by external port/identifier. Touches the
    /// mapping's `last_updated`.
    pub fn lookup_external(
        &mut self,
        aux_ext: u16,
        kind: NatKind,
        now: Instant,
    ) -> Option<NatMapping> {
        let mapping = self
            .mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.aux_ext == aux_ext)?;
        mapping.last_updated = now;
        Some(mapping.clone())
    }

    /// In-place access for state-machine updates; only valid under the
    /// table lock.
    pub fn get_internal_mut(
        &mut self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
    ) -> Option<&mut NatMapping> {
        self.mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.ip_int == ip_int && m.aux_int == aux_int)
    }

    pub fn get_external_mut(&mut self, aux_ext: u16, kind: NatKind) -> Option<&mut NatMapping> {
        self.mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.aux_ext == aux_ext)
    }

    /// Create a mapping for a never-before-seen internal (ip, aux),
    /// allocating a fresh external port or identifier. Returns a
    /// snapshot of the new entry.
    pub fn insert_mapping(
        &mut self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
        now: Instant,
    ) -> NatMapping {
        let aux_ext = self.allocate_aux(kind);
        let mapping = NatMapping {
            kind,
            ip_int,
            aux_int,
            aux_ext,
            last_updated: now,
            conns: Vec::new(),
        };
        debug!(
            "NAT: new {:?} mapping {}:{} <-> {}",
            kind, ip_int, aux_int, aux_ext
        );
        self.mappings.push(mapping.clone());
        mapping
    }

    /// Create a mapping that adopts a pre-decided external port, used
    /// when an outbound SYN completes a simultaneous open.
    pub fn insert_mapping_with_aux(
        &mut self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
        aux_ext: u16,
        now: Instant,
    ) -> NatMapping {
        let mapping = NatMapping {
            kind,
            ip_int,
            aux_int,
            aux_ext,
            last_updated: now,
            conns: Vec::new(),
        };
        debug!(
            "NAT: new {:?} mapping {}:{} <-> {} (adopted)",
            kind, ip_int, aux_int, aux_ext
        );
        self.mappings.push(mapping.clone());
        mapping
    }

    /// Park an unsolicited inbound SYN to an unmapped external port.
    /// Returns false when a candidate for the same port and peer is
    /// already waiting (a retransmitted SYN).
    pub fn park_inbound_syn(
        &mut self,
        aux_ext: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        datagram: &[u8],
        now: Instant,
    ) -> bool {
        let exists = self
            .candidates
            .iter()
            .any(|c| c.aux_ext == aux_ext && c.peer_ip == peer_ip && c.peer_port == peer_port);
        if exists {
            return false;
        }
        self.candidates.push(SynCandidate {
            aux_ext,
            peer_ip,
            peer_port,
            created_at: now,
            queued_syn: datagram.to_vec(),
        });
        true
    }

    /// Claim the parked SYN for `peer`, if any. Called when an outbound
    /// SYN toward that peer arrives within the window.
    pub fn take_candidate(&mut self, peer_ip: Ipv4Addr, peer_port: u16) -> Option<SynCandidate> {
        let pos = self
            .candidates
            .iter()
            .position(|c| c.peer_ip == peer_ip && c.peer_port == peer_port)?;
        Some(self.candidates.remove(pos))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Rolling allocator over 50000-59999. The counter wraps without
    /// checking for ports still in use; the range is assumed to outlast
    /// any one run.
    fn allocate_aux(&mut self, kind: NatKind) -> u16 {
        let counter = match kind {
            NatKind::Tcp => &mut self.next_tcp_port,
            NatKind::Icmp => &mut self.next_icmp_ident,
        };
        let aux = *counter;
        *counter = if *counter >= PORT_RANGE_END {
            PORT_RANGE_START
        } else {
            *counter + 1
        };
        aux
    }

    /// The 1-second expiry sweep.
    ///
    /// ICMP mappings die when idle past the ICMP timeout. TCP
    /// connections die on their state's timeout; a pending inbound SYN
    /// is handed back so the router can answer it with port-unreachable.
    /// TCP mappings die when their last connection dies.
    pub fn sweep(&mut self, now: Instant) -> NatSweep {
        let mut report = NatSweep::default();
        let timeouts = self.timeouts.clone();

        let window = timeouts.tcp_transitory.min(SIM_OPEN_WINDOW);
        self.candidates.retain_mut(|candidate| {
            if now.duration_since(candidate.created_at) <= window {
                return true;
            }
            debug!(
                "NAT: parked SYN from {}:{} timed out",
                candidate.peer_ip, candidate.peer_port
            );
            report
                .timed_out_syns
                .push(std::mem::take(&mut candidate.queued_syn));
            false
        });

        self.mappings.retain_mut(|mapping| match mapping.kind {
            NatKind::Icmp => {
                let alive = now.duration_since(mapping.last_updated) <= timeouts.icmp;
                if !alive {
                    debug!(
                        "NAT: ICMP mapping {}:{} <-> {} timed out",
                        mapping.ip_int, mapping.aux_int, mapping.aux_ext
                    );
                    report.expired_mappings += 1;
                }
                alive
            }
            NatKind::Tcp => {
                mapping.conns.retain_mut(|conn| {
                    let idle = now.duration_since(conn.last_accessed);
                    let timeout = match conn.state {
                        TcpConnState::Connected => timeouts.tcp_established,
                        TcpConnState::OutboundSyn | TcpConnState::TimeWait => {
                            timeouts.tcp_transitory
                        }
                        TcpConnState::InboundSynPending => {
                            timeouts.tcp_transitory.min(SIM_OPEN_WINDOW)
                        }
                    };
                    if idle <= timeout {
                        return true;
                    }
                    debug!(
                        "NAT: {:?} connection to {}:{} timed out",
                        conn.state, conn.peer_ip, conn.peer_port
                    );
                    if let Some(syn) = conn.queued_inbound_syn.take() {
                        report.timed_out_syns.push(syn);
                    }
                    false
                });

                let alive = !mapping.conns.is_empty();
                if !alive {
                    debug!(
                        "NAT: TCP mapping {}:{} <-> {} has no connections left, closing",
                        mapping.ip_int, mapping.aux_int, mapping.aux_ext
                    );
                    report.expired_mappings += 1;
                }
                alive
            }
        });

        report
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
