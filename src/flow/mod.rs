//! Bidirectional flow table and TCP connection state (C3, §4.3).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::decode::transport::TcpFlags;

/// TCP connection state for a [`Flow`]. Non-TCP flows stay `New` for their
/// whole lifetime. Serializes to the spec's literal state tokens (`NEW`,
/// `SYN_SENT`, ...), matching `EventKind`'s own `rename_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    New,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    Closed,
    Reset,
}

/// Deterministic ordering of the two flow endpoints so both directions of a
/// conversation hash to the same table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    lo_ip: IpAddr,
    lo_port: u16,
    hi_ip: IpAddr,
    hi_port: u16,
    l4_protocol: u8,
}

impl CanonicalKey {
    pub fn new(ip_a: IpAddr, port_a: u16, ip_b: IpAddr, port_b: u16, l4_protocol: u8) -> Self {
        if (ip_a, port_a) <= (ip_b, port_b) {
            Self { lo_ip: ip_a, lo_port: port_a, hi_ip: ip_b, hi_port: port_b, l4_protocol }
        } else {
            Self { lo_ip: ip_b, lo_port: port_b, hi_ip: ip_a, hi_port: port_a, l4_protocol }
        }
    }
}

/// A bidirectional flow (§3 `Flow`). `src_*`/`dst_*` are the endpoints of the
/// first packet seen, which defines "forward" for `fwd_*` counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: u64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: u64,
    pub byte_count: u64,
    pub fwd_packets: u64,
    pub fwd_bytes: u64,
    pub rev_packets: u64,
    pub rev_bytes: u64,
    pub tcp_state: TcpState,
}

struct Entry {
    flow: Flow,
    forward_src: (IpAddr, u16),
}

/// Inactivity eviction thresholds (§9 open question, resolved in
/// SPEC_FULL.md §4.3): 300s for UDP/other, 600s for TCP in `Closed`/`Reset`.
pub const INACTIVITY_TIMEOUT_DEFAULT: Duration = Duration::from_secs(300);
pub const INACTIVITY_TIMEOUT_TCP_CLOSED: Duration = Duration::from_secs(600);

pub struct FlowTracker {
    inner: Mutex<Inner>,
    inactivity_timeout: Duration,
    inactivity_timeout_closed: Duration,
}

struct Inner {
    table: HashMap<CanonicalKey, Entry>,
    next_id: u64,
}

impl FlowTracker {
    pub fn new(inactivity_timeout: Duration, inactivity_timeout_closed: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { table: HashMap::new(), next_id: 1 }),
            inactivity_timeout,
            inactivity_timeout_closed,
        }
    }

    /// §4.3 `track()`. Returns the flow id and whether it was newly created.
    #[allow(clippy::too_many_arguments)]
    pub fn track(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        l4_proto: u8,
        length: u64,
        tcp_flags: TcpFlags,
        now: DateTime<Utc>,
    ) -> (u64, bool) {
        let key = CanonicalKey::new(src_ip, src_port, dst_ip, dst_port, l4_proto);
        let mut inner = self.inner.lock();

        let is_new = !inner.table.contains_key(&key);
        if is_new {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.table.insert(
                key,
                Entry {
                    flow: Flow {
                        id,
                        src_ip,
                        dst_ip,
                        src_port,
                        dst_port,
                        protocol: l4_proto,
                        first_seen: now,
                        last_seen: now,
                        packet_count: 0,
                        byte_count: 0,
                        fwd_packets: 0,
                        fwd_bytes: 0,
                        rev_packets: 0,
                        rev_bytes: 0,
                        tcp_state: TcpState::New,
                    },
                    forward_src: (src_ip, src_port),
                },
            );
        }

        let entry = inner.table.get_mut(&key).expect("just inserted or present");
        entry.flow.packet_count += 1;
        entry.flow.byte_count += length;
        if entry.forward_src == (src_ip, src_port) {
            entry.flow.fwd_packets += 1;
            entry.flow.fwd_bytes += length;
        } else {
            entry.flow.rev_packets += 1;
            entry.flow.rev_bytes += length;
        }
        entry.flow.last_seen = now;

        if l4_proto == crate::decode::ipv4::protocol::TCP {
            advance_tcp_state(&mut entry.flow.tcp_state, tcp_flags);
        }

        (entry.flow.id, is_new)
    }

    /// §4.3 `get_flows()`: stable snapshot ordered by id.
    pub fn get_flows(&self) -> Vec<Flow> {
        let inner = self.inner.lock();
        let mut flows: Vec<Flow> = inner.table.values().map(|e| e.flow.clone()).collect();
        flows.sort_by_key(|f| f.id);
        flows
    }

    /// §4.3 `reset()`: drops all entries and resets the flow-ID counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.table.clear();
        inner.next_id = 1;
    }

    /// Drop flows idle past the inactivity threshold for their state
    /// (SPEC_FULL.md §4.3). Not part of the distilled spec's `reset`/`track`
    /// surface; invoked periodically by the engine's flow broadcaster tick.
    pub fn evict_idle(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.table.retain(|_, entry| {
            let idle = now.signed_duration_since(entry.flow.last_seen);
            let threshold = match entry.flow.tcp_state {
                TcpState::Closed | TcpState::Reset => self.inactivity_timeout_closed,
                _ => self.inactivity_timeout,
            };
            idle < chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
        });
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new(INACTIVITY_TIMEOUT_DEFAULT, INACTIVITY_TIMEOUT_TCP_CLOSED)
    }
}

/// §4.3 TCP state transition table. Unexpected combinations leave the state
/// unchanged — the tracker never rejects a packet.
fn advance_tcp_state(state: &mut TcpState, flags: TcpFlags) {
    if flags.rst {
        *state = TcpState::Reset;
        return;
    }

    *state = match (*state, flags.syn, flags.ack, flags.fin) {
        (TcpState::New, true, false, _) | (TcpState::Closed, true, false, _) => TcpState::SynSent,
        (TcpState::SynSent, true, true, _) => TcpState::SynRecv,
        (TcpState::SynRecv, false, true, _) => TcpState::Established,
        (TcpState::Established, _, _, true) => TcpState::FinWait,
        (TcpState::SynSent, _, _, true) => TcpState::FinWait,
        (TcpState::SynRecv, _, _, true) => TcpState::FinWait,
        (TcpState::FinWait, _, _, true) => TcpState::Closing,
        (TcpState::Closing, false, true, false) => TcpState::Closed,
        (other, ..) => other,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn canonical_key_is_direction_insensitive() {
        let a = CanonicalKey::new(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 2000, 6);
        let b = CanonicalKey::new(ip(10, 0, 0, 2), 2000, ip(10, 0, 0, 1), 1000, 6);
        assert_eq!(a, b);
    }

    #[test]
    fn single_udp_datagram_creates_one_flow() {
        let tracker = FlowTracker::default();
        let now = Utc::now();
        let (id, is_new) = tracker.track(ip(10, 0, 0, 1), ip(10, 0, 0, 2), 53, 40000, 17, 100, TcpFlags::default(), now);
        assert_eq!(id, 1);
        assert!(is_new);

        let flows = tracker.get_flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].fwd_packets, 1);
        assert_eq!(flows[0].rev_packets, 0);
        assert_eq!(flows[0].tcp_state, TcpState::New);
    }

    #[test]
    fn tcp_handshake_reaches_established() {
        let tracker = FlowTracker::default();
        let now = Utc::now();
        let a = ip(10, 0, 0, 1);
        let b = ip(10, 0, 0, 2);

        let syn = TcpFlags { syn: true, ..Default::default() };
        let synack = TcpFlags { syn: true, ack: true, ..Default::default() };
        let ack = TcpFlags { ack: true, ..Default::default() };

        tracker.track(a, b, 5000, 80, 6, 60, syn, now);
        tracker.track(b, a, 80, 5000, 6, 60, synack, now);
        let (id, _) = tracker.track(a, b, 5000, 80, 6, 60, ack, now);

        let flows = tracker.get_flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id, id);
        assert_eq!(flows[0].tcp_state, TcpState::Established);
        assert_eq!(flows[0].fwd_packets, 2);
        assert_eq!(flows[0].rev_packets, 1);
    }

    #[test]
    fn reset_clears_table_and_id_counter() {
        let tracker = FlowTracker::default();
        let now = Utc::now();
        tracker.track(ip(1, 1, 1, 1), ip(2, 2, 2, 2), 1, 2, 17, 10, TcpFlags::default(), now);
        tracker.reset();
        assert!(tracker.get_flows().is_empty());
        let (id, _) = tracker.track(ip(1, 1, 1, 1), ip(2, 2, 2, 2), 1, 2, 17, 10, TcpFlags::default(), now);
        assert_eq!(id, 1);
    }
}
