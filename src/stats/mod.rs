//! Rolling per-protocol packet and byte counters (C5, §4.5).
//!
//! Grounded in the teacher's `aggregator::state::protocol::ProtocolStats`
//! atomics-with-snapshot shape, trimmed to the fields §3's `ProtocolStat`
//! actually asks for — the teacher additionally tracks ethertype/timestamps
//! for its own device-centric classification, which this engine doesn't need
//! since [`crate::decode`] already names the protocol.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Default)]
struct Counter {
    packet_count: AtomicU64,
    byte_count: AtomicI64,
}

/// §3 `ProtocolStat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProtocolStat {
    pub packet_count: u64,
    pub byte_count: i64,
}

pub struct ProtocolStats {
    counters: DashMap<String, Counter>,
}

impl ProtocolStats {
    pub fn new() -> Self {
        Self { counters: DashMap::new() }
    }

    /// §4.5 `record()`.
    pub fn record(&self, protocol: &str, length: i64) {
        let entry = self.counters.entry(protocol.to_string()).or_default();
        entry.packet_count.fetch_add(1, Ordering::Relaxed);
        entry.byte_count.fetch_add(length, Ordering::Relaxed);
    }

    /// §4.5 `snapshot()`: deep copy of the map.
    pub fn snapshot(&self) -> std::collections::HashMap<String, ProtocolStat> {
        self.counters
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    ProtocolStat {
                        packet_count: entry.packet_count.load(Ordering::Relaxed),
                        byte_count: entry.byte_count.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    pub fn reset(&self) {
        self.counters.clear();
    }
}

impl Default for ProtocolStats {
    fn default() -> Self {
        Self::new()
    }
}
