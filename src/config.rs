//! Engine tunables (§4.4, §4.7, §9) and capture-session request parameters.
//!
//! Unlike the teacher's `Config` (loaded from a TOML file with `figment`/
//! `config`-style merging), these structs are constructed directly by the
//! caller — §1 marks configuration *loading* as an external collaborator,
//! but the engine still needs plain, typed knobs to be constructible at all.

use std::time::Duration;

use crate::flow::{INACTIVITY_TIMEOUT_DEFAULT, INACTIVITY_TIMEOUT_TCP_CLOSED};
use crate::stream::DEFAULT_GAP_THRESHOLD;

/// Parameters for [`crate::engine::Engine::start_capture`] (§4.7, §6).
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub bpf: Option<String>,
    pub snaplen: i32,
}

impl CaptureConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into(), bpf: None, snaplen: 65535 }
    }

    pub fn with_bpf(mut self, filter: impl Into<String>) -> Self {
        self.bpf = Some(filter.into());
        self
    }

    pub fn with_snaplen(mut self, snaplen: i32) -> Self {
        self.snaplen = snaplen;
        self
    }
}

/// Engine-wide tunables that aren't part of a single capture request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// §4.4: gaps older than this are finalized and the stream advances past them.
    pub stream_gap_threshold: Duration,
    /// §4.3/§9: inactivity eviction for flows not in a TCP closed state.
    pub flow_inactivity_timeout: Duration,
    /// §4.3/§9: inactivity eviction for flows in `Closed`/`Reset`.
    pub flow_inactivity_timeout_closed: Duration,
    /// §4.7: `load_pcap` yields every this-many packets to avoid flooding observers.
    pub pcap_replay_batch: u64,
    /// §1/§9: bounded queue depth per registered observer. An observer
    /// lagging past this many undelivered events has further events dropped
    /// for it rather than stalling the packet ingest path.
    pub observer_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_gap_threshold: DEFAULT_GAP_THRESHOLD,
            flow_inactivity_timeout: INACTIVITY_TIMEOUT_DEFAULT,
            flow_inactivity_timeout_closed: INACTIVITY_TIMEOUT_TCP_CLOSED,
            pcap_replay_batch: 200,
            observer_queue_depth: 256,
        }
    }
}
