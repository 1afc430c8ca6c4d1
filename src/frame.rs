//! The raw frame data model (§3 `Frame`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Link-layer type of a capture session, as reported by libpcap's `DLT_*`
/// constants. Only the values this crate's decoder understands are named;
/// anything else is retained verbatim as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Ethernet,
    Raw,
    Other(i32),
}

impl LinkType {
    /// The `network` field written into a PCAP global header (§6).
    pub fn to_dlt(self) -> i32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::Raw => 101,
            LinkType::Other(v) => v,
        }
    }

    pub fn from_dlt(v: i32) -> Self {
        match v {
            1 => LinkType::Ethernet,
            101 => LinkType::Raw,
            other => LinkType::Other(other),
        }
    }
}

/// One link-layer unit as delivered by the capture source. Immutable once
/// captured; owned by [`crate::retention::RawRetention`] and lent by
/// reference to the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub data: Vec<u8>,
    pub capture_time: DateTime<Utc>,
    pub wire_length: u32,
    pub link_type: LinkType,
}

impl Frame {
    pub fn new(data: Vec<u8>, capture_time: DateTime<Utc>, wire_length: u32, link_type: LinkType) -> Self {
        Self { data, capture_time, wire_length, link_type }
    }
}
