//! Capture source abstraction (C1, §4.1).
//!
//! Both variants are built on the `pcap` crate — the corpus's idiomatic
//! binding to libpcap/npcap (confirmed by `thegwan-retina`'s patched `pcap`
//! dependency and the vendored `pcap` sources in the reference pack), rather
//! than the teacher's `pnet`-based AF_PACKET channel, since only `pcap`
//! offers both live capture *and* PCAP file reading behind one API.

pub mod file;
pub mod live;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::frame::LinkType;

/// One packet as delivered by a capture source, before any parsing.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub raw: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub wire_length: u32,
}

/// Outcome of one blocking read from a [`CaptureSource`]. `Timeout` is not an
/// error — it's the capture device's poll-interval firing with nothing to
/// report, and the caller should simply read again.
pub enum ReadOutcome {
    Packet(PacketRecord),
    Timeout,
    EndOfFile,
    Closed,
    ReadFailed(String),
}

/// A lazy, finite-or-infinite sequence of timestamped raw frames (§4.1).
/// Implementations perform blocking I/O in `read` and are driven from a
/// dedicated OS thread — see `crate::engine`'s ingest loop.
pub trait CaptureSource: Send {
    fn link_type(&self) -> LinkType;
    fn read(&mut self) -> ReadOutcome;
    /// Idempotent; terminates the `read` sequence.
    fn close(&mut self);
}

/// §6 `list_interfaces` interface descriptor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub description: String,
    pub addresses: Vec<String>,
}

/// Passes through to the OS adapter via `pcap::Device::list`. Interface
/// enumeration is nominally an external collaborator (§1), but the engine
/// still needs a working default so the crate is runnable standalone.
pub fn list_interfaces() -> Result<Vec<InterfaceDescriptor>> {
    let devices = pcap::Device::list()
        .map_err(|e| crate::error::EngineError::OpenFailed(e.to_string()))?;

    Ok(devices
        .into_iter()
        .map(|d| InterfaceDescriptor {
            name: d.name,
            description: d.desc.unwrap_or_default(),
            addresses: d.addresses.iter().map(|a| a.addr.to_string()).collect(),
        })
        .collect())
}
