//! Live capture over a named interface, via `pcap::Capture<Active>`.

use chrono::DateTime;
use tracing::warn;

use super::{CaptureSource, PacketRecord, ReadOutcome};
use crate::error::{EngineError, Result};
use crate::frame::LinkType;

pub struct LiveCapture {
    cap: pcap::Capture<pcap::Active>,
    link_type: LinkType,
    closed: bool,
}

impl LiveCapture {
    /// Opens `interface` with the given BPF filter (libpcap syntax, passed
    /// through unvalidated per §6) and snaplen. Promiscuous mode is enabled
    /// and reads time out every 100ms so the owning thread can observe
    /// `close()` promptly, matching the teacher's `af_packet.rs` pattern.
    pub fn open(interface: &str, bpf: Option<&str>, snaplen: i32) -> Result<Self> {
        let inactive = pcap::Capture::from_device(interface)
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?;

        let mut cap = inactive
            .promisc(true)
            .snaplen(snaplen)
            .timeout(100)
            .open()
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?;

        if let Some(filter) = bpf {
            cap.filter(filter, true).map_err(|e| EngineError::OpenFailed(e.to_string()))?;
        }

        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        Ok(Self { cap, link_type, closed: false })
    }
}

impl CaptureSource for LiveCapture {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read(&mut self) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = DateTime::from_timestamp(
                    packet.header.ts.tv_sec as i64,
                    (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                )
                .unwrap_or_else(chrono::Utc::now);
                ReadOutcome::Packet(PacketRecord {
                    raw: packet.data.to_vec(),
                    timestamp: ts,
                    wire_length: packet.header.len,
                })
            }
            Err(pcap::Error::TimeoutExpired) => ReadOutcome::Timeout,
            Err(e) => {
                warn!("live capture read failed: {}", e);
                ReadOutcome::ReadFailed(e.to_string())
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
