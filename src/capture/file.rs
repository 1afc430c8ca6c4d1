//! PCAP file capture, via `pcap::Capture<Offline>`.

use std::path::Path;

use chrono::DateTime;
use tracing::warn;

use super::{CaptureSource, PacketRecord, ReadOutcome};
use crate::error::{EngineError, Result};
use crate::frame::LinkType;

pub struct FileCapture {
    cap: pcap::Capture<pcap::Offline>,
    link_type: LinkType,
    closed: bool,
}

impl FileCapture {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let cap = pcap::Capture::from_file(path.as_ref())
            .map_err(|e| EngineError::OpenFailed(e.to_string()))?;
        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        Ok(Self { cap, link_type, closed: false })
    }
}

impl CaptureSource for FileCapture {
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
            Err(pcap::Error::NoMorePackets) => ReadOutcome::EndOfFile,
            Err(e) => {
                warn!("pcap file read failed: {}", e);
                ReadOutcome::ReadFailed(e.to_string())
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
