//! Append-only raw-frame retention and PCAP export (C6, §4.6).
//!
//! No file in the reference pack writes a PCAP dump (the teacher only ever
//! captures live and republishes to Redis); this module hand-rolls the
//! global/record header layout directly from §6's format description, using
//! `byteorder` for the field-level little-endian writes — the same crate the
//! pack's `asayers-pcarp` reader uses for the inverse direction.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::frame::{Frame, LinkType};

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;

pub struct RawRetention {
    frames: RwLock<Vec<Frame>>,
    link_type: RwLock<LinkType>,
}

impl RawRetention {
    pub fn new() -> Self {
        Self { frames: RwLock::new(Vec::new()), link_type: RwLock::new(LinkType::Ethernet) }
    }

    /// Drops all retained frames and records the session's link type.
    pub fn reset(&self, link_type: LinkType) {
        self.frames.write().clear();
        *self.link_type.write() = link_type;
    }

    pub fn append(&self, frame: Frame) {
        self.frames.write().push(frame);
    }

    pub fn count(&self) -> usize {
        self.frames.read().len()
    }

    /// §4.6 `export_pcap()`: a consistent snapshot is cloned under the lock
    /// so writing the (possibly slow, e.g. network) sink never blocks live
    /// ingest longer than the copy.
    pub fn export_pcap<W: Write>(&self, mut writer: W) -> Result<()> {
        let (frames, link_type) = {
            let frames = self.frames.read();
            if frames.is_empty() {
                return Err(EngineError::NoPackets);
            }
            (frames.clone(), *self.link_type.read())
        };

        write_global_header(&mut writer, link_type)?;
        for frame in &frames {
            write_record(&mut writer, frame)?;
        }
        Ok(())
    }
}

impl Default for RawRetention {
    fn default() -> Self {
        Self::new()
    }
}

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::ReadFailed(e.to_string())
}

fn write_global_header<W: Write>(writer: &mut W, link_type: LinkType) -> Result<()> {
    writer.write_u32::<LittleEndian>(PCAP_MAGIC).map_err(io_err)?;
    writer.write_u16::<LittleEndian>(PCAP_VERSION_MAJOR).map_err(io_err)?;
    writer.write_u16::<LittleEndian>(PCAP_VERSION_MINOR).map_err(io_err)?;
    writer.write_i32::<LittleEndian>(0).map_err(io_err)?; // thiszone
    writer.write_u32::<LittleEndian>(0).map_err(io_err)?; // sigfigs
    writer.write_u32::<LittleEndian>(PCAP_SNAPLEN).map_err(io_err)?;
    writer.write_u32::<LittleEndian>(link_type.to_dlt() as u32).map_err(io_err)?;
    Ok(())
}

fn write_record<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let ts = frame.capture_time;
    let ts_sec = ts.timestamp() as u32;
    let ts_usec = ts.timestamp_subsec_micros();
    let incl_len = frame.data.len() as u32;

    writer.write_u32::<LittleEndian>(ts_sec).map_err(io_err)?;
    writer.write_u32::<LittleEndian>(ts_usec).map_err(io_err)?;
    writer.write_u32::<LittleEndian>(incl_len).map_err(io_err)?;
    writer.write_u32::<LittleEndian>(frame.wire_length).map_err(io_err)?;
    writer.write_all(&frame.data).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn export_fails_when_empty() {
        let retention = RawRetention::new();
        let mut buf = Vec::new();
        assert!(matches!(retention.export_pcap(&mut buf), Err(EngineError::NoPackets)));
    }

    #[test]
    fn export_writes_global_header_and_records() {
        let retention = RawRetention::new();
        retention.reset(LinkType::Ethernet);
        retention.append(Frame::new(vec![1, 2, 3, 4], Utc::now(), 4, LinkType::Ethernet));
        retention.append(Frame::new(vec![5, 6], Utc::now(), 2, LinkType::Ethernet));

        let mut buf = Vec::new();
        retention.export_pcap(&mut buf).unwrap();

        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PCAP_MAGIC);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), PCAP_VERSION_MAJOR);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), PCAP_VERSION_MINOR);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), PCAP_SNAPLEN);
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 1); // DLT_EN10MB

        // first record header starts at byte 24
        let incl_len = u32::from_le_bytes(buf[32..36].try_into().unwrap());
        assert_eq!(incl_len, 4);
        assert_eq!(&buf[40..44], &[1, 2, 3, 4]);
    }

    #[test]
    fn count_tracks_appended_frames() {
        let retention = RawRetention::new();
        assert_eq!(retention.count(), 0);
        retention.append(Frame::new(vec![0], Utc::now(), 1, LinkType::Ethernet));
        assert_eq!(retention.count(), 1);
    }
}
