//! A live network packet-analysis engine: captures link-layer frames from an
//! interface or a PCAP file, classifies them through the common Internet
//! protocol stack, maintains a bidirectional flow table with TCP connection
//! state, reassembles TCP byte streams, tracks rolling protocol statistics,
//! retains raw frames for lossless PCAP export, and pushes derived views to
//! any number of subscribed observers in near real time.

pub mod capture;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod flow;
pub mod frame;
pub mod retention;
pub mod stats;
pub mod stream;

pub use config::{CaptureConfig, EngineConfig};
pub use engine::observer::{Event, EventKind, Observer};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use frame::{Frame, LinkType};
