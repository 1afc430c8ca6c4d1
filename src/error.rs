//! Engine-wide error kinds.
//!
//! Mirrors the error surface a caller of [`crate::engine::Engine`] needs to
//! match on. Transient read errors never reach here — the ingest loop logs
//! and swallows them so a flaky capture device can't kill a session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capture session already running")]
    AlreadyRunning,

    #[error("failed to open capture source: {0}")]
    OpenFailed(String),

    #[error("capture read failed: {0}")]
    ReadFailed(String),

    #[error("no packets retained")]
    NoPackets,

    #[error("not found")]
    NotFound,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
