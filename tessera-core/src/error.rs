//! Domain-specific error types for the compositing engine.
//!
//! All fallible operations return `Result<T, TesseraError>`.
//! Invariant violations surface as typed errors so the caller can drop
//! the affected frame and keep the process running.

use std::time::Duration;
use thiserror::Error;

use crate::types::Buffer;

/// The canonical error type for tessera.
#[derive(Debug, Error)]
pub enum TesseraError {
    // ── Readiness Errors ─────────────────────────────────────────
    /// A `wait_ready` or compositor ready-counter wait hit its deadline.
    #[error("timeout waiting for input frame after {timeout:?}")]
    TimeoutWaitingForInput { timeout: Duration },

    /// `set_version` was asked to move a frame data version backwards.
    #[error("version regression: current {current}, requested {requested}")]
    VersionRegression { current: u64, requested: u64 },

    /// Image data arrived for a version that is already ready.
    #[error("late image for version {version} (ready version {ready})")]
    LateImage { version: u64, ready: u64 },

    // ── Delivery Errors ──────────────────────────────────────────
    /// A destination node could not be reached.
    #[error("destination {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Compression Errors ───────────────────────────────────────
    /// No compressor or decompressor is registered under this name.
    #[error("missing compressor {name:#x} for {buffer:?} buffer")]
    MissingCompressor { name: u32, buffer: Buffer },

    /// A compressor or decompressor failed on otherwise valid input.
    #[error("compression error: {0}")]
    Compression(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the `TSR0` magic.
    #[error("invalid magic bytes: expected TSR0")]
    InvalidMagic,

    /// A field in a packet or image header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The packet payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// Data violated a protocol or pixel-data invariant.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The received data is shorter or longer than expected.
    #[error("invalid packet length: expected {expected}, got {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Composition Errors ───────────────────────────────────────
    /// The requested composition cannot run on this destination.
    #[error("unsupported composition: {0}")]
    UnsupportedComposition(&'static str),

    /// Input images disagree on pixel formats.
    #[error("pixel format mismatch: {0}")]
    FormatMismatch(String),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl TesseraError {
    /// Whether this is the recoverable input-timeout condition.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TesseraError::TimeoutWaitingForInput { .. })
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TesseraError {
    fn from(s: String) -> Self {
        TesseraError::Other(s)
    }
}

impl From<&str> for TesseraError {
    fn from(s: &str) -> Self {
        TesseraError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TesseraError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TesseraError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for TesseraError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TesseraError::Encoding(e.to_string())
    }
}

impl From<tokio::task::JoinError> for TesseraError {
    fn from(e: tokio::task::JoinError) -> Self {
        TesseraError::Other(format!("worker task failed: {e}"))
    }
}
