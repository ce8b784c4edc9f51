//! Core type definitions shared by the buffer, the dispatcher and the API.
//!
//! Enums serialize in lowercase so they can be surfaced to players verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a preview session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session object exists but nothing has been requested from the origin yet.
    Initializing,
    /// Filling ahead of the playback head before the first chunk is sent.
    Buffering,
    /// Chunks are being delivered to the client.
    Streaming,
    /// A seek request is being applied to the playback head.
    Seeking,
    /// The source is exhausted and every chunk up to the end was delivered.
    Ended,
    /// A fatal failure occurred; the session will be torn down.
    Error,
}

impl SessionState {
    /// Whether no further transitions can happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Buffering => write!(f, "buffering"),
            Self::Streaming => write!(f, "streaming"),
            Self::Seeking => write!(f, "seeking"),
            Self::Ended => write!(f, "ended"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Inclusive range of chunk sequence indices, e.g. the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    /// Lowest index in the range (the low watermark).
    pub low: u64,
    /// Highest index in the range (the high watermark).
    pub high: u64,
}

impl IndexRange {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high);
        Self { low, high }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.low <= index && index <= self.high
    }

    /// Number of indices covered.
    pub fn count(&self) -> u64 {
        self.high - self.low + 1
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

/// Inclusive byte range of the origin resource covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Byte range of chunk `index` for fixed-size chunking.
    pub fn for_chunk(index: u64, chunk_size: u64) -> Self {
        let start = index.saturating_mul(chunk_size);
        Self {
            start,
            end: start.saturating_add(chunk_size.saturating_sub(1)),
        }
    }

    /// Number of bytes covered.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for an HTTP `Range` request header.
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
