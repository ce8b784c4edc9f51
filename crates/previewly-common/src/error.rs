//! Error taxonomy for previewly.
//!
//! Every failure a client can observe is a variant of [`Error`]. Each variant
//! maps to an HTTP status, a stable machine-readable code, and a retryability
//! flag so players can tell "try again" apart from "not possible".

use crate::types::IndexRange;

/// Unified error type covering buffer, session and source failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A chunk was offered to the buffer at a position other than `high + 1`.
    #[error("Chunk out of order: expected index {expected}, got {actual}")]
    OutOfOrderChunk {
        /// The only index the buffer would have accepted.
        expected: u64,
        /// The index that was offered.
        actual: u64,
    },

    /// The requested chunk fell behind the window (rewind limit reached).
    #[error("Chunk {index} was evicted; rewind limit reached (oldest retained is {low_watermark})")]
    Evicted { index: u64, low_watermark: u64 },

    /// The requested chunk has not been admitted yet.
    #[error("Chunk {index} is not yet available")]
    NotYetAvailable { index: u64 },

    /// A seek targeted an index outside the retained window.
    #[error("Seek target {target} is outside the retained window {}", describe_window(.window))]
    SeekOutOfWindow {
        target: u64,
        /// The window at the time of the request, if anything was retained.
        window: Option<IndexRange>,
    },

    /// The origin could not deliver a chunk, after local retries.
    #[error("Source fetch failed for chunk {index} after {attempts} attempt(s): {message}")]
    SourceFetch {
        index: u64,
        attempts: u32,
        message: String,
        /// Whether the underlying cause was transient (network, timeout).
        retryable: bool,
    },

    /// No active session with this identifier.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The concurrent session ceiling was reached.
    #[error("Session limit reached ({max} active sessions)")]
    SessionLimit { max: usize },

    /// The request conflicts with the session's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_window(window: &Option<IndexRange>) -> String {
    match window {
        Some(range) => range.to_string(),
        None => "(empty)".to_string(),
    }
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::OutOfOrderChunk { .. } => 500,
            Error::Evicted { .. } => 410,
            Error::NotYetAvailable { .. } => 503,
            Error::SeekOutOfWindow { .. } => 416,
            Error::SourceFetch { .. } => 502,
            Error::SessionNotFound(_) => 404,
            Error::SessionLimit { .. } => 503,
            Error::Conflict(_) => 409,
            Error::Validation(_) => 400,
            Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::OutOfOrderChunk { .. } => "out_of_order_chunk",
            Error::Evicted { .. } => "evicted",
            Error::NotYetAvailable { .. } => "not_yet_available",
            Error::SeekOutOfWindow { .. } => "seek_out_of_window",
            Error::SourceFetch { .. } => "source_fetch_failed",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionLimit { .. } => "session_limit",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotYetAvailable { .. } | Error::SessionLimit { .. } => true,
            Error::SourceFetch { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Convenience constructor for [`Error::SessionNotFound`].
    pub fn session_not_found(id: impl std::fmt::Display) -> Self {
        Error::SessionNotFound(id.to_string())
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Convenience constructor for [`Error::Conflict`].
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    /// Convenience constructor for [`Error::Internal`].
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
