//! Preview streaming core.
//!
//! A preview session keeps a bounded, rewindable window of a remote video in
//! memory and drains it to one client.
//!
//! - [`SlidingWindowBuffer`]: contiguous chunks with monotonic watermarks
//! - [`PrefetchController`]: fills ahead of the playback head, driven by hints
//! - [`Dispatcher`]: drains the window to a [`ChunkSink`], handles seeks
//! - [`SessionManager`]: creates, supersedes, expires and destroys sessions
//! - [`ChunkSource`]: where chunks come from ([`HttpRangeSource`] over HTTP)

mod buffer;
mod dispatcher;
mod hint;
mod prefetch;
mod session;
mod sessions;
mod source;

pub use buffer::{Chunk, SlidingWindowBuffer};
pub use dispatcher::{ChunkSink, Dispatcher, ServeOutcome, WriterSink};
pub use hint::{HintSource, NoHint, PrefetchHint, ReportedHint};
pub use prefetch::PrefetchController;
pub use session::{PreviewSession, SessionInfo};
pub use sessions::{start_cleanup_task, CreatePreview, SessionManager};
pub use source::{
    validate_source_url, ChunkSource, FetchError, HttpRangeSource, HttpSourceFactory,
    RetryPolicy, RetrySource, SourceChunk, SourceFactory,
};
