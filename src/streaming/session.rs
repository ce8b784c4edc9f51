//! One active preview: window, playback head, and prefetch task.
//!
//! The producer (prefetch task) and the consumer (dispatcher) share a single
//! [`Window`] behind one lock. Every change is announced on a `watch` channel
//! so either side can sleep until the other makes progress.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use previewly_common::{Error, IndexRange, Result, SessionId, SessionState};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::buffer::SlidingWindowBuffer;
use super::hint::ReportedHint;
use super::prefetch::{run_prefetch, PrefetchController};
use super::source::ChunkSource;
use crate::config::BufferPolicy;

/// Mutable per-session state. Only touched under [`SessionShared::window`].
#[derive(Debug)]
pub(crate) struct Window {
    pub(crate) buffer: SlidingWindowBuffer,
    pub(crate) head: u64,
    pub(crate) state: SessionState,
    /// First index past the end of the source, once known.
    pub(crate) source_end: Option<u64>,
    pub(crate) failure: Option<Error>,
    /// Bumped on every successful seek.
    pub(crate) seek_generation: u64,
    pub(crate) prefetch_distance: u64,
}

impl Window {
    fn new(start_index: u64, policy: &BufferPolicy) -> Self {
        Self {
            buffer: SlidingWindowBuffer::starting_at(start_index, policy.max_window_chunks),
            head: start_index,
            state: SessionState::Initializing,
            source_end: None,
            failure: None,
            seek_generation: 0,
            prefetch_distance: policy.default_prefetch,
        }
    }

    /// Move to `Error`, keeping the first failure.
    pub(crate) fn fail(&mut self, error: Error) {
        if !self.state.is_terminal() {
            self.state = SessionState::Error;
            self.failure = Some(error);
        }
    }

    /// The head has reached the end of the source.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.source_end.is_some_and(|end| self.head >= end)
    }

    /// Retained chunks at or ahead of the head.
    pub(crate) fn ready_ahead(&self) -> u64 {
        match self.buffer.high_watermark() {
            Some(high) if high >= self.head => high - self.head + 1,
            _ => 0,
        }
    }
}

pub(crate) struct SessionShared {
    pub(crate) window: Mutex<Window>,
    changed: watch::Sender<u64>,
}

impl SessionShared {
    fn new(window: Window) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            window: Mutex::new(window),
            changed,
        }
    }

    /// Wake everything waiting on this session.
    pub(crate) fn notify(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

/// Point-in-time view of a session, as reported by the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub source_url: String,
    pub client_id: Option<String>,
    pub state: SessionState,
    pub head: u64,
    pub available_range: Option<IndexRange>,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub prefetch_distance: u64,
    pub source_end: Option<u64>,
    pub rewind_limit_chunks: u64,
    pub rewind_limit_secs: Option<f64>,
    pub attached: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// An active preview of one source URL for one client.
pub struct PreviewSession {
    id: SessionId,
    source_url: String,
    client_id: Option<String>,
    policy: BufferPolicy,
    shared: Arc<SessionShared>,
    hints: Arc<ReportedHint>,
    cancel: CancellationToken,
    prefetch: Mutex<Option<JoinHandle<()>>>,
    attached: AtomicBool,
    created_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl PreviewSession {
    /// Create a session whose head starts at `start_index` and spawn its
    /// prefetch task. Must be called inside a Tokio runtime.
    pub fn start(
        id: SessionId,
        source_url: String,
        client_id: Option<String>,
        start_index: u64,
        policy: BufferPolicy,
        source: Arc<dyn ChunkSource>,
    ) -> Arc<Self> {
        let shared = Arc::new(SessionShared::new(Window::new(start_index, &policy)));
        let hints = Arc::new(ReportedHint::new());
        let cancel = CancellationToken::new();
        let now = Utc::now();

        let session = Arc::new(Self {
            id,
            source_url,
            client_id,
            policy,
            shared: shared.clone(),
            hints: hints.clone(),
            cancel: cancel.clone(),
            prefetch: Mutex::new(None),
            attached: AtomicBool::new(false),
            created_at: now,
            last_seen: Mutex::new(now),
        });

        shared.window.lock().state = SessionState::Buffering;

        let controller = PrefetchController::new(&session.policy, hints);
        let handle = tokio::spawn(run_prefetch(
            id,
            shared,
            controller,
            source,
            cancel,
            session.policy.hint_poll_interval(),
        ));
        *session.prefetch.lock() = Some(handle);

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.shared.window.lock().state
    }

    pub fn head(&self) -> u64 {
        self.shared.window.lock().head
    }

    pub fn available_range(&self) -> Option<IndexRange> {
        self.shared.window.lock().buffer.available_range()
    }

    /// The error that moved the session to `Error`, if any.
    pub fn failure(&self) -> Option<Error> {
        self.shared.window.lock().failure.clone()
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move the playback head to `target`.
    ///
    /// Succeeds only when `target` is retained; the next chunk delivered is
    /// then exactly `target`. On failure the session state is unchanged.
    pub fn seek(&self, target: u64) -> Result<u64> {
        {
            let mut window = self.shared.window.lock();
            if window.state.is_terminal() {
                return Err(Error::conflict(format!(
                    "cannot seek a session in state {}",
                    window.state
                )));
            }

            let prior = window.state;
            window.state = SessionState::Seeking;

            let range = window.buffer.available_range();
            match range {
                Some(range) if range.contains(target) => {
                    window.head = target;
                    window.seek_generation += 1;
                    window.state = match prior {
                        SessionState::Buffering | SessionState::Initializing => {
                            SessionState::Buffering
                        }
                        _ => SessionState::Streaming,
                    };
                }
                _ => {
                    window.state = prior;
                    tracing::debug!(
                        session_id = %self.id,
                        target,
                        window = ?range,
                        "Seek outside retained window"
                    );
                    return Err(Error::SeekOutOfWindow {
                        target,
                        window: range,
                    });
                }
            }
        }

        self.shared.notify();
        self.touch();
        tracing::debug!(session_id = %self.id, target, "Seek");
        Ok(target)
    }

    /// Record a prefetch suggestion, in chunks, from the client.
    pub fn report_hint(&self, chunks: f64) -> Result<()> {
        if !chunks.is_finite() {
            return Err(Error::validation("prefetch hint must be a finite number"));
        }
        self.hints.report(chunks);
        self.shared.notify();
        self.touch();
        Ok(())
    }

    pub fn info(&self) -> SessionInfo {
        let window = self.shared.window.lock();
        SessionInfo {
            id: self.id,
            source_url: self.source_url.clone(),
            client_id: self.client_id.clone(),
            state: window.state,
            head: window.head,
            available_range: window.buffer.available_range(),
            buffered_chunks: window.buffer.len(),
            buffered_bytes: window.buffer.byte_len(),
            prefetch_distance: window.prefetch_distance,
            source_end: window.source_end,
            rewind_limit_chunks: self.policy.rewind_limit_chunks(),
            rewind_limit_secs: self.policy.rewind_limit_secs(),
            attached: self.attached.load(Ordering::Acquire),
            error: window.failure.as_ref().map(|e| e.to_string()),
            created_at: self.created_at,
            last_seen: *self.last_seen.lock(),
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - *self.last_seen.lock())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Claim the single output stream. Returns false if one is attached.
    pub(crate) fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Cancel in-flight fetches and release buffered memory.
    ///
    /// Idempotent. Returns the number of payload bytes released.
    pub fn close(&self) -> usize {
        self.cancel.cancel();
        if let Some(handle) = self.prefetch.lock().take() {
            handle.abort();
        }

        let released = {
            let mut window = self.shared.window.lock();
            if !window.state.is_terminal() {
                window.state = SessionState::Ended;
            }
            window.buffer.clear()
        };
        self.shared.notify();

        if released > 0 {
            tracing::debug!(session_id = %self.id, released, "Released session buffer");
        }
        released
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for PreviewSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, head) = {
            let window = self.shared.window.lock();
            (window.state, window.head)
        };
        f.debug_struct("PreviewSession")
            .field("id", &self.id)
            .field("source_url", &self.source_url)
            .field("client_id", &self.client_id)
            .field("state", &state)
            .field("head", &head)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
