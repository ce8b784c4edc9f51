//! Prefetch controller.
//!
//! Keeps the window filled `prefetch_distance` chunks ahead of the playback
//! head. The distance comes from an external hint clamped to policy bounds.

use previewly_common::SessionId;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::buffer::Chunk;
use super::hint::{HintSource, PrefetchHint};
use super::session::{SessionShared, Window};
use super::source::{ChunkSource, FetchError, SourceChunk};
use crate::config::BufferPolicy;

/// Decides how far ahead of the head to fill and which indices to fetch.
pub struct PrefetchController {
    min_prefetch: u64,
    default_prefetch: u64,
    max_prefetch: u64,
    hint_ttl: Duration,
    hints: Arc<dyn HintSource>,
}

impl PrefetchController {
    pub fn new(policy: &BufferPolicy, hints: Arc<dyn HintSource>) -> Self {
        Self {
            min_prefetch: policy.min_prefetch,
            default_prefetch: policy.default_prefetch,
            max_prefetch: policy.max_prefetch,
            hint_ttl: policy.hint_ttl(),
            hints,
        }
    }

    /// Prefetch distance for `hint`, always within `[min_prefetch, max_prefetch]`.
    ///
    /// Missing, stale, or non-finite hints fall back to the default distance.
    pub fn prefetch_distance(&self, hint: Option<PrefetchHint>) -> u64 {
        let fallback = self
            .default_prefetch
            .clamp(self.min_prefetch, self.max_prefetch);

        let Some(hint) = hint else {
            return fallback;
        };
        if !hint.chunks.is_finite() || hint.age() > self.hint_ttl {
            return fallback;
        }

        let suggested = if hint.chunks <= 0.0 {
            0
        } else {
            hint.chunks.ceil().min(u64::MAX as f64) as u64
        };
        suggested.clamp(self.min_prefetch, self.max_prefetch)
    }

    /// Latest hint from the attached hint source.
    pub fn current_hint(&self) -> Option<PrefetchHint> {
        self.hints.current()
    }

    /// Indices missing between the retained high watermark and the fill target
    /// `head + prefetch_distance(hint)`, in ascending order.
    pub fn tick(
        &self,
        current_head: u64,
        available_high: Option<u64>,
        hint: Option<PrefetchHint>,
    ) -> Range<u64> {
        let target = current_head.saturating_add(self.prefetch_distance(hint));
        let first_missing = match available_high {
            Some(high) if high >= current_head => high + 1,
            _ => current_head,
        };
        if first_missing > target {
            return first_missing..first_missing;
        }
        first_missing..target + 1
    }
}

enum Step {
    Fetch(u64),
    Wait,
    Done,
}

/// Producer loop for one session. Runs until the source is exhausted, the
/// session fails, or `cancel` fires.
pub(crate) async fn run_prefetch(
    session_id: SessionId,
    shared: Arc<SessionShared>,
    controller: PrefetchController,
    source: Arc<dyn ChunkSource>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut changes = shared.subscribe();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        changes.borrow_and_update();

        let hint = controller.current_hint();
        let distance = controller.prefetch_distance(hint);

        let step = {
            let mut window = shared.window.lock();
            window.prefetch_distance = distance;

            if window.state.is_terminal() || window.source_end.is_some() {
                Step::Done
            } else if window.buffer.would_evict() && window.buffer.low_watermark() >= window.head {
                // Every retained chunk is still undelivered.
                Step::Wait
            } else {
                let missing =
                    controller.tick(window.head, window.buffer.high_watermark(), hint);
                if missing.is_empty() {
                    Step::Wait
                } else {
                    Step::Fetch(missing.start.max(window.buffer.next_index()))
                }
            }
        };

        let index = match step {
            Step::Done => break,
            Step::Wait => {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }
            Step::Fetch(index) => index,
        };

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(session_id = %session_id, index, "Fetch cancelled");
                break;
            }
            result = source.fetch(index) => result,
        };

        {
            let mut window = shared.window.lock();
            if cancel.is_cancelled() || window.state.is_terminal() {
                break;
            }
            apply_fetch(&session_id, &mut window, index, distance, result);
        }
        shared.notify();
    }

    tracing::debug!(session_id = %session_id, "Prefetch stopped");
}

fn apply_fetch(
    session_id: &SessionId,
    window: &mut Window,
    index: u64,
    distance: u64,
    result: Result<Option<SourceChunk>, FetchError>,
) {
    match result {
        Ok(Some(fetched)) => {
            let last = fetched.last;
            let chunk = Chunk::new(index, fetched.range, fetched.payload);
            match window.buffer.admit(chunk) {
                Ok(evicted) => {
                    tracing::debug!(
                        session_id = %session_id,
                        index,
                        evicted,
                        distance,
                        "Admitted chunk"
                    );
                    if last {
                        window.source_end = Some(index + 1);
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, "Window invariant violated: {}", e);
                    window.fail(e);
                }
            }
        }
        Ok(None) => {
            tracing::debug!(session_id = %session_id, index, "Source exhausted");
            window.source_end = Some(index);
        }
        Err(e) => {
            let error = e.into_error(index);
            tracing::error!(session_id = %session_id, "Prefetch failed: {}", error);
            window.fail(error);
        }
    }
}
