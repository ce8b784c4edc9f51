//! Prefetch hints.
//!
//! A hint is an advisory prefetch distance, in chunks, derived from observed
//! playback or network conditions. The controller clamps it to policy bounds
//! and ignores it once it goes stale.

use parking_lot::RwLock;
use std::time::{Duration, Instant};

/// Advisory prefetch distance with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchHint {
    pub chunks: f64,
    pub observed_at: Instant,
}

impl PrefetchHint {
    pub fn new(chunks: f64) -> Self {
        Self {
            chunks,
            observed_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }
}

/// Something that can be asked for the latest hint.
pub trait HintSource: Send + Sync {
    fn current(&self) -> Option<PrefetchHint>;
}

/// Never has a hint; the controller always uses the default distance.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHint;

impl HintSource for NoHint {
    fn current(&self) -> Option<PrefetchHint> {
        None
    }
}

/// Latest hint pushed by the client.
#[derive(Debug, Default)]
pub struct ReportedHint {
    latest: RwLock<Option<PrefetchHint>>,
}

impl ReportedHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, chunks: f64) {
        *self.latest.write() = Some(PrefetchHint::new(chunks));
    }
}

impl HintSource for ReportedHint {
    fn current(&self) -> Option<PrefetchHint> {
        *self.latest.read()
    }
}
