//! Sliding window chunk buffer.
//!
//! Holds a contiguous, bounded run of chunks keyed by sequence index. Chunks
//! are admitted strictly at `high + 1` and evicted strictly from `low`, so both
//! watermarks only move forward and an evicted index can never come back.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use previewly_common::{ByteRange, Error, IndexRange, Result};
use std::collections::VecDeque;

/// One immutable unit of media data.
#[derive(Debug, Clone)]
pub struct Chunk {
    index: u64,
    range: ByteRange,
    payload: Bytes,
    fetched_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(index: u64, range: ByteRange, payload: Bytes) -> Self {
        Self {
            index,
            range,
            payload,
            fetched_at: Utc::now(),
        }
    }

    /// Sequence index within the source, zero-based.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte range of the origin resource this chunk covers.
    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Bounded FIFO of chunks with monotonic watermarks.
#[derive(Debug)]
pub struct SlidingWindowBuffer {
    chunks: VecDeque<Chunk>,
    /// Index the next admitted chunk must carry (`high + 1`).
    next_index: u64,
    max_chunks: usize,
    bytes: usize,
}

impl SlidingWindowBuffer {
    /// Create an empty buffer whose first chunk will be index 0.
    pub fn new(max_chunks: usize) -> Self {
        Self::starting_at(0, max_chunks)
    }

    /// Create an empty buffer whose first chunk will be `first_index`.
    pub fn starting_at(first_index: u64, max_chunks: usize) -> Self {
        let max_chunks = max_chunks.max(1);
        Self {
            chunks: VecDeque::new(),
            next_index: first_index,
            max_chunks,
            bytes: 0,
        }
    }

    /// Append a chunk at `high + 1`, evicting from the low end if the window
    /// would exceed its ceiling.
    ///
    /// Returns the number of chunks evicted. On `OutOfOrderChunk` the window is
    /// left untouched.
    pub fn admit(&mut self, chunk: Chunk) -> Result<usize> {
        if chunk.index != self.next_index {
            return Err(Error::OutOfOrderChunk {
                expected: self.next_index,
                actual: chunk.index,
            });
        }

        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        self.next_index += 1;

        let mut evicted = 0;
        while self.chunks.len() > self.max_chunks {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
                evicted += 1;
            }
        }

        Ok(evicted)
    }

    /// Look up a retained chunk.
    pub fn get(&self, index: u64) -> Result<&Chunk> {
        let low = self.low_watermark();
        if index < low {
            return Err(Error::Evicted {
                index,
                low_watermark: low,
            });
        }
        if index >= self.next_index {
            return Err(Error::NotYetAvailable { index });
        }
        // low <= index < next_index, so the offset is within the deque.
        let offset = (index - low) as usize;
        self.chunks
            .get(offset)
            .ok_or_else(|| Error::internal(format!("window lost chunk {}", index)))
    }

    /// `[low, high]` of retained indices, or `None` when nothing is retained.
    pub fn available_range(&self) -> Option<IndexRange> {
        self.high_watermark()
            .map(|high| IndexRange::new(self.low_watermark(), high))
    }

    /// Oldest retained index. When empty, the index the next chunk will get.
    pub fn low_watermark(&self) -> u64 {
        self.next_index - self.chunks.len() as u64
    }

    /// Newest retained index.
    pub fn high_watermark(&self) -> Option<u64> {
        if self.chunks.is_empty() {
            None
        } else {
            Some(self.next_index - 1)
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Whether admitting one more chunk would evict the current low watermark.
    pub fn would_evict(&self) -> bool {
        self.chunks.len() >= self.max_chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Total payload bytes currently retained.
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Evict everything. Watermarks keep their monotonic positions.
    ///
    /// Returns the number of payload bytes released.
    pub fn clear(&mut self) -> usize {
        let released = self.bytes;
        self.chunks.clear();
        self.bytes = 0;
        released
    }
}
