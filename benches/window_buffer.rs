//! Benchmarks for the sliding window and the session drain path.
//!
//! Measures admit-with-eviction, retained lookups, and end-to-end delivery of
//! an in-memory source through a session and dispatcher.

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use previewly::config::BufferPolicy;
use previewly::streaming::{
    Chunk, ChunkSource, Dispatcher, FetchError, PreviewSession, SlidingWindowBuffer, SourceChunk,
};
use previewly_common::{ByteRange, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;

fn chunk(index: u64, payload: &Bytes) -> Chunk {
    let size = payload.len() as u64;
    Chunk::new(index, ByteRange::for_chunk(index, size), payload.clone())
}

/// Steady-state admission: every admit past the ceiling evicts the oldest chunk.
fn bench_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_admit");
    let payload = Bytes::from(vec![0u8; 64 * 1024]);

    for window in [5usize, 32, 256] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, &window| {
            b.iter(|| {
                let mut buffer = SlidingWindowBuffer::new(window);
                for index in 0..1_000 {
                    buffer.admit(chunk(index, &payload)).unwrap();
                }
                black_box(buffer.byte_len())
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_get");
    let payload = Bytes::from(vec![0u8; 1024]);

    for window in [5usize, 256] {
        let mut buffer = SlidingWindowBuffer::new(window);
        for index in 0..(window as u64 * 2) {
            buffer.admit(chunk(index, &payload)).unwrap();
        }
        let low = buffer.low_watermark();

        group.bench_with_input(BenchmarkId::new("hit", window), &buffer, |b, buffer| {
            b.iter(|| {
                for index in low..low + window as u64 {
                    black_box(buffer.get(index).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("evicted", window), &buffer, |b, buffer| {
            b.iter(|| black_box(buffer.get(0).is_err()));
        });
    }

    group.finish();
}

struct MemorySource {
    data: Bytes,
    chunk_size: usize,
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn fetch(&self, index: u64) -> Result<Option<SourceChunk>, FetchError> {
        let start = index as usize * self.chunk_size;
        if start >= self.data.len() {
            return Ok(None);
        }
        let end = (start + self.chunk_size).min(self.data.len());
        Ok(Some(SourceChunk {
            range: ByteRange::new(start as u64, end as u64 - 1),
            payload: self.data.slice(start..end),
            last: end == self.data.len(),
        }))
    }
}

/// Whole-session delivery through the dispatcher into a channel sink.
fn bench_drain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("session_drain");
    let chunk_size = 64 * 1024;
    let chunks = 128;
    let data = Bytes::from(vec![7u8; chunk_size * chunks]);

    group.throughput(Throughput::Bytes(data.len() as u64));
    for max_window_chunks in [5usize, 16] {
        let policy = BufferPolicy {
            max_window_chunks,
            max_prefetch: max_window_chunks as u64 - 1,
            chunk_size_bytes: chunk_size as u64,
            ..BufferPolicy::default()
        };

        group.bench_with_input(
            BenchmarkId::from_parameter(max_window_chunks),
            &policy,
            |b, policy| {
                b.to_async(&rt).iter(|| async {
                    let source = Arc::new(MemorySource {
                        data: data.clone(),
                        chunk_size,
                    });
                    let session = PreviewSession::start(
                        SessionId::new(),
                        "memory://bench".to_string(),
                        None,
                        0,
                        policy.clone(),
                        source,
                    );
                    let mut dispatcher = Dispatcher::attach(session).unwrap();
                    let (mut tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
                    let reader = tokio::spawn(async move {
                        let mut total = 0;
                        while let Some(Ok(bytes)) = rx.recv().await {
                            total += bytes.len();
                        }
                        total
                    });
                    let outcome = dispatcher.serve(&mut tx).await.unwrap();
                    drop(tx);
                    black_box((outcome, reader.await.unwrap()))
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_admit, bench_get, bench_drain);
criterion_main!(benches);
