//! Streaming dispatcher.
//!
//! Drains a session's window to one consumer in strict index order. The head
//! advances only after the sink accepts a chunk, so a slow consumer simply
//! stalls the drain and, through the window ceiling, the producer.

use async_trait::async_trait;
use bytes::Bytes;
use previewly_common::{Error, Result, SessionState};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::buffer::Chunk;
use super::session::PreviewSession;

/// Destination for drained chunks.
#[async_trait]
pub trait ChunkSink: Send {
    /// Deliver one chunk. Returning means the consumer accepted it.
    async fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()>;

    /// Resolves when the consumer has gone away.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Feeds an HTTP body stream.
#[async_trait]
impl ChunkSink for mpsc::Sender<std::result::Result<Bytes, io::Error>> {
    async fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.send(Ok(chunk.payload().clone()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

/// Writes chunks to any async writer, flushing after each one.
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for WriterSink<W> {
    async fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.writer.write_all(chunk.payload()).await?;
        self.writer.flush().await
    }
}

/// How a call to [`Dispatcher::serve`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Every chunk up to the end of the source was delivered.
    Ended { delivered: u64 },
    /// The session was closed from elsewhere.
    Cancelled { delivered: u64 },
    /// The consumer stopped accepting data.
    Disconnected { delivered: u64 },
    /// The requested number of chunks was delivered.
    LimitReached { delivered: u64 },
}

impl ServeOutcome {
    pub fn delivered(&self) -> u64 {
        match *self {
            ServeOutcome::Ended { delivered }
            | ServeOutcome::Cancelled { delivered }
            | ServeOutcome::Disconnected { delivered }
            | ServeOutcome::LimitReached { delivered } => delivered,
        }
    }
}

enum Next {
    Send(Chunk, u64),
    Wait,
    End,
}

/// The single consumer attached to a session.
///
/// Dropping the dispatcher closes the session: pending fetches are cancelled
/// and the buffer is released on every exit path.
pub struct Dispatcher {
    session: Arc<PreviewSession>,
}

impl Dispatcher {
    /// Attach to `session`. Fails with `Conflict` if another consumer is
    /// already attached.
    pub fn attach(session: Arc<PreviewSession>) -> Result<Self> {
        if session.is_closed() {
            return Err(Error::session_not_found(session.id()));
        }
        if !session.try_attach() {
            return Err(Error::conflict(format!(
                "a stream is already attached to session {}",
                session.id()
            )));
        }
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<PreviewSession> {
        &self.session
    }

    /// Drain to `sink` until the source ends, the session closes, or the
    /// consumer disconnects.
    pub async fn serve<S>(&mut self, sink: &mut S) -> Result<ServeOutcome>
    where
        S: ChunkSink + ?Sized,
    {
        self.drain(sink, None).await
    }

    /// Like [`serve`](Self::serve), but returns after `max_chunks` deliveries.
    pub async fn serve_up_to<S>(&mut self, sink: &mut S, max_chunks: u64) -> Result<ServeOutcome>
    where
        S: ChunkSink + ?Sized,
    {
        self.drain(sink, Some(max_chunks)).await
    }

    pub fn seek(&self, target: u64) -> Result<u64> {
        self.session.seek(target)
    }

    /// Tear down the session now. Returns the number of bytes released.
    pub fn close(self) -> usize {
        self.session.close()
    }

    async fn drain<S>(&mut self, sink: &mut S, limit: Option<u64>) -> Result<ServeOutcome>
    where
        S: ChunkSink + ?Sized,
    {
        let session_id = self.session.id();
        let shared = self.session.shared().clone();
        let cancel = self.session.cancellation().clone();
        let start_threshold = self.session.policy().start_threshold_chunks;
        let mut changes = shared.subscribe();
        let mut delivered = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(ServeOutcome::Cancelled { delivered });
            }
            if limit.is_some_and(|max| delivered >= max) {
                return Ok(ServeOutcome::LimitReached { delivered });
            }
            changes.borrow_and_update();

            let next = {
                let mut window = shared.window.lock();
                if window.state == SessionState::Error {
                    let error = window
                        .failure
                        .clone()
                        .unwrap_or_else(|| Error::internal("session failed"));
                    return Err(error);
                }

                if window.is_exhausted() {
                    window.state = SessionState::Ended;
                    Next::End
                } else if window.state == SessionState::Buffering
                    && window.ready_ahead() < start_threshold
                    && window.source_end.is_none()
                {
                    Next::Wait
                } else {
                    match window.buffer.get(window.head) {
                        Ok(chunk) => Next::Send(chunk.clone(), window.seek_generation),
                        Err(Error::NotYetAvailable { .. }) => Next::Wait,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, "Playback head lost: {}", e);
                            window.fail(e.clone());
                            return Err(e);
                        }
                    }
                }
            };

            let (chunk, generation) = match next {
                Next::End => {
                    shared.notify();
                    tracing::info!(session_id = %session_id, delivered, "Preview ended");
                    return Ok(ServeOutcome::Ended { delivered });
                }
                Next::Wait => {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => return Ok(ServeOutcome::Cancelled { delivered }),
                        _ = sink.closed() => return Ok(ServeOutcome::Disconnected { delivered }),
                        changed = changes.changed() => {
                            if changed.is_err() {
                                return Ok(ServeOutcome::Cancelled { delivered });
                            }
                        }
                    }
                    continue;
                }
                Next::Send(chunk, generation) => (chunk, generation),
            };

            let index = chunk.index();
            let written = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(ServeOutcome::Cancelled { delivered }),
                result = sink.write_chunk(&chunk) => result,
            };
            drop(chunk);

            if let Err(e) = written {
                tracing::debug!(session_id = %session_id, index, "Consumer went away: {}", e);
                return Ok(ServeOutcome::Disconnected { delivered });
            }
            delivered += 1;

            {
                let mut window = shared.window.lock();
                // A seek during the write already moved the head.
                if window.seek_generation == generation && window.head == index {
                    window.head = index + 1;
                }
                if window.state == SessionState::Buffering {
                    window.state = SessionState::Streaming;
                }
            }
            shared.notify();
            self.session.touch();
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("session", &self.session.id())
            .finish()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.session.close();
        self.session.detach();
    }
}
