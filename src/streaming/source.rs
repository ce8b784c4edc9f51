//! Chunk source adapters.
//!
//! A [`ChunkSource`] turns a sequence index into the bytes of that chunk. It
//! has no buffering policy of its own; the prefetch controller decides what to
//! pull and when. [`RetrySource`] decorates any source with a per-attempt
//! timeout and exponential backoff for transient failures.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use previewly_common::{ByteRange, Error};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{BufferPolicy, FetchConfig};

/// Connection timeout for origin requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure to fetch one chunk from the origin.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Carries the deadline when it is known. Timeouts raised inside the HTTP
    /// client do not say which of its limits fired.
    #[error("request timed out{}", deadline_suffix(.0))]
    Timeout(Option<Duration>),

    #[error("origin returned HTTP {status}")]
    Status { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid origin response: {0}")]
    InvalidResponse(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Whether the failed request is worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Network(_) => true,
            FetchError::Status { status } => *status >= 500 || *status == 429 || *status == 408,
            FetchError::InvalidResponse(_) => false,
            FetchError::RetryExhausted { last, .. } => last.is_retryable(),
        }
    }

    /// Convert into the session-level error for chunk `index`.
    pub fn into_error(self, index: u64) -> Error {
        let (attempts, retryable) = match &self {
            FetchError::RetryExhausted { attempts, last } => (*attempts, last.is_retryable()),
            other => (1, other.is_retryable()),
        };
        Error::SourceFetch {
            index,
            attempts,
            message: self.to_string(),
            retryable,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(None)
        } else if let Some(status) = e.status() {
            FetchError::Status {
                status: status.as_u16(),
            }
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

fn deadline_suffix(deadline: &Option<Duration>) -> String {
    deadline
        .map(|d| format!(" after {:?}", d))
        .unwrap_or_default()
}

/// Bytes of one chunk as delivered by a source.
#[derive(Debug, Clone)]
pub struct SourceChunk {
    pub range: ByteRange,
    pub payload: Bytes,
    /// No chunk exists after this one.
    pub last: bool,
}

/// Pull-based access to a media resource, one chunk per call.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch chunk `index`. `Ok(None)` means the index lies past the end of
    /// the resource.
    async fn fetch(&self, index: u64) -> Result<Option<SourceChunk>, FetchError>;
}

/// Builds the source for a new session.
pub trait SourceFactory: Send + Sync {
    fn open(&self, source_url: &str, policy: &BufferPolicy) -> previewly_common::Result<Arc<dyn ChunkSource>>;
}

/// Check that a source URL is an absolute http(s) URL.
pub fn validate_source_url(source_url: &str) -> previewly_common::Result<Url> {
    let url = Url::parse(source_url)
        .map_err(|e| Error::validation(format!("Invalid video URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(Error::validation(
                "Invalid video URL - must start with http:// or https://",
            ))
        }
    }
    if url.host_str().is_none() {
        return Err(Error::validation("Invalid video URL - missing host"));
    }
    Ok(url)
}

/// Fetches fixed-size chunks with HTTP range requests.
pub struct HttpRangeSource {
    client: Client,
    url: Url,
    chunk_size: u64,
}

impl HttpRangeSource {
    pub fn new(source_url: &str, chunk_size: u64) -> previewly_common::Result<Self> {
        Self::with_client(build_client(), source_url, chunk_size)
    }

    pub fn with_client(
        client: Client,
        source_url: &str,
        chunk_size: u64,
    ) -> previewly_common::Result<Self> {
        if chunk_size == 0 {
            return Err(Error::validation("chunk size must be positive"));
        }
        Ok(Self {
            client,
            url: validate_source_url(source_url)?,
            chunk_size,
        })
    }
}

fn build_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client with timeout: {}", e);
            Client::new()
        })
}

#[async_trait]
impl ChunkSource for HttpRangeSource {
    async fn fetch(&self, index: u64) -> Result<Option<SourceChunk>, FetchError> {
        let requested = ByteRange::for_chunk(index, self.chunk_size);

        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, requested.to_header_value())
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::RANGE_NOT_SATISFIABLE => return Ok(None),
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                // Origin ignored the Range header. Only acceptable when the whole
                // resource fits in the first chunk.
                if index > 0 {
                    return Err(FetchError::InvalidResponse(
                        "origin stopped honoring byte range requests".to_string(),
                    ));
                }
                if response.content_length().map_or(true, |len| len > self.chunk_size) {
                    return Err(FetchError::InvalidResponse(
                        "origin does not support byte range requests".to_string(),
                    ));
                }
                let payload = read_bounded(response, self.chunk_size).await?;
                if payload.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(SourceChunk {
                    range: ByteRange::new(0, payload.len() as u64 - 1),
                    payload,
                    last: true,
                }));
            }
            other => {
                return Err(FetchError::Status {
                    status: other.as_u16(),
                })
            }
        }

        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        // Reject oversized ranges before reading any of the body.
        if let Some((start, end, _)) = total {
            if start != requested.start || end < start || end - start >= self.chunk_size {
                return Err(FetchError::InvalidResponse(format!(
                    "origin answered bytes {}-{} for {}",
                    start,
                    end,
                    requested.to_header_value()
                )));
            }
        }
        if let Some(len) = response.content_length().filter(|len| *len > self.chunk_size) {
            return Err(FetchError::InvalidResponse(format!(
                "range response of {} bytes exceeds chunk size {}",
                len, self.chunk_size
            )));
        }

        let payload = read_bounded(response, self.chunk_size).await?;
        if payload.is_empty() {
            return Ok(None);
        }

        let range = ByteRange::new(
            requested.start,
            requested.start + payload.len() as u64 - 1,
        );
        let last = (payload.len() as u64) < self.chunk_size
            || total.and_then(|(_, _, total)| total).is_some_and(|t| range.end + 1 >= t);

        Ok(Some(SourceChunk {
            range,
            payload,
            last,
        }))
    }
}

/// Read the response body, failing as soon as it grows past `limit` bytes.
async fn read_bounded(mut response: Response, limit: u64) -> Result<Bytes, FetchError> {
    let mut body = BytesMut::new();
    while let Some(piece) = response.chunk().await? {
        if (body.len() + piece.len()) as u64 > limit {
            return Err(FetchError::InvalidResponse(format!(
                "response body exceeds chunk size {}",
                limit
            )));
        }
        body.extend_from_slice(&piece);
    }
    Ok(body.freeze())
}

/// Parse a `Content-Range` header value.
///
/// Supports `bytes 0-499/1234` and `bytes 0-499/*`.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let value = value.trim().strip_prefix("bytes ")?;
    let (span, total) = value.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

/// Exponential backoff between fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(retry - 1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Timeout and retry decorator for any [`ChunkSource`].
pub struct RetrySource<S> {
    inner: S,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<S: ChunkSource> RetrySource<S> {
    pub fn new(inner: S, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl<S: ChunkSource> ChunkSource for RetrySource<S> {
    async fn fetch(&self, index: u64) -> Result<Option<SourceChunk>, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.inner.fetch(index)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(Some(self.timeout))),
            };

            let error = match result {
                Ok(chunk) => {
                    if attempt > 1 {
                        tracing::debug!(index, attempt, "Chunk fetch recovered after retry");
                    }
                    return Ok(chunk);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt > self.policy.max_retries {
                return Err(FetchError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.delay_for_retry(attempt);
            tracing::warn!(
                index,
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Chunk fetch failed; retrying"
            );
            sleep(delay).await;
        }
    }
}

/// Opens [`HttpRangeSource`]s wrapped in [`RetrySource`].
pub struct HttpSourceFactory {
    client: Client,
    fetch: FetchConfig,
}

impl HttpSourceFactory {
    pub fn new(fetch: FetchConfig) -> Self {
        Self {
            client: build_client(),
            fetch,
        }
    }
}

impl SourceFactory for HttpSourceFactory {
    fn open(
        &self,
        source_url: &str,
        policy: &BufferPolicy,
    ) -> previewly_common::Result<Arc<dyn ChunkSource>> {
        let source =
            HttpRangeSource::with_client(self.client.clone(), source_url, policy.chunk_size_bytes)?;
        Ok(Arc::new(RetrySource::new(
            source,
            RetryPolicy::from(&self.fetch),
            Duration::from_secs(self.fetch.timeout_secs),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Source that replays scripted results, then succeeds.
    struct ScriptedSource {
        script: Mutex<VecDeque<FetchError>>,
        calls: AtomicU32,
        hang: bool,
    }

    impl ScriptedSource {
        fn failing(errors: Vec<FetchError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                calls: AtomicU32::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                hang: true,
            }
        }
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn fetch(&self, index: u64) -> Result<Option<SourceChunk>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(error) = self.script.lock().pop_front() {
                return Err(error);
            }
            Ok(Some(SourceChunk {
                range: ByteRange::for_chunk(index, 4),
                payload: Bytes::from_static(b"data"),
                last: false,
            }))
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::Timeout(Some(Duration::from_secs(1))).is_retryable());
        assert!(FetchError::Timeout(None).is_retryable());
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Status { status: 503 }.is_retryable());
        assert!(FetchError::Status { status: 429 }.is_retryable());
        assert!(!FetchError::Status { status: 404 }.is_retryable());
        assert!(!FetchError::InvalidResponse("bad".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_retries_keep_cause_classification() {
        let transient = FetchError::RetryExhausted {
            attempts: 3,
            last: Box::new(FetchError::Status { status: 503 }),
        };
        assert!(transient.is_retryable());

        let fatal = FetchError::RetryExhausted {
            attempts: 1,
            last: Box::new(FetchError::InvalidResponse("bad".into())),
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_timeout_message_names_known_deadline_only() {
        assert_eq!(
            FetchError::Timeout(Some(Duration::from_secs(10))).to_string(),
            "request timed out after 10s"
        );
        assert_eq!(FetchError::Timeout(None).to_string(), "request timed out");
    }

    #[test]
    fn test_into_error_keeps_cause_retryability() {
        let err = FetchError::RetryExhausted {
            attempts: 4,
            last: Box::new(FetchError::Timeout(Some(Duration::from_secs(10)))),
        }
        .into_error(7);
        assert_matches!(
            err,
            Error::SourceFetch {
                index: 7,
                attempts: 4,
                retryable: true,
                ..
            }
        );

        let err = FetchError::Status { status: 403 }.into_error(2);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy(5);
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-499/1234"),
            Some((0, 499, Some(1234)))
        );
        assert_eq!(parse_content_range("bytes 500-999/*"), Some((500, 999, None)));
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes abc/1"), None);
    }

    #[test]
    fn test_validate_source_url() {
        assert!(validate_source_url("https://example.com/video.mp4").is_ok());
        assert!(validate_source_url("http://127.0.0.1:8080/v.mp4").is_ok());
        assert_matches!(
            validate_source_url("ftp://example.com/video.mp4"),
            Err(Error::Validation(_))
        );
        assert_matches!(validate_source_url("not a url"), Err(Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_within_ceiling() {
        let inner = ScriptedSource::failing(vec![
            FetchError::Status { status: 502 },
            FetchError::Network("connection reset".into()),
        ]);
        let source = RetrySource::new(inner, policy(3), Duration::from_secs(10));

        let chunk = source.fetch(3).await.unwrap().unwrap();
        assert_eq!(chunk.range, ByteRange::for_chunk(3, 4));
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let inner = ScriptedSource::failing(vec![FetchError::Status { status: 500 }; 5]);
        let source = RetrySource::new(inner, policy(2), Duration::from_secs(10));

        let err = source.fetch(0).await.unwrap_err();
        assert_matches!(err, FetchError::RetryExhausted { attempts: 3, .. });
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let inner = ScriptedSource::failing(vec![FetchError::Status { status: 404 }]);
        let source = RetrySource::new(inner, policy(3), Duration::from_secs(10));

        let err = source.fetch(0).await.unwrap_err();
        assert_matches!(err, FetchError::Status { status: 404 });
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable_failure() {
        let source = RetrySource::new(ScriptedSource::hanging(), policy(1), Duration::from_secs(2));

        let err = source.fetch(0).await.unwrap_err();
        assert_matches!(
            err,
            FetchError::RetryExhausted { attempts: 2, ref last }
                if matches!(**last, FetchError::Timeout(Some(d)) if d == Duration::from_secs(2))
        );
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 2);
    }
}
