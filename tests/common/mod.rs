//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds an [`AppContext`] from a test
//! config, and [`MockOrigin`], a wiremock server that answers HTTP range
//! requests for a deterministic fake video.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use previewly::config::{BufferPolicy, Config, FetchConfig, SessionConfig};
use previewly::server::{create_router, AppContext};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Chunk size used by the test configuration.
pub const CHUNK_SIZE: u64 = 1024;

/// Config with small chunks and fast retries.
pub fn test_config() -> Config {
    Config {
        buffer: BufferPolicy {
            chunk_size_bytes: CHUNK_SIZE,
            chunk_duration_secs: Some(2.0),
            ..BufferPolicy::default()
        },
        fetch: FetchConfig {
            timeout_secs: 2,
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        sessions: SessionConfig {
            max_concurrent: 8,
            ..SessionConfig::default()
        },
        ..Config::default()
    }
}

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            ctx: AppContext::new(config),
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_config(test_config()).await
    }

    /// Start an Axum server with custom config on a random port.
    pub async fn with_server_config(config: Config) -> (Self, SocketAddr) {
        let harness = Self::with_config(config);
        let app = create_router(harness.ctx.clone(), None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.ctx.sessions.shutdown();
    }
}

/// Deterministic fake media: byte `i` is `i % 251`.
pub fn video_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Answers `Range: bytes=a-b` requests from an in-memory body.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    honor_range: bool,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            honor_range: true,
        }
    }

    /// Responds 200 with the whole body, like an origin without range support.
    pub fn ignoring_range(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            honor_range: false,
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let Some((start, end)) = range.filter(|_| self.honor_range) else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.as_slice());
        };

        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", total).as_str());
        }
        let end = end.min(total - 1);
        ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", start, end, total).as_str(),
            )
            .set_body_bytes(&self.body[start as usize..=end as usize])
    }
}

/// Fails the first `failures` requests with 503, then delegates.
pub struct FlakyResponder {
    inner: RangeResponder,
    failures: usize,
    seen: AtomicUsize,
}

impl FlakyResponder {
    pub fn new(inner: RangeResponder, failures: usize) -> Self {
        Self {
            inner,
            failures,
            seen: AtomicUsize::new(0),
        }
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
            return ResponseTemplate::new(503);
        }
        self.inner.respond(request)
    }
}

/// A wiremock origin serving one video at `/video.mp4`.
pub struct MockOrigin {
    pub server: MockServer,
    pub body: Vec<u8>,
}

impl MockOrigin {
    pub async fn start(len: usize) -> Self {
        let body = video_bytes(len);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(RangeResponder::new(body.clone()))
            .mount(&server)
            .await;
        Self { server, body }
    }

    /// Origin whose responses are delayed, keeping fetches in flight.
    pub async fn slow(len: usize, delay: Duration) -> Self {
        let body = video_bytes(len);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(DelayedResponder {
                inner: RangeResponder::new(body.clone()),
                delay,
            })
            .mount(&server)
            .await;
        Self { server, body }
    }

    pub fn url(&self) -> String {
        format!("{}/video.mp4", self.server.uri())
    }
}

struct DelayedResponder {
    inner: RangeResponder,
    delay: Duration,
}

impl Respond for DelayedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.inner.respond(request).set_delay(self.delay)
    }
}

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
