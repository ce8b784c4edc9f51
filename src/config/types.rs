use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub buffer: BufferPolicy,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS (empty = allow any)
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Optional directory holding a player frontend
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://127.0.0.1:8000".to_string(),
        "http://localhost:8000".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            static_dir: None,
        }
    }
}

/// Per-session buffering policy.
///
/// Fixed when a session is created. The prefetch controller moves the
/// effective prefetch distance inside `[min_prefetch, max_prefetch]`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BufferPolicy {
    /// Maximum number of chunks retained in memory (rewind depth ceiling)
    #[serde(default = "default_max_window_chunks")]
    pub max_window_chunks: usize,

    #[serde(default = "default_min_prefetch")]
    pub min_prefetch: u64,

    /// Prefetch distance used when no fresh hint is available
    #[serde(default = "default_prefetch")]
    pub default_prefetch: u64,

    #[serde(default = "default_max_prefetch")]
    pub max_prefetch: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,

    /// Approximate playback duration of one chunk, used for rewind reporting
    #[serde(default)]
    pub chunk_duration_secs: Option<f64>,

    /// Chunks that must be ready ahead of the head before the first byte is sent
    #[serde(default = "default_start_threshold")]
    pub start_threshold_chunks: u64,

    /// Hints older than this are ignored
    #[serde(default = "default_hint_ttl")]
    pub hint_ttl_secs: u64,

    /// How often an idle prefetcher re-reads the hint
    #[serde(default = "default_hint_poll_interval")]
    pub hint_poll_interval_ms: u64,
}

fn default_max_window_chunks() -> usize {
    5
}
fn default_min_prefetch() -> u64 {
    1
}
fn default_prefetch() -> u64 {
    2
}
fn default_max_prefetch() -> u64 {
    4
}
fn default_chunk_size() -> u64 {
    1024 * 1024
}
fn default_start_threshold() -> u64 {
    1
}
fn default_hint_ttl() -> u64 {
    30
}
fn default_hint_poll_interval() -> u64 {
    500
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_window_chunks: default_max_window_chunks(),
            min_prefetch: default_min_prefetch(),
            default_prefetch: default_prefetch(),
            max_prefetch: default_max_prefetch(),
            chunk_size_bytes: default_chunk_size(),
            chunk_duration_secs: None,
            start_threshold_chunks: default_start_threshold(),
            hint_ttl_secs: default_hint_ttl(),
            hint_poll_interval_ms: default_hint_poll_interval(),
        }
    }
}

impl BufferPolicy {
    /// Check the policy's internal consistency.
    pub fn validate(&self) -> previewly_common::Result<()> {
        use previewly_common::Error;

        if self.max_window_chunks == 0 {
            return Err(Error::validation("max_window_chunks must be at least 1"));
        }
        if self.chunk_size_bytes == 0 {
            return Err(Error::validation("chunk_size_bytes must be positive"));
        }
        if self.min_prefetch > self.max_prefetch {
            return Err(Error::validation(format!(
                "min_prefetch ({}) exceeds max_prefetch ({})",
                self.min_prefetch, self.max_prefetch
            )));
        }
        if self.default_prefetch < self.min_prefetch || self.default_prefetch > self.max_prefetch {
            return Err(Error::validation(format!(
                "default_prefetch ({}) must lie within [{}, {}]",
                self.default_prefetch, self.min_prefetch, self.max_prefetch
            )));
        }
        if self.max_prefetch >= self.max_window_chunks as u64 {
            return Err(Error::validation(format!(
                "max_prefetch ({}) must be smaller than max_window_chunks ({})",
                self.max_prefetch, self.max_window_chunks
            )));
        }
        if self.start_threshold_chunks == 0 || self.start_threshold_chunks > self.min_prefetch + 1
        {
            return Err(Error::validation(format!(
                "start_threshold_chunks must lie within [1, {}]",
                self.min_prefetch + 1
            )));
        }
        if let Some(secs) = self.chunk_duration_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(Error::validation("chunk_duration_secs must be positive"));
            }
        }
        Ok(())
    }

    /// Apply per-request overrides on top of this policy.
    ///
    /// Overrides may shrink the window and the chunk size but never raise them
    /// above this policy, which bounds memory per session. The result is
    /// validated.
    pub fn with_overrides(&self, overrides: &PolicyOverrides) -> previewly_common::Result<Self> {
        use previewly_common::Error;

        if let Some(v) = overrides.max_window_chunks.filter(|v| *v > self.max_window_chunks) {
            return Err(Error::validation(format!(
                "max_window_chunks ({}) exceeds the server limit of {}",
                v, self.max_window_chunks
            )));
        }
        if let Some(v) = overrides.chunk_size_bytes.filter(|v| *v > self.chunk_size_bytes) {
            return Err(Error::validation(format!(
                "chunk_size_bytes ({}) exceeds the server limit of {}",
                v, self.chunk_size_bytes
            )));
        }

        let mut policy = self.clone();
        if let Some(v) = overrides.max_window_chunks {
            policy.max_window_chunks = v;
        }
        if let Some(v) = overrides.min_prefetch {
            policy.min_prefetch = v;
        }
        if let Some(v) = overrides.default_prefetch {
            policy.default_prefetch = v;
        }
        if let Some(v) = overrides.max_prefetch {
            policy.max_prefetch = v;
        }
        if let Some(v) = overrides.chunk_size_bytes {
            policy.chunk_size_bytes = v;
        }
        if let Some(v) = overrides.chunk_duration_secs {
            policy.chunk_duration_secs = Some(v);
        }
        if let Some(v) = overrides.start_threshold_chunks {
            policy.start_threshold_chunks = v;
        }
        policy.validate()?;
        Ok(policy)
    }

    /// How many chunks behind the head can be rewound at most.
    pub fn rewind_limit_chunks(&self) -> u64 {
        self.max_window_chunks.saturating_sub(1) as u64
    }

    /// Rewind limit in seconds, when the chunk duration is known.
    pub fn rewind_limit_secs(&self) -> Option<f64> {
        self.chunk_duration_secs
            .map(|secs| secs * self.rewind_limit_chunks() as f64)
    }

    /// Upper bound on buffered payload for one session.
    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.chunk_size_bytes
            .saturating_mul(self.max_window_chunks as u64)
    }

    pub fn hint_ttl(&self) -> Duration {
        Duration::from_secs(self.hint_ttl_secs)
    }

    pub fn hint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hint_poll_interval_ms.max(1))
    }
}

/// Optional policy hints carried by a start-preview request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub max_window_chunks: Option<usize>,
    #[serde(default)]
    pub min_prefetch: Option<u64>,
    #[serde(default)]
    pub default_prefetch: Option<u64>,
    #[serde(default)]
    pub max_prefetch: Option<u64>,
    #[serde(default)]
    pub chunk_size_bytes: Option<u64>,
    #[serde(default)]
    pub chunk_duration_secs: Option<f64>,
    #[serde(default)]
    pub start_threshold_chunks: Option<u64>,
}

/// Origin fetch behaviour: per-attempt timeout and retry backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt before a fetch is declared failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_fetch_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    200
}
fn default_max_backoff() -> u64 {
    5000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Ceiling on concurrently active preview sessions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Sessions with no activity for this long are destroyed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_max_concurrent() -> usize {
    100
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_cleanup_interval() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}
