//! Preview session tracking.
//!
//! Owns every active [`PreviewSession`], enforces the concurrency ceiling and
//! one-session-per-client-and-URL, and expires idle sessions in the background.

use dashmap::DashMap;
use parking_lot::Mutex;
use previewly_common::{Error, Result, SessionId};
use std::sync::Arc;
use std::time::Duration;

use super::session::{PreviewSession, SessionInfo};
use super::source::{validate_source_url, HttpSourceFactory, SourceFactory};
use crate::config::{BufferPolicy, Config, PolicyOverrides, SessionConfig};

/// Parameters for a new preview session.
#[derive(Debug, Clone, Default)]
pub struct CreatePreview {
    pub source_url: String,
    /// Stable client identity. A second create for the same client and URL
    /// supersedes the first.
    pub client_id: Option<String>,
    pub start_index: u64,
    pub overrides: PolicyOverrides,
}

impl CreatePreview {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Self::default()
        }
    }
}

/// Thread-safe registry of active preview sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<SessionId, Arc<PreviewSession>>>,
    by_client: Arc<DashMap<(String, String), SessionId>>,
    factory: Arc<dyn SourceFactory>,
    defaults: BufferPolicy,
    max_sessions: usize,
    /// Duration after which an unattached, untouched session is expired.
    idle_timeout: Duration,
    create_lock: Arc<Mutex<()>>,
}

impl SessionManager {
    /// Create a manager that fetches over HTTP with the configured policy.
    pub fn new(config: &Config) -> Self {
        Self::with_factory(
            config.buffer.clone(),
            &config.sessions,
            Arc::new(HttpSourceFactory::new(config.fetch.clone())),
        )
    }

    pub fn with_factory(
        defaults: BufferPolicy,
        sessions: &SessionConfig,
        factory: Arc<dyn SourceFactory>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            by_client: Arc::new(DashMap::new()),
            factory,
            defaults,
            max_sessions: sessions.max_concurrent,
            idle_timeout: Duration::from_secs(sessions.idle_timeout_secs),
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn default_policy(&self) -> &BufferPolicy {
        &self.defaults
    }

    /// Start a new preview session.
    ///
    /// Fails with `Validation` for a bad URL or policy and `SessionLimit` when
    /// the concurrency ceiling is reached.
    pub fn create(&self, request: CreatePreview) -> Result<Arc<PreviewSession>> {
        validate_source_url(&request.source_url)?;
        let policy = self.defaults.with_overrides(&request.overrides)?;

        let _guard = self.create_lock.lock();

        let client_key = request
            .client_id
            .as_ref()
            .map(|client| (client.clone(), request.source_url.clone()));
        if let Some(key) = &client_key {
            if let Some((_, previous)) = self.by_client.remove(key) {
                tracing::info!(
                    session_id = %previous,
                    client_id = %key.0,
                    "Superseding existing preview session"
                );
                self.destroy(&previous);
            }
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(Error::SessionLimit {
                max: self.max_sessions,
            });
        }

        let source = self.factory.open(&request.source_url, &policy)?;
        let id = SessionId::new();
        let max_window_chunks = policy.max_window_chunks;
        let session = PreviewSession::start(
            id,
            request.source_url,
            request.client_id,
            request.start_index,
            policy,
            source,
        );

        self.sessions.insert(id, session.clone());
        if let Some(key) = client_key {
            self.by_client.insert(key, id);
        }

        tracing::info!(
            session_id = %id,
            source_url = %session.source_url(),
            start_index = request.start_index,
            max_window_chunks,
            "Created preview session"
        );

        Ok(session)
    }

    /// Look up a session and mark it active.
    pub fn get(&self, id: &SessionId) -> Result<Arc<PreviewSession>> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::session_not_found(id))?;
        session.touch();
        Ok(session)
    }

    /// End a session, cancelling its fetches and releasing its buffer.
    ///
    /// Unknown ids are ignored. Returns whether a session was removed.
    pub fn destroy(&self, id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            tracing::debug!(session_id = %id, "Destroy of unknown session ignored");
            return false;
        };

        if let Some(client) = session.client_id() {
            let key = (client.to_string(), session.source_url().to_string());
            self.by_client.remove_if(&key, |_, current| current == id);
        }

        let released = session.close();
        let info = session.info();
        tracing::info!(
            session_id = %id,
            released_bytes = released,
            duration_secs = (chrono::Utc::now() - info.created_at).num_seconds(),
            "Destroyed preview session"
        );
        true
    }

    pub fn list_active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Destroy sessions that are closed, or idle with no stream attached.
    ///
    /// Returns the number of sessions removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.is_closed()
                    || (!session.is_attached() && session.idle_for() > self.idle_timeout)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut removed_count = 0;
        for id in expired {
            if self.destroy(&id) {
                tracing::info!(session_id = %id, "Expired session removed");
                removed_count += 1;
            }
        }

        if removed_count > 0 {
            tracing::debug!(removed = removed_count, "Cleaned up expired sessions");
        }

        removed_count
    }

    /// Destroy every session.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let count = ids.iter().filter(|id| self.destroy(id)).count();
        if count > 0 {
            tracing::info!(count, "Closed all preview sessions");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Start a background task that periodically cleans up expired sessions.
pub fn start_cleanup_task(
    manager: SessionManager,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            manager.cleanup_expired_sessions();
        }
    })
}
