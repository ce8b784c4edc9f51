//! Preview API routes.
//!
//! Start a preview, stream it, seek within the retained window, report
//! prefetch hints, and end it. The legacy `/start-preview` and `/end-preview`
//! endpoints accept the same payloads as the browser prototype.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use previewly_common::{Error, IndexRange, SessionId, SessionState};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::AppError;
use super::AppContext;
use crate::config::PolicyOverrides;
use crate::streaming::{CreatePreview, Dispatcher, PreviewSession, SessionInfo};

/// Response header carrying the session id on stream responses.
pub const SESSION_HEADER: &str = "x-preview-session";

/// Create preview routes, nested under `/api`.
pub fn preview_routes() -> Router<AppContext> {
    Router::new()
        .route("/previews", post(start_preview).get(list_previews))
        .route(
            "/previews/:session_id",
            get(get_preview).delete(end_preview),
        )
        .route("/previews/:session_id/stream", get(stream_preview))
        .route("/previews/:session_id/seek", post(seek_preview))
        .route("/previews/:session_id/hint", post(report_hint))
}

/// Root-level routes kept for the original browser prototype.
pub fn legacy_routes() -> Router<AppContext> {
    Router::new()
        .route("/start-preview", post(start_preview))
        .route("/end-preview", post(end_preview_legacy))
        .route("/debug/sessions", get(list_previews))
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartPreviewRequest {
    #[serde(alias = "source_url")]
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub start_index: u64,
    #[serde(default)]
    pub policy: PolicyOverrides,
}

#[derive(Debug, Serialize)]
pub struct StartPreviewResponse {
    pub preview_id: SessionId,
    pub stream_url: String,
    pub status_url: String,
    pub state: SessionState,
    pub start_index: u64,
    pub chunk_size_bytes: u64,
    pub chunk_duration_secs: Option<f64>,
    pub rewind_limit_chunks: u64,
    pub rewind_limit_secs: Option<f64>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub total_sessions: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub index: u64,
}

#[derive(Debug, Serialize)]
pub struct SeekResponse {
    pub head: u64,
    pub available_range: Option<IndexRange>,
}

#[derive(Debug, Deserialize)]
pub struct HintRequest {
    /// Suggested prefetch distance in chunks.
    pub chunks: f64,
}

#[derive(Debug, Deserialize)]
pub struct EndPreviewRequest {
    pub preview_id: String,
}

#[derive(Debug, Serialize)]
pub struct EndPreviewResponse {
    pub status: &'static str,
    pub destroyed: bool,
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
    raw.parse::<SessionId>().map_err(AppError::from)
}

fn rewind_message(session: &PreviewSession) -> String {
    let policy = session.policy();
    match policy.rewind_limit_secs() {
        Some(secs) => format!(
            "Preview started. You can rewind up to {:.0} seconds ({} chunks).",
            secs,
            policy.rewind_limit_chunks()
        ),
        None => format!(
            "Preview started. You can rewind up to {} chunks.",
            policy.rewind_limit_chunks()
        ),
    }
}

async fn start_preview(
    State(ctx): State<AppContext>,
    Json(request): Json<StartPreviewRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.url.trim().is_empty() {
        return Err(Error::validation("Missing 'url' parameter in request body").into());
    }

    let session = ctx.sessions.create(CreatePreview {
        source_url: request.url,
        client_id: request.client_id,
        start_index: request.start_index,
        overrides: request.policy,
    })?;

    let id = session.id();
    let policy = session.policy();
    let response = StartPreviewResponse {
        preview_id: id,
        stream_url: format!("/api/previews/{}/stream", id),
        status_url: format!("/api/previews/{}", id),
        state: session.state(),
        start_index: request.start_index,
        chunk_size_bytes: policy.chunk_size_bytes,
        chunk_duration_secs: policy.chunk_duration_secs,
        rewind_limit_chunks: policy.rewind_limit_chunks(),
        rewind_limit_secs: policy.rewind_limit_secs(),
        message: rewind_message(&session),
    };

    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_previews(State(ctx): State<AppContext>) -> Json<SessionListResponse> {
    let sessions = ctx.sessions.list_active_sessions();
    Json(SessionListResponse {
        total_sessions: sessions.len(),
        sessions,
    })
}

async fn get_preview(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, AppError> {
    let id = parse_session_id(&session_id)?;
    let session = ctx.sessions.get(&id)?;
    Ok(Json(session.info()))
}

async fn end_preview(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Json<EndPreviewResponse>, AppError> {
    let id = parse_session_id(&session_id)?;
    Ok(Json(destroy(&ctx, &id)))
}

async fn end_preview_legacy(
    State(ctx): State<AppContext>,
    Json(request): Json<EndPreviewRequest>,
) -> Result<Json<EndPreviewResponse>, AppError> {
    let id = parse_session_id(&request.preview_id)?;
    Ok(Json(destroy(&ctx, &id)))
}

fn destroy(ctx: &AppContext, id: &SessionId) -> EndPreviewResponse {
    let destroyed = ctx.sessions.destroy(id);
    EndPreviewResponse {
        status: "success",
        destroyed,
        message: if destroyed {
            format!("Preview {} ended and cleaned up", id)
        } else {
            format!("Preview {} was not active", id)
        },
    }
}

async fn seek_preview(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
    Json(request): Json<SeekRequest>,
) -> Result<Json<SeekResponse>, AppError> {
    let id = parse_session_id(&session_id)?;
    let session = ctx.sessions.get(&id)?;
    let head = session.seek(request.index)?;
    Ok(Json(SeekResponse {
        head,
        available_range: session.available_range(),
    }))
}

async fn report_hint(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
    Json(request): Json<HintRequest>,
) -> Result<StatusCode, AppError> {
    let id = parse_session_id(&session_id)?;
    let session = ctx.sessions.get(&id)?;
    session.report_hint(request.chunks)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream the session's chunks as one chunked `application/octet-stream` body.
///
/// The session is destroyed when the stream ends or the client goes away.
async fn stream_preview(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_session_id(&session_id)?;
    let session = ctx.sessions.get(&id)?;
    let mut dispatcher = Dispatcher::attach(session)?;

    let (mut tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
    let sessions = ctx.sessions.clone();
    tokio::spawn(async move {
        match dispatcher.serve(&mut tx).await {
            Ok(outcome) => {
                tracing::info!(session_id = %id, ?outcome, "Stream finished");
            }
            Err(e) => {
                tracing::warn!(session_id = %id, "Stream failed: {}", e);
                // Abort the body so the player sees a failed transfer.
                let _ = tx
                    .send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())))
                    .await;
            }
        }
        drop(dispatcher);
        sessions.destroy(&id);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .header(SESSION_HEADER, id.to_string())
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| AppError::from(Error::internal(e.to_string())))
}
