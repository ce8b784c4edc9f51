//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; every failure becomes a JSON
//! body carrying a stable `code` and whether retrying can help.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use previewly_common::Error;
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: Error,
}

impl AppError {
    pub fn new(inner: Error) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Error {
        &self.inner
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let mut body = json!({
            "error": self.inner.to_string(),
            "code": self.inner.code(),
            "retryable": self.inner.is_retryable(),
        });

        // Tell the player where it can still seek and how to go further back.
        if let Error::SeekOutOfWindow { target, window } = &self.inner {
            body["target"] = json!(target);
            body["available_range"] = json!(window);
            body["hint"] = json!("start a new preview with start_index set to the target");
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use previewly_common::IndexRange;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn session_not_found_produces_404() {
        let err = AppError::new(Error::session_not_found("abc"));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_produces_409() {
        let err = AppError::new(Error::conflict("already attached"));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn seek_out_of_window_carries_range() {
        let err = AppError::new(Error::SeekOutOfWindow {
            target: 4,
            window: Some(IndexRange::new(6, 10)),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let body = body_json(response).await;
        assert_eq!(body["code"], "seek_out_of_window");
        assert_eq!(body["retryable"], false);
        assert_eq!(body["target"], 4);
        assert_eq!(body["available_range"]["low"], 6);
        assert_eq!(body["available_range"]["high"], 10);
    }

    #[tokio::test]
    async fn source_failure_reports_retryability() {
        let err = AppError::new(Error::SourceFetch {
            index: 3,
            attempts: 4,
            message: "timed out".to_string(),
            retryable: true,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = body_json(response).await;
        assert_eq!(body["code"], "source_fetch_failed");
        assert_eq!(body["retryable"], true);
    }
}
