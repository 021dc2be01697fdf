use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::models::api::ErrorBody;
use crate::services::orchestrator::OrchestratorError;
use crate::services::validation::ValidationError;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Multipart framing allowance on top of the image size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// API routes (jobs + health). `/metrics` is mounted separately by the server.
pub fn router(state: AppState) -> Router {
    let body_limit = state.orchestrator.settings().max_image_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/jobs",
            post(jobs::submit_job)
                .layer(DefaultBodyLimit::max(body_limit))
                .get(jobs::list_jobs),
        )
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job))
        .with_state(state)
}

/// HTTP rendering of orchestrator failures.
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            OrchestratorError::InvalidInput(ValidationError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "invalid_input")
            }
            OrchestratorError::InvalidInput(ValidationError::UnsupportedFormat(_)) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid_input")
            }
            OrchestratorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            OrchestratorError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            OrchestratorError::NotReady { .. } => (StatusCode::CONFLICT, "not_ready"),
            OrchestratorError::Unavailable(_) => {
                tracing::error!(error = %self.0, "Backing service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
        };

        let body = ErrorBody {
            error: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
