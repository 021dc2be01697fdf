use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{JobResponse, SubmitResponse};
use crate::models::job::{JobStatus, SubmissionContext};
use crate::routes::ApiError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::validation::ValidationError;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// POST /api/v1/jobs: Upload a produce image for detection.
///
/// The idempotency key comes from the `Idempotency-Key` header, falling back
/// to an `idempotency_key` form field. Without either, the upload is treated
/// as a one-off submission under a fresh key. Optional `user_id` and
/// `metadata` (a JSON object of strings) fields are recorded on the job.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let max = state.orchestrator.settings().max_image_bytes;
    let mut image_data: Option<Vec<u8>> = None;
    let mut form_key: Option<String> = None;
    let mut context = SubmissionContext::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, max))? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                let data = field.bytes().await.map_err(|e| multipart_error(e, max))?;
                image_data = Some(data.to_vec());
            }
            "idempotency_key" => {
                form_key = Some(field.text().await.map_err(|e| multipart_error(e, max))?);
            }
            "user_id" => {
                context.user_id = Some(field.text().await.map_err(|e| multipart_error(e, max))?);
            }
            "metadata" => {
                let raw = field.text().await.map_err(|e| multipart_error(e, max))?;
                context.metadata = serde_json::from_str::<BTreeMap<String, String>>(&raw)
                    .map_err(|e| {
                        OrchestratorError::InvalidInput(ValidationError::InvalidMetadata(
                            e.to_string(),
                        ))
                    })?;
            }
            _ => {}
        }
    }

    let image_data = image_data.ok_or(OrchestratorError::InvalidInput(ValidationError::Empty))?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(form_key)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job = state
        .orchestrator
        .submit_with(&image_data, &idempotency_key, context)
        .await?;

    // Dispatch on every pending answer, not just fresh jobs: a resubmission
    // then repairs a dispatch lost after the ledger write.
    if job.status == JobStatus::Pending {
        state.dispatcher.dispatch(job.id).await.map_err(|e| {
            OrchestratorError::Unavailable(format!("job {} recorded but not dispatched: {e}", job.id))
        })?;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
            message: "Image accepted for processing".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Current state of a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.orchestrator.get_result(job_id).await?;
    Ok(Json(JobResponse::from(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub user_id: Option<String>,
    pub limit: Option<u32>,
}

/// GET /api/v1/jobs?user_id=…&limit=…: A user's most recent jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let user_id = query
        .user_id
        .ok_or(OrchestratorError::InvalidInput(ValidationError::InvalidUserId))?;
    let jobs = state.orchestrator.list_results(&user_id, query.limit).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

/// Body-limit rejections surface as `TooLarge`; the exact size is unknown
/// because the stream was cut off, so the limit is reported as the size.
fn multipart_error(e: axum::extract::multipart::MultipartError, max: usize) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError(OrchestratorError::InvalidInput(ValidationError::TooLarge {
            size: max,
            max,
        }));
    }
    ApiError(OrchestratorError::InvalidInput(ValidationError::Undecodable(
        e.body_text(),
    )))
}
