use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::generation::{
    CancelResponse, GenerateRequest, JobStatusResponse, SubmitResponse,
};
use crate::models::job::{FailureReason, JobStatus};

const USER_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

/// POST /api/generate: Submit a generation job.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_USER);

    let job_id = state.orchestrator.submit(request, user).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /api/jobs/{job_id}: Poll job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = Uuid::parse_str(&raw_id).map_err(|_| ApiError::UnknownJob(raw_id.clone()))?;
    let view = state.orchestrator.get_status(job_id).await?;
    let job = view.job;

    // Internal failure detail stays in logs; clients get a generic message.
    let error = match job.status() {
        JobStatus::Rejected => job.rejection_reason().map(str::to_string),
        JobStatus::Failed => job.failure().map(|failure| match failure.reason {
            FailureReason::Cancelled => "Job was cancelled".to_string(),
            FailureReason::Timeout => "Generation timed out".to_string(),
            FailureReason::BackendError => "Generation failed".to_string(),
        }),
        _ => None,
    };

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        mode: job.mode,
        status: job.status(),
        progress: job.progress_message.clone(),
        url: view.asset.as_ref().map(|asset| asset.url.clone()),
        mime: view.asset.as_ref().map(|asset| asset.mime.clone()),
        reason: job.failure().map(|failure| failure.reason),
        error,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }))
}

/// DELETE /api/jobs/{job_id}: Cancel a job. Idempotent; always 200 while
/// the service is up. Ids that do not parse are unknown jobs.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let status = match Uuid::parse_str(&raw_id) {
        Ok(job_id) => state.orchestrator.cancel(job_id).await?,
        Err(_) => None,
    };
    Ok(Json(CancelResponse {
        job_id: raw_id,
        status,
    }))
}
