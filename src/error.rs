use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::generation::ErrorResponse;
use crate::services::assets::AssetError;
use crate::services::orchestrator::OrchestratorError;

/// Errors surfaced by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Job not found: {0}")]
    UnknownJob(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = ErrorResponse {
            error: self.to_string(),
            job_id: None,
            retry_after_secs: None,
        };

        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownJob(_) => StatusCode::NOT_FOUND,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::Rejected { job_id, .. } => {
                    body.job_id = Some(*job_id);
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                OrchestratorError::RateLimited { retry_after } => {
                    body.retry_after_secs = Some(retry_after.as_secs().max(1));
                    StatusCode::TOO_MANY_REQUESTS
                }
                OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Asset(e) => match e {
                AssetError::NotFound(_) => StatusCode::NOT_FOUND,
                AssetError::Expired => StatusCode::GONE,
                AssetError::InvalidSignature => StatusCode::FORBIDDEN,
                AssetError::Signing(_) | AssetError::Storage(_) | AssetError::Cipher(_) => {
                    tracing::error!(error = %e, "Asset access failed");
                    body.error = "Asset temporarily unavailable".to_string();
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        };

        let retry_after = body.retry_after_secs;
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (OrchestratorError::Validation("x".into()).into(), StatusCode::BAD_REQUEST),
            (
                OrchestratorError::Rejected {
                    job_id: Uuid::new_v4(),
                    reason: "no".into(),
                }
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (OrchestratorError::NotFound(Uuid::new_v4()).into(), StatusCode::NOT_FOUND),
            (OrchestratorError::Unavailable.into(), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::UnknownJob("not-a-uuid".into()), StatusCode::NOT_FOUND),
            (AssetError::Expired.into(), StatusCode::GONE),
            (AssetError::InvalidSignature.into(), StatusCode::FORBIDDEN),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(OrchestratorError::RateLimited {
            retry_after: Duration::from_millis(2500),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }
}
