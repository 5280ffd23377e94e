use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{FailureReason, JobOptions, JobStatus};
use super::mode::Mode;

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GenerateRequest {
    #[garde(skip)]
    pub mode: Mode,

    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    #[serde(default)]
    #[garde(dive)]
    pub options: GenerateOptions,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct GenerateOptions {
    #[garde(length(min = 1, max = 64))]
    pub style: Option<String>,

    /// `WIDTHxHEIGHT`, e.g. `512x512`.
    #[garde(pattern(r"^[1-9][0-9]{1,4}x[1-9][0-9]{1,4}$"))]
    pub resolution: Option<String>,

    #[garde(range(min = 1, max = 600))]
    pub duration: Option<u32>,
}

impl GenerateRequest {
    /// Field rules plus the cross-field ones garde cannot express.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())?;

        if self.prompt.trim().is_empty() {
            return Err("prompt: must not be blank".to_string());
        }
        if self.mode.requires_duration() && self.options.duration.is_none() {
            return Err(format!("options.duration: required for {} jobs", self.mode));
        }
        if !self.mode.requires_duration() && self.options.duration.is_some() {
            return Err(format!("options.duration: not supported for {} jobs", self.mode));
        }
        Ok(())
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            style: self.options.style.clone(),
            resolution: self.options.resolution.clone(),
            duration: self.options.duration,
        }
    }
}

/// `202 Accepted` body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// Body of `GET /api/jobs/{jobId}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub mode: Mode,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Client-safe explanation for Failed and Rejected jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `DELETE /api/jobs/{jobId}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    /// Echoes the path segment, which need not be a valid id.
    pub job_id: String,
    /// Status after the cancel request; null for unknown jobs.
    pub status: Option<JobStatus>,
}

/// Error body shared by every 4xx/5xx response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}
