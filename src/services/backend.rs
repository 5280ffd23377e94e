//! Model backends.
//!
//! Each mode routes to one backend implementing [`ModelBackend`]. The
//! registry is a fixed per-mode table built at start-up; nothing is looked
//! up by string at dispatch time.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobOptions;
use crate::models::mode::{Mode, ModeMap};
use crate::services::progress::ProgressReporter;
use crate::services::queue::QueuedJob;

/// What a backend is asked to generate.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub job_id: Uuid,
    pub mode: Mode,
    pub prompt: String,
    pub options: JobOptions,
}

impl From<&QueuedJob> for BackendRequest {
    fn from(job: &QueuedJob) -> Self {
        Self {
            job_id: job.job_id,
            mode: job.mode,
            prompt: job.prompt.clone(),
            options: job.options.clone(),
        }
    }
}

/// Raw generated bytes and the mime type the backend declared, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

/// Capability every model backend provides.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generate content for one request. Dropping the returned future
    /// abandons the call.
    async fn invoke(
        &self,
        request: &BackendRequest,
        progress: &ProgressReporter,
    ) -> Result<BackendOutput, BackendError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend call timed out: {0}")]
    Timeout(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Model rejected the prompt: {0}")]
    InvalidPrompt(String),

    #[error("Backend quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Backend returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("Backend refused the request with status {status}: {message}")]
    Refused { status: u16, message: String },

    #[error("No backend configured for {0} jobs")]
    NotConfigured(Mode),
}

impl BackendError {
    /// Transient faults are worth retrying; everything else fails the job
    /// immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Unavailable(_))
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            408 | 504 => BackendError::Timeout(body),
            500..=599 => BackendError::Unavailable(format!("{status}: {body}")),
            400 | 422 => BackendError::InvalidPrompt(body),
            402 | 429 => BackendError::QuotaExhausted(body),
            code => BackendError::Refused {
                status: code,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_decode() {
            BackendError::InvalidOutput(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// Per-mode backend table.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: ModeMap<Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new(backends: ModeMap<Arc<dyn ModelBackend>>) -> Self {
        Self { backends }
    }

    /// HTTP backends for every mode with a configured endpoint; modes
    /// without one fail their jobs with [`BackendError::NotConfigured`].
    pub fn http(endpoints: &ModeMap<Option<String>>, api_token: Option<String>) -> Self {
        let client = Client::new();
        let backends = ModeMap::from_fn(|mode| -> Arc<dyn ModelBackend> {
            match endpoints.get(mode) {
                Some(endpoint) => Arc::new(HttpModelBackend::new(
                    client.clone(),
                    mode,
                    endpoint.clone(),
                    api_token.clone(),
                )),
                None => Arc::new(UnconfiguredBackend(mode)),
            }
        });
        Self { backends }
    }

    pub fn get(&self, mode: Mode) -> &Arc<dyn ModelBackend> {
        self.backends.get(mode)
    }
}

/// Inference service reached over HTTP.
///
/// Sends `{prompt, mode, style, resolution, duration}` as JSON. A JSON reply
/// carries `{mime, data}` with base64 data; any other content type is the
/// raw output.
pub struct HttpModelBackend {
    http: Client,
    mode: Mode,
    endpoint: String,
    api_token: Option<String>,
    name: String,
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    prompt: &'a str,
    mode: Mode,
    style: Option<&'a str>,
    resolution: Option<&'a str>,
    duration: Option<u32>,
}

#[derive(Deserialize)]
struct EncodedOutput {
    mime: Option<String>,
    data: String,
}

impl HttpModelBackend {
    pub fn new(http: Client, mode: Mode, endpoint: String, api_token: Option<String>) -> Self {
        Self {
            http,
            mode,
            name: format!("http-{mode}"),
            endpoint,
            api_token,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn invoke(
        &self,
        request: &BackendRequest,
        progress: &ProgressReporter,
    ) -> Result<BackendOutput, BackendError> {
        let body = InvokeBody {
            prompt: &request.prompt,
            mode: self.mode,
            style: request.options.style.as_deref(),
            resolution: request.options.resolution.as_deref(),
            duration: request.options.duration,
        };

        progress.report(format!("Submitting {} job to model backend", self.mode));

        let mut call = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            call = call.bearer_auth(token);
        }
        let response = call.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, text));
        }

        progress.report("Receiving generated output");

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase());

        if content_type.as_deref() == Some("application/json") {
            let encoded: EncodedOutput = response.json().await?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.data.as_bytes())
                .map_err(|e| BackendError::InvalidOutput(e.to_string()))?;
            Ok(BackendOutput {
                bytes,
                mime: encoded.mime,
            })
        } else {
            let bytes = response.bytes().await?;
            Ok(BackendOutput {
                bytes: bytes.to_vec(),
                mime: content_type,
            })
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Placeholder for modes without an endpoint.
pub struct UnconfiguredBackend(pub Mode);

#[async_trait]
impl ModelBackend for UnconfiguredBackend {
    async fn invoke(
        &self,
        _request: &BackendRequest,
        _progress: &ProgressReporter,
    ) -> Result<BackendOutput, BackendError> {
        Err(BackendError::NotConfigured(self.0))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}
