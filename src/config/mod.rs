use serde::Deserialize;
use std::time::Duration;

use crate::models::mode::ModeMap;
use crate::services::dispatcher::DispatcherSettings;
use crate::services::orchestrator::OrchestratorSettings;
use crate::services::queue::RateLimit;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Origin used when building signed asset URLs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// PostgreSQL connection string for the job archive. Archive is off when unset.
    pub database_url: Option<String>,

    /// HMAC secret for signed asset URLs
    pub signing_secret: String,

    /// AES-256-GCM key for assets at rest (base64-encoded, 32 bytes)
    pub encryption_key: String,

    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,

    /// How long finished jobs stay queryable before purge
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Per-user admissions allowed per rate limit window
    #[serde(default = "default_rate_limit_max_jobs")]
    pub rate_limit_max_jobs: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_image_workers")]
    pub image_workers: usize,
    #[serde(default = "default_video_workers")]
    pub video_workers: usize,
    #[serde(default = "default_audio_workers")]
    pub audio_workers: usize,
    #[serde(default = "default_web_workers")]
    pub web_workers: usize,

    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,
    #[serde(default = "default_video_timeout_secs")]
    pub video_timeout_secs: u64,
    #[serde(default = "default_audio_timeout_secs")]
    pub audio_timeout_secs: u64,
    #[serde(default = "default_web_timeout_secs")]
    pub web_timeout_secs: u64,

    /// Attempts per job including the first call
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Minimum spacing of progress updates per job
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Model inference endpoints, one per mode
    pub image_backend_url: Option<String>,
    pub video_backend_url: Option<String>,
    pub audio_backend_url: Option<String>,
    pub web_backend_url: Option<String>,

    /// Bearer token sent to every model backend
    pub model_api_token: Option<String>,

    /// R2 bucket settings. Assets are kept in memory unless all four are set.
    pub r2_bucket: Option<String>,
    pub r2_endpoint: Option<String>,
    pub r2_access_key: Option<String>,
    pub r2_secret_key: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    900
}

fn default_job_retention_secs() -> u64 {
    3600
}

fn default_purge_interval_secs() -> u64 {
    60
}

fn default_rate_limit_max_jobs() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_image_workers() -> usize {
    4
}

fn default_video_workers() -> usize {
    1
}

fn default_audio_workers() -> usize {
    2
}

fn default_web_workers() -> usize {
    2
}

fn default_image_timeout_secs() -> u64 {
    60
}

fn default_video_timeout_secs() -> u64 {
    600
}

fn default_audio_timeout_secs() -> u64 {
    180
}

fn default_web_timeout_secs() -> u64 {
    120
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

/// R2 credentials, present only when fully configured.
pub struct R2Settings<'a> {
    pub bucket: &'a str,
    pub endpoint: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            max_jobs: self.rate_limit_max_jobs,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    pub fn worker_pools(&self) -> ModeMap<usize> {
        ModeMap::new(
            self.image_workers,
            self.video_workers,
            self.audio_workers,
            self.web_workers,
        )
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                multiplier: self.retry_multiplier,
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            timeouts: ModeMap::new(
                Duration::from_secs(self.image_timeout_secs),
                Duration::from_secs(self.video_timeout_secs),
                Duration::from_secs(self.audio_timeout_secs),
                Duration::from_secs(self.web_timeout_secs),
            ),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retention: Duration::from_secs(self.job_retention_secs),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            signed_url_ttl: self.signed_url_ttl(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    pub fn backend_endpoints(&self) -> ModeMap<Option<String>> {
        ModeMap::new(
            self.image_backend_url.clone(),
            self.video_backend_url.clone(),
            self.audio_backend_url.clone(),
            self.web_backend_url.clone(),
        )
    }

    pub fn r2(&self) -> Option<R2Settings<'_>> {
        Some(R2Settings {
            bucket: self.r2_bucket.as_deref()?,
            endpoint: self.r2_endpoint.as_deref()?,
            access_key: self.r2_access_key.as_deref()?,
            secret_key: self.r2_secret_key.as_deref()?,
        })
    }
}
