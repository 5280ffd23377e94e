//! Worker Dispatcher.
//!
//! Runs one job against its mode's backend under a hard wall-clock deadline,
//! retrying transient faults with exponential backoff, then inspects and
//! stores the output through the asset gateway. Worker pools pull from the
//! queue and report every outcome back to the orchestrator by message.

use std::sync::Arc;
use std::time::Duration;

use scraper::{Html, Selector};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::asset::StoredAsset;
use crate::models::job::FailureReason;
use crate::models::mode::{Mode, ModeMap};
use crate::services::assets::AssetStoreGateway;
use crate::services::backend::{BackendError, BackendOutput, BackendRegistry, BackendRequest};
use crate::services::orchestrator::OrchestratorHandle;
use crate::services::progress::ProgressReporter;
use crate::services::queue::{JobQueue, QueuedJob};
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub retry: RetryPolicy,
    /// Hard deadline for a whole run, retries included.
    pub timeouts: ModeMap<Duration>,
}

/// Final result of one dispatch, reported to the orchestrator.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Succeeded(StoredAsset),
    Failed {
        reason: FailureReason,
        detail: String,
    },
    Cancelled,
}

impl DispatchOutcome {
    fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        DispatchOutcome::Failed {
            reason,
            detail: detail.into(),
        }
    }
}

pub struct WorkerDispatcher {
    backends: BackendRegistry,
    assets: Arc<AssetStoreGateway>,
    settings: DispatcherSettings,
}

impl WorkerDispatcher {
    pub fn new(
        backends: BackendRegistry,
        assets: Arc<AssetStoreGateway>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            backends,
            assets,
            settings,
        }
    }

    /// Execute one job to completion, failure, timeout or cancellation.
    pub async fn run(
        &self,
        job: &QueuedJob,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let deadline = *self.settings.timeouts.get(job.mode);
        let start = Instant::now();

        // The deadline bounds backend work only; storing is never interrupted.
        let produced = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job.job_id, "Dispatch abandoned after cancellation");
                Err(DispatchOutcome::Cancelled)
            }
            result = tokio::time::timeout(deadline, self.produce(job, progress)) => match result {
                Ok(produced) => produced,
                Err(_) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        mode = %job.mode,
                        timeout_ms = deadline.as_millis() as u64,
                        "Job exceeded its mode timeout"
                    );
                    Err(DispatchOutcome::failed(
                        FailureReason::Timeout,
                        format!("exceeded {}ms deadline", deadline.as_millis()),
                    ))
                }
            }
        };

        let outcome = match produced {
            Ok((bytes, mime)) => self.store(job, bytes, &mime).await,
            Err(outcome) => outcome,
        };
        progress.flush();

        metrics::histogram!("generation_dispatch_seconds", "mode" => job.mode.to_string())
            .record(start.elapsed().as_secs_f64());
        outcome
    }

    /// Backend call plus output inspection; everything bound by the deadline.
    async fn produce(
        &self,
        job: &QueuedJob,
        progress: &ProgressReporter,
    ) -> Result<(Vec<u8>, String), DispatchOutcome> {
        let output = self.invoke_with_retry(job, progress).await.map_err(|e| {
            tracing::error!(job_id = %job.job_id, mode = %job.mode, error = %e, "Backend failed");
            DispatchOutcome::failed(FailureReason::BackendError, e.to_string())
        })?;

        inspect_output(job.mode, output, progress).map_err(|e| {
            tracing::error!(job_id = %job.job_id, error = %e, "Backend output rejected");
            DispatchOutcome::failed(FailureReason::BackendError, e.to_string())
        })
    }

    async fn store(&self, job: &QueuedJob, bytes: Vec<u8>, mime: &str) -> DispatchOutcome {
        match self.assets.store(bytes, mime).await {
            Ok(asset) => DispatchOutcome::Succeeded(asset),
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to store generated asset");
                DispatchOutcome::failed(FailureReason::BackendError, format!("asset storage: {e}"))
            }
        }
    }

    async fn invoke_with_retry(
        &self,
        job: &QueuedJob,
        progress: &ProgressReporter,
    ) -> Result<BackendOutput, BackendError> {
        let backend = self.backends.get(job.mode);
        let request = BackendRequest::from(job);
        let policy = self.settings.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match backend.invoke(&request, progress).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() => match policy.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            backend = backend.name(),
                            attempt,
                            max_attempts = policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient backend error, retrying"
                        );
                        metrics::counter!("generation_backend_retries_total", "mode" => job.mode.to_string())
                            .increment(1);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Validate backend output for its mode and settle the mime type.
fn inspect_output(
    mode: Mode,
    output: BackendOutput,
    progress: &ProgressReporter,
) -> Result<(Vec<u8>, String), BackendError> {
    if output.bytes.is_empty() {
        return Err(BackendError::InvalidOutput("empty output".to_string()));
    }

    match mode {
        Mode::Image => {
            let format = image::guess_format(&output.bytes)
                .map_err(|e| BackendError::InvalidOutput(format!("not an image: {e}")))?;
            let mime = format.to_mime_type().to_string();
            Ok((output.bytes, mime))
        }
        Mode::Web => {
            let html = std::str::from_utf8(&output.bytes)
                .map_err(|_| BackendError::InvalidOutput("page is not UTF-8".to_string()))?;
            let title = page_title(html)?;
            if let Some(title) = title {
                progress.report(format!("Rendered page \"{title}\""));
            }
            Ok((output.bytes, "text/html".to_string()))
        }
        Mode::Video | Mode::Audio => {
            let mime = output
                .mime
                .filter(|mime| mime.starts_with(mode.as_ref()))
                .unwrap_or_else(|| mode.default_mime().to_string());
            Ok((output.bytes, mime))
        }
    }
}

/// A generated page must contain at least one element in its body.
fn page_title(html: &str) -> Result<Option<String>, BackendError> {
    let document = Html::parse_document(html);
    let body_content = Selector::parse("body *")
        .map_err(|e| BackendError::InvalidOutput(format!("selector: {e}")))?;
    if document.select(&body_content).next().is_none() {
        return Err(BackendError::InvalidOutput("page has no content".to_string()));
    }

    let title = Selector::parse("title")
        .map_err(|e| BackendError::InvalidOutput(format!("selector: {e}")))?;
    Ok(document
        .select(&title)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty()))
}

/// Spawn `pools[mode]` workers per mode. Workers exit when the queue closes
/// or the orchestrator goes away.
pub fn spawn_workers(
    dispatcher: Arc<WorkerDispatcher>,
    queue: Arc<JobQueue>,
    orchestrator: OrchestratorHandle,
    pools: &ModeMap<usize>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for (mode, size) in pools.iter() {
        for worker in 0..*size {
            let dispatcher = dispatcher.clone();
            let queue = queue.clone();
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(mode, worker, dispatcher, queue, orchestrator).await;
            }));
        }
        tracing::info!(mode = %mode, workers = size, "Started worker pool");
    }
    handles
}

async fn worker_loop(
    mode: Mode,
    worker: usize,
    dispatcher: Arc<WorkerDispatcher>,
    queue: Arc<JobQueue>,
    orchestrator: OrchestratorHandle,
) {
    while let Some(job) = queue.next(mode).await {
        metrics::gauge!("generation_queue_depth", "mode" => mode.to_string())
            .set(queue.depth(mode) as f64);

        let lease = match orchestrator.begin(job.job_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::debug!(job_id = %job.job_id, "Skipping job that is no longer queued");
                continue;
            }
            Err(_) => break,
        };

        tracing::info!(job_id = %job.job_id, mode = %mode, worker, "Dispatching job");
        let outcome = dispatcher.run(&job, &lease.progress, &lease.cancel).await;

        if orchestrator.finish(job.job_id, outcome).await.is_err() {
            break;
        }
    }
    tracing::debug!(mode = %mode, worker, "Worker stopped");
}
