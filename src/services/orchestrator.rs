//! Generation Orchestrator.
//!
//! The job table is owned by a single task. Handlers, workers and the purge
//! timer talk to it through [`OrchestratorHandle`], so a cancellation and a
//! worker's result can never race on the same record: whichever message
//! arrives first wins and the job is terminal for the other.
//!
//! Lifecycle: the table starts empty; on shutdown (or when every handle is
//! dropped) the queue is closed, outstanding jobs are failed as cancelled and
//! every record is flushed to the archive when one is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::JobArchive;
use crate::models::asset::StoredAsset;
use crate::models::generation::GenerateRequest;
use crate::models::job::{FailureReason, Job, JobStatus};
use crate::services::assets::AssetStoreGateway;
use crate::services::dispatcher::DispatchOutcome;
use crate::services::moderation::{ModerationFilter, ModerationVerdict};
use crate::services::progress::ProgressReporter;
use crate::services::queue::{JobQueue, QueueError, QueuedJob};

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long terminal jobs stay queryable before being purged.
    pub retention: Duration,
    pub purge_interval: Duration,
    pub signed_url_ttl: Duration,
    /// Minimum spacing between progress updates from one job.
    pub progress_interval: Duration,
}

/// What a worker receives when it is allowed to run a job.
pub struct Lease {
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

/// A job snapshot plus, for succeeded jobs, its asset with a fresh URL.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    pub asset: Option<StoredAsset>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{reason}")]
    Rejected { job_id: Uuid, reason: String },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Generation service is unavailable")]
    Unavailable,
}

enum Command {
    Admit {
        job: Job,
        user: String,
        reply: oneshot::Sender<Result<Uuid, QueueError>>,
    },
    RecordRejected {
        job: Job,
        user: String,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Begin {
        job_id: Uuid,
        reply: oneshot::Sender<Option<Lease>>,
    },
    Progress {
        job_id: Uuid,
        message: String,
    },
    Finish {
        job_id: Uuid,
        outcome: DispatchOutcome,
    },
    Status {
        job_id: Uuid,
        reply: oneshot::Sender<Option<Job>>,
    },
    Cancel {
        job_id: Uuid,
        reply: oneshot::Sender<Option<JobStatus>>,
    },
    Purge {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable front door to the orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    moderation: ModerationFilter,
    assets: Arc<AssetStoreGateway>,
    archive: Option<JobArchive>,
    signed_url_ttl: Duration,
}

impl OrchestratorHandle {
    /// Validate, moderate and admit a request. Returns as soon as the job is
    /// queued; no backend work happens here.
    pub async fn submit(
        &self,
        request: GenerateRequest,
        user: &str,
    ) -> Result<Uuid, OrchestratorError> {
        request.check().map_err(OrchestratorError::Validation)?;

        let mut job = Job::new(request.mode, request.prompt.clone(), request.job_options());

        if let ModerationVerdict::Reject { reason, .. } =
            self.moderation.check(&request.prompt, request.mode)
        {
            let job_id = job.id;
            job.reject(reason.clone())
                .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
            metrics::counter!("generation_jobs_rejected_total", "mode" => request.mode.to_string())
                .increment(1);

            let (reply, rx) = oneshot::channel();
            self.send(Command::RecordRejected {
                job,
                user: user.to_string(),
                reply,
            })
            .await?;
            return match rx.await.map_err(|_| OrchestratorError::Unavailable)? {
                Ok(()) => Err(OrchestratorError::Rejected { job_id, reason }),
                Err(e) => Err(admission_error(e, user)),
            };
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Admit {
            job,
            user: user.to_string(),
            reply,
        })
        .await?;

        rx.await
            .map_err(|_| OrchestratorError::Unavailable)?
            .map_err(|e| admission_error(e, user))
    }

    /// Current state of a job. Jobs already purged from memory are looked up
    /// in the archive when one is configured.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobView, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { job_id, reply }).await?;
        let live = rx.await.map_err(|_| OrchestratorError::Unavailable)?;

        let job = match live {
            Some(job) => job,
            None => return self.archived_status(job_id).await,
        };

        let asset = match job.result_ref() {
            Some(asset_id) => match self.assets.describe(asset_id, self.signed_url_ttl).await {
                Ok(asset) => Some(asset),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, asset_id = %asset_id, error = %e, "Asset for succeeded job is unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(JobView { job, asset })
    }

    /// Cancel a queued or running job. Terminal and unknown jobs are left
    /// alone; the returned status is the job's status after the request.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Option<JobStatus>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { job_id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    /// Claim a dequeued job for execution. `None` means it must be skipped.
    pub async fn begin(&self, job_id: Uuid) -> Result<Option<Lease>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Begin { job_id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    pub async fn finish(
        &self,
        job_id: Uuid,
        outcome: DispatchOutcome,
    ) -> Result<(), OrchestratorError> {
        self.send(Command::Finish { job_id, outcome }).await
    }

    /// Purge terminal jobs past their retention now; returns how many went.
    pub async fn purge_expired(&self) -> Result<usize, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Purge { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    /// Close the queue, settle outstanding jobs and flush the archive.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| OrchestratorError::Unavailable)
    }

    async fn archived_status(&self, job_id: Uuid) -> Result<JobView, OrchestratorError> {
        let Some(archive) = &self.archive else {
            return Err(OrchestratorError::NotFound(job_id));
        };
        match archive.load(job_id).await {
            Ok(Some(job)) => Ok(JobView { job, asset: None }),
            Ok(None) => Err(OrchestratorError::NotFound(job_id)),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Archive lookup failed");
                Err(OrchestratorError::NotFound(job_id))
            }
        }
    }
}

fn admission_error(error: QueueError, user: &str) -> OrchestratorError {
    match error {
        QueueError::RateLimited { retry_after } => {
            tracing::info!(user = %user, retry_after_ms = retry_after.as_millis() as u64, "Submission rate limited");
            OrchestratorError::RateLimited { retry_after }
        }
        QueueError::Closed => OrchestratorError::Unavailable,
    }
}

struct Entry {
    job: Job,
    cancel: CancellationToken,
}

/// The single writer of the job table.
pub struct Orchestrator {
    jobs: HashMap<Uuid, Entry>,
    queue: Arc<JobQueue>,
    assets: Arc<AssetStoreGateway>,
    archive: Option<JobArchive>,
    settings: OrchestratorSettings,
    self_tx: mpsc::WeakSender<Command>,
}

impl Orchestrator {
    /// Spawn the orchestrator task with an empty job table.
    pub fn start(
        queue: Arc<JobQueue>,
        assets: Arc<AssetStoreGateway>,
        archive: Option<JobArchive>,
        settings: OrchestratorSettings,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let orchestrator = Orchestrator {
            jobs: HashMap::new(),
            queue,
            assets: assets.clone(),
            archive: archive.clone(),
            settings: settings.clone(),
            self_tx: tx.downgrade(),
        };
        let task = tokio::spawn(orchestrator.run(rx));

        let handle = OrchestratorHandle {
            tx,
            moderation: ModerationFilter::new(),
            assets,
            archive,
            signed_url_ttl: settings.signed_url_ttl,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let period = self.settings.purge_interval.max(Duration::from_millis(10));
        let mut purge = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Orchestrator started");
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                _ = purge.tick() => {
                    self.purge_expired();
                }
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { job, user, reply } => {
                let _ = reply.send(self.admit(job, user));
            }
            Command::RecordRejected { job, user, reply } => {
                // Rejections count against the same per-user admission window.
                if let Err(e) = self.queue.charge(&user) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let _ = reply.send(Ok(()));
                tracing::info!(job_id = %job.id, mode = %job.mode, "Recorded rejected job");
                self.persist(&job);
                self.jobs.insert(
                    job.id,
                    Entry {
                        job,
                        cancel: CancellationToken::new(),
                    },
                );
            }
            Command::Begin { job_id, reply } => {
                let _ = reply.send(self.begin(job_id));
            }
            Command::Progress { job_id, message } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.job.record_progress(message);
                }
            }
            Command::Finish { job_id, outcome } => self.finish(job_id, outcome),
            Command::Status { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(|entry| entry.job.clone()));
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(job_id));
            }
            Command::Purge { reply } => {
                let _ = reply.send(self.purge_expired());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn admit(&mut self, job: Job, user: String) -> Result<Uuid, QueueError> {
        let queued = QueuedJob {
            job_id: job.id,
            mode: job.mode,
            prompt: job.prompt.clone(),
            options: job.options.clone(),
            user,
        };
        let mode = job.mode;
        let job_id = self.queue.enqueue(queued)?;

        self.jobs.insert(
            job_id,
            Entry {
                job,
                cancel: CancellationToken::new(),
            },
        );

        metrics::counter!("generation_jobs_submitted_total", "mode" => mode.to_string()).increment(1);
        metrics::gauge!("generation_queue_depth", "mode" => mode.to_string())
            .set(self.queue.depth(mode) as f64);
        tracing::info!(job_id = %job_id, mode = %mode, "Job queued");
        Ok(job_id)
    }

    fn begin(&mut self, job_id: Uuid) -> Option<Lease> {
        let entry = self.jobs.get_mut(&job_id)?;
        if let Err(e) = entry.job.start() {
            tracing::debug!(job_id = %job_id, error = %e, "Job not startable");
            return None;
        }

        let tx = self.self_tx.clone();
        let progress = ProgressReporter::new(self.settings.progress_interval, move |message| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.try_send(Command::Progress { job_id, message });
            }
        });

        Some(Lease {
            progress,
            cancel: entry.cancel.clone(),
        })
    }

    fn finish(&mut self, job_id: Uuid, outcome: DispatchOutcome) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            tracing::warn!(job_id = %job_id, "Result for unknown job discarded");
            self.discard(outcome);
            return;
        };

        if entry.job.is_terminal() {
            tracing::info!(job_id = %job_id, status = %entry.job.status(), "Late result for resolved job discarded");
            self.discard(outcome);
            return;
        }

        let transition = match &outcome {
            DispatchOutcome::Succeeded(asset) => entry.job.succeed(asset.id),
            DispatchOutcome::Failed { reason, detail } => entry.job.fail(*reason, detail.clone()),
            DispatchOutcome::Cancelled => entry
                .job
                .fail(FailureReason::Cancelled, "cancelled while running"),
        };

        if let Err(e) = transition {
            tracing::error!(job_id = %job_id, error = %e, "Dropping dispatch result");
            self.discard(outcome);
            return;
        }

        let job = entry.job.clone();
        let status = job.status();
        metrics::counter!(
            "generation_jobs_finished_total",
            "mode" => job.mode.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        match job.failure() {
            Some(failure) => tracing::warn!(
                job_id = %job_id,
                reason = %failure.reason,
                detail = %failure.detail,
                "Job failed"
            ),
            None => tracing::info!(job_id = %job_id, status = %status, "Job finished"),
        }
        self.persist(&job);
    }

    fn cancel(&mut self, job_id: Uuid) -> Option<JobStatus> {
        let entry = self.jobs.get_mut(&job_id)?;
        let cancelled = match entry.job.status() {
            JobStatus::Queued => {
                self.queue.remove(entry.job.mode, job_id);
                entry
                    .job
                    .fail(FailureReason::Cancelled, "cancelled before dispatch")
                    .is_ok()
            }
            JobStatus::Running => {
                entry.cancel.cancel();
                entry
                    .job
                    .fail(FailureReason::Cancelled, "cancelled while running")
                    .is_ok()
            }
            _ => false,
        };

        let status = entry.job.status();
        if cancelled {
            tracing::info!(job_id = %job_id, "Job cancelled");
            let job = entry.job.clone();
            self.persist(&job);
        }
        Some(status)
    }

    fn purge_expired(&mut self) -> usize {
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - retention;

        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.job.finished_at().is_some_and(|at| at <= cutoff))
            .map(|(id, _)| *id)
            .collect();

        for job_id in &expired {
            if let Some(entry) = self.jobs.remove(job_id) {
                if let Some(asset_id) = entry.job.result_ref() {
                    self.delete_asset(asset_id);
                }
            }
        }

        if !expired.is_empty() {
            tracing::info!(purged = expired.len(), remaining = self.jobs.len(), "Purged expired jobs");
        }
        expired.len()
    }

    async fn teardown(&mut self) {
        self.queue.close();
        let drained = self.queue.drain().len();

        for entry in self.jobs.values_mut() {
            match entry.job.status() {
                JobStatus::Queued => {
                    let _ = entry.job.fail(FailureReason::Cancelled, "service shutting down");
                }
                JobStatus::Running => {
                    entry.cancel.cancel();
                    let _ = entry.job.fail(FailureReason::Cancelled, "service shutting down");
                }
                _ => {}
            }
        }

        if let Some(archive) = &self.archive {
            let jobs: Vec<Job> = self.jobs.values().map(|entry| entry.job.clone()).collect();
            match archive.save_all(&jobs).await {
                Ok(()) => tracing::info!(jobs = jobs.len(), "Flushed job table to archive"),
                Err(e) => tracing::error!(error = %e, "Failed to flush job table to archive"),
            }
        }
        tracing::info!(drained, jobs = self.jobs.len(), "Orchestrator torn down");
    }

    fn discard(&self, outcome: DispatchOutcome) {
        if let DispatchOutcome::Succeeded(asset) = outcome {
            self.delete_asset(asset.id);
        }
    }

    fn delete_asset(&self, asset_id: Uuid) {
        let assets = self.assets.clone();
        tokio::spawn(async move {
            if let Err(e) = assets.delete(asset_id).await {
                tracing::warn!(asset_id = %asset_id, error = %e, "Failed to delete asset");
            }
        });
    }

    fn persist(&self, job: &Job) {
        let Some(archive) = self.archive.clone() else {
            return;
        };
        if !job.is_terminal() {
            return;
        }
        let job = job.clone();
        tokio::spawn(async move {
            if let Err(e) = archive.save(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to archive job");
            }
        });
    }
}
