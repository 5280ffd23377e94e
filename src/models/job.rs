use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::mode::Mode;

/// Lifecycle status of a generation job.
///
/// Serialized in PascalCase on the wire and stored lowercase in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Rejected)
    }
}

/// Why a job ended in [`JobStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum FailureReason {
    Timeout,
    BackendError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    /// Internal cause. Logged and archived, never sent to clients.
    pub detail: String,
}

/// Per-request generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub style: Option<String>,
    pub resolution: Option<String>,
    /// Output length in seconds (video and audio only).
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("illegal job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A generation job record.
///
/// Status-bearing fields are only reachable through the transition methods so
/// that `result_ref` is set exactly when the job succeeded and terminal states
/// stay terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub mode: Mode,
    pub prompt: String,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress_message: Option<String>,
    pub(crate) status: JobStatus,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) result_ref: Option<Uuid>,
    pub(crate) failure: Option<JobFailure>,
    pub(crate) rejection_reason: Option<String>,
}

impl Job {
    pub fn new(mode: Mode, prompt: impl Into<String>, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mode,
            prompt: prompt.into(),
            options,
            created_at: now,
            updated_at: now,
            progress_message: None,
            status: JobStatus::Queued,
            finished_at: None,
            result_ref: None,
            failure: None,
            rejection_reason: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_ref(&self) -> Option<Uuid> {
        self.result_ref
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued -> Running.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.guard(JobStatus::Running, &[JobStatus::Queued])?;
        self.status = JobStatus::Running;
        self.touch();
        Ok(())
    }

    /// Running -> Succeeded, pointing at the stored asset.
    pub fn succeed(&mut self, asset_id: Uuid) -> Result<(), TransitionError> {
        self.guard(JobStatus::Succeeded, &[JobStatus::Running])?;
        self.status = JobStatus::Succeeded;
        self.result_ref = Some(asset_id);
        self.finish();
        Ok(())
    }

    /// Queued | Running -> Failed.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.guard(JobStatus::Failed, &[JobStatus::Queued, JobStatus::Running])?;
        self.status = JobStatus::Failed;
        self.failure = Some(JobFailure {
            reason,
            detail: detail.into(),
        });
        self.finish();
        Ok(())
    }

    /// Queued -> Rejected. Moderation vetoes happen before any dispatch.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Rejected, &[JobStatus::Queued])?;
        self.status = JobStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.finish();
        Ok(())
    }

    /// Progress text is only accepted while the job runs.
    pub fn record_progress(&mut self, message: impl Into<String>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress_message = Some(message.into());
        self.touch();
        true
    }

    fn guard(&self, to: JobStatus, allowed_from: &[JobStatus]) -> Result<(), TransitionError> {
        if allowed_from.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        self.touch();
        self.finished_at = Some(self.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_job() -> Job {
        Job::new(Mode::Image, "a red circle", JobOptions::default())
    }

    #[test]
    fn test_happy_path_sets_result_ref_only_on_success() {
        let mut job = image_job();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(job.result_ref().is_none());

        job.start().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.result_ref().is_none());

        let asset = Uuid::new_v4();
        job.succeed(asset).unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.result_ref(), Some(asset));
        assert!(job.finished_at().is_some());
    }

    #[test]
    fn test_terminal_states_never_reenter_queue_or_running() {
        let mut succeeded = image_job();
        succeeded.start().unwrap();
        succeeded.succeed(Uuid::new_v4()).unwrap();

        let mut failed = image_job();
        failed.fail(FailureReason::Cancelled, "user request").unwrap();

        let mut rejected = image_job();
        rejected.reject("explicit content").unwrap();

        for job in [&mut succeeded, &mut failed, &mut rejected] {
            let before = job.status();
            assert!(job.start().is_err());
            assert!(job.succeed(Uuid::new_v4()).is_err());
            assert!(job.fail(FailureReason::Timeout, "late").is_err());
            assert!(job.reject("late").is_err());
            assert_eq!(job.status(), before);
        }
        assert!(failed.result_ref().is_none());
        assert!(rejected.result_ref().is_none());
    }

    #[test]
    fn test_reject_only_from_queued() {
        let mut job = image_job();
        job.start().unwrap();
        let err = job.reject("too late").unwrap_err();
        assert_eq!(err.from, JobStatus::Running);
        assert_eq!(err.to, JobStatus::Rejected);
    }

    #[test]
    fn test_succeed_requires_running() {
        let mut job = image_job();
        assert!(job.succeed(Uuid::new_v4()).is_err());
        assert!(job.result_ref().is_none());
    }

    #[test]
    fn test_progress_ignored_outside_running() {
        let mut job = image_job();
        assert!(!job.record_progress("warming up"));
        job.start().unwrap();
        assert!(job.record_progress("step 1/4"));
        assert_eq!(job.progress_message.as_deref(), Some("step 1/4"));
        job.fail(FailureReason::Timeout, "deadline").unwrap();
        assert!(!job.record_progress("step 2/4"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(
            serde_json::to_value(JobStatus::Succeeded).unwrap(),
            serde_json::json!("Succeeded")
        );
        assert_eq!(FailureReason::Cancelled.to_string(), "Cancelled");
    }
}
