use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::JobOptions;
use crate::models::mode::{Mode, ModeMap};

/// Dispatch payload held by the queue. Immutable once admitted; the job
/// record itself lives with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub mode: Mode,
    pub prompt: String,
    pub options: JobOptions,
    pub user: String,
}

/// Per-user admission policy: at most `max_jobs` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub max_jobs: usize,
    pub window: Duration,
}

/// In-memory FIFO lanes, one per mode, with per-user admission control.
///
/// Each lane has its own lock and notifier so a backlog of slow video jobs
/// never blocks image admissions or dispatch. Locks are held only for the
/// push/pop itself.
pub struct JobQueue {
    lanes: ModeMap<Lane>,
    limiter: Mutex<SlidingWindow>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Lane {
    pending: Mutex<VecDeque<QueuedJob>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(rate_limit: RateLimit) -> Self {
        Self {
            lanes: ModeMap::from_fn(|_| Lane::default()),
            limiter: Mutex::new(SlidingWindow::new(rate_limit)),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a job to its mode's lane.
    pub fn enqueue(&self, job: QueuedJob) -> Result<Uuid, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        lock(&self.limiter)
            .admit(&job.user, Instant::now())
            .map_err(|retry_after| QueueError::RateLimited { retry_after })?;

        let job_id = job.job_id;
        let lane = self.lanes.get(job.mode);
        lock(&lane.pending).push_back(job);
        lane.notify.notify_one();
        Ok(job_id)
    }

    /// Count a submission that will not be queued (a moderation rejection)
    /// against the user's admission window.
    pub fn charge(&self, user: &str) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        lock(&self.limiter)
            .admit(user, Instant::now())
            .map_err(|retry_after| QueueError::RateLimited { retry_after })
    }

    /// Pop the oldest job of a mode, if any.
    pub fn dequeue(&self, mode: Mode) -> Option<QueuedJob> {
        lock(&self.lanes.get(mode).pending).pop_front()
    }

    /// Wait for the next job of a mode. Returns `None` once the queue closes.
    pub async fn next(&self, mode: Mode) -> Option<QueuedJob> {
        let lane = self.lanes.get(mode);
        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(job) = self.dequeue(mode) {
                return Some(job);
            }
            notified.await;
        }
    }

    /// Drop a job that has not been dispatched yet.
    pub fn remove(&self, mode: Mode, job_id: Uuid) -> bool {
        let mut pending = lock(&self.lanes.get(mode).pending);
        match pending.iter().position(|job| job.job_id == job_id) {
            Some(index) => pending.remove(index).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, mode: Mode, job_id: Uuid) -> bool {
        lock(&self.lanes.get(mode).pending)
            .iter()
            .any(|job| job.job_id == job_id)
    }

    /// Current number of pending jobs in a lane.
    pub fn depth(&self, mode: Mode) -> usize {
        lock(&self.lanes.get(mode).pending).len()
    }

    /// Stop admitting and wake every waiting worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, lane) in self.lanes.iter() {
            lane.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return everything still pending (used on shutdown).
    pub fn drain(&self) -> Vec<QueuedJob> {
        self.lanes
            .iter()
            .flat_map(|(_, lane)| lock(&lane.pending).drain(..).collect::<Vec<_>>())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sliding-window admission log per user.
struct SlidingWindow {
    limit: RateLimit,
    admissions: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            admissions: HashMap::new(),
        }
    }

    /// Record an admission, or return how long until the oldest one expires.
    fn admit(&mut self, user: &str, now: Instant) -> Result<(), Duration> {
        let window = self.limit.window;
        let log = self.admissions.entry(user.to_string()).or_default();

        while log
            .front()
            .is_some_and(|admitted| now.duration_since(*admitted) >= window)
        {
            log.pop_front();
        }

        if log.len() >= self.limit.max_jobs {
            let retry_after = log
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Err(retry_after);
        }

        log.push_back(now);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Job queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_jobs: usize) -> RateLimit {
        RateLimit {
            max_jobs,
            window: Duration::from_secs(60),
        }
    }

    fn job(mode: Mode, user: &str) -> QueuedJob {
        QueuedJob {
            job_id: Uuid::new_v4(),
            mode,
            prompt: "a red circle".to_string(),
            options: JobOptions::default(),
            user: user.to_string(),
        }
    }

    #[test]
    fn test_fifo_within_mode() {
        let queue = JobQueue::new(limit(10));
        let first = job(Mode::Image, "u1");
        let second = job(Mode::Image, "u1");
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        assert_eq!(queue.dequeue(Mode::Image), Some(first));
        assert_eq!(queue.dequeue(Mode::Image), Some(second));
        assert_eq!(queue.dequeue(Mode::Image), None);
    }

    #[test]
    fn test_modes_are_independent_lanes() {
        let queue = JobQueue::new(limit(10));
        let video = job(Mode::Video, "u1");
        let image = job(Mode::Image, "u1");
        queue.enqueue(video.clone()).unwrap();
        queue.enqueue(image.clone()).unwrap();

        assert_eq!(queue.depth(Mode::Video), 1);
        assert_eq!(queue.depth(Mode::Image), 1);
        assert_eq!(queue.dequeue(Mode::Image), Some(image));
        assert_eq!(queue.dequeue(Mode::Audio), None);
        assert_eq!(queue.dequeue(Mode::Video), Some(video));
    }

    #[test]
    fn test_rate_limit_rejects_n_plus_one() {
        let queue = JobQueue::new(limit(3));
        for _ in 0..3 {
            queue.enqueue(job(Mode::Image, "alice")).unwrap();
        }
        let err = queue.enqueue(job(Mode::Web, "alice")).unwrap_err();
        match err {
            QueueError::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(queue.depth(Mode::Web), 0);

        // Other users are unaffected.
        assert!(queue.enqueue(job(Mode::Image, "bob")).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let mut window = SlidingWindow::new(RateLimit {
            max_jobs: 2,
            window: Duration::from_secs(10),
        });
        let start = Instant::now();
        assert!(window.admit("u", start).is_ok());
        assert!(window.admit("u", start + Duration::from_secs(4)).is_ok());

        let retry = window.admit("u", start + Duration::from_secs(5)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(5));

        assert!(window.admit("u", start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_remove_pending_job() {
        let queue = JobQueue::new(limit(10));
        let target = job(Mode::Audio, "u1");
        queue.enqueue(job(Mode::Audio, "u1")).unwrap();
        queue.enqueue(target.clone()).unwrap();

        assert!(queue.contains(Mode::Audio, target.job_id));
        assert!(queue.remove(Mode::Audio, target.job_id));
        assert!(!queue.remove(Mode::Audio, target.job_id));
        assert_eq!(queue.depth(Mode::Audio), 1);
    }

    #[test]
    fn test_charged_submissions_share_the_window() {
        let queue = JobQueue::new(limit(2));
        queue.charge("u1").unwrap();
        queue.enqueue(job(Mode::Image, "u1")).unwrap();

        assert!(matches!(queue.charge("u1"), Err(QueueError::RateLimited { .. })));
        assert!(matches!(
            queue.enqueue(job(Mode::Image, "u1")),
            Err(QueueError::RateLimited { .. })
        ));
        assert_eq!(queue.depth(Mode::Image), 1);
        queue.charge("u2").unwrap();
    }

    #[test]
    fn test_closed_queue_fails_closed() {
        let queue = JobQueue::new(limit(10));
        queue.close();
        assert!(matches!(
            queue.enqueue(job(Mode::Image, "u1")),
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_next_wakes_on_enqueue_and_close() {
        let queue = std::sync::Arc::new(JobQueue::new(limit(10)));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next(Mode::Web).await })
        };
        tokio::task::yield_now().await;
        let submitted = job(Mode::Web, "u1");
        queue.enqueue(submitted.clone()).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(submitted));

        let idle = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next(Mode::Video).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(idle.await.unwrap(), None);
    }
}
