use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

type Sink = Box<dyn Fn(String) + Send + Sync>;

/// Relays progress text from a running job, at most once per `min_interval`.
///
/// A message arriving inside the interval is held as pending and replaces any
/// earlier pending one. It goes out when the interval elapses (if a tokio
/// runtime is available) or on [`ProgressReporter::flush`], whichever comes
/// first, so the latest state always reaches the sink.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Sink,
    min_interval: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    last_sent: Option<Instant>,
    pending: Option<String>,
    flush_scheduled: bool,
}

impl ProgressReporter {
    pub fn new(min_interval: Duration, sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Box::new(sink),
                min_interval,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(Duration::ZERO, |_| {})
    }

    /// Forward a message unless one was sent less than `min_interval` ago, in
    /// which case it becomes the pending message. Returns whether it went out
    /// immediately.
    pub fn report(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let now = Instant::now();
        let wait = {
            let mut state = self.inner.lock();
            let remaining = state
                .last_sent
                .map(|previous| self.inner.min_interval.saturating_sub(now.duration_since(previous)))
                .filter(|remaining| !remaining.is_zero());
            match remaining {
                Some(remaining) => {
                    state.pending = Some(message);
                    if state.flush_scheduled {
                        return false;
                    }
                    state.flush_scheduled = true;
                    remaining
                }
                None => {
                    state.last_sent = Some(now);
                    state.pending = None;
                    drop(state);
                    (self.inner.sink)(message);
                    return true;
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let reporter = self.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(wait).await;
                    reporter.flush();
                });
            }
            Err(_) => self.inner.lock().flush_scheduled = false,
        }
        false
    }

    /// Send the pending message now, if any. Returns whether one went out.
    pub fn flush(&self) -> bool {
        let pending = {
            let mut state = self.inner.lock();
            state.flush_scheduled = false;
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_sent = Some(Instant::now());
            }
            pending
        };
        match pending {
            Some(message) => {
                (self.inner.sink)(message);
                true
            }
            None => false,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("min_interval", &self.inner.min_interval)
            .finish()
    }
}
