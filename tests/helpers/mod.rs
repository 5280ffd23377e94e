//! Shared harness for orchestrator and API tests.
//!
//! Backends are scripted in-process and assets live in memory, so these
//! tests need no external services.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use media_gen_orchestrator::{
    app_state::{AppState, ServiceSettings},
    models::{
        generation::{GenerateOptions, GenerateRequest},
        mode::{Mode, ModeMap},
    },
    services::{
        assets::{AssetStoreGateway, UrlSigner},
        backend::{BackendError, BackendOutput, BackendRegistry, BackendRequest, ModelBackend},
        dispatcher::DispatcherSettings,
        encryption::AssetCipher,
        orchestrator::{JobView, OrchestratorHandle, OrchestratorSettings},
        progress::ProgressReporter,
        queue::RateLimit,
        retry::RetryPolicy,
        storage::{InMemoryObjectStore, ObjectStore},
    },
};

/// Smallest byte string `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

pub const BASE_URL: &str = "http://gen.test";

#[derive(Clone)]
pub enum Behavior {
    /// Return a PNG right away.
    Succeed,
    /// Fail with a transient error `n` times, then succeed.
    FlakyThenSucceed(usize),
    /// Fail every call with a non-transient error.
    Fatal,
    /// Never return.
    Hang,
    /// Wait until the gate is notified, then succeed.
    Gated(Arc<Notify>),
    /// Report each update back to back, then succeed.
    Chatty(Vec<&'static str>),
}

/// In-process backend that follows a fixed script and counts its calls.
pub struct ScriptedBackend {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    forwarded: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(behavior: Behavior) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(Self {
            behavior,
            calls: calls.clone(),
            forwarded: AtomicUsize::new(0),
        });
        (backend, calls)
    }

    /// Progress reports that went out without being throttled.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    fn report(&self, progress: &ProgressReporter, message: String) {
        if progress.report(message) {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn invoke(
        &self,
        _request: &BackendRequest,
        progress: &ProgressReporter,
    ) -> Result<BackendOutput, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(progress, format!("call {call} started"));

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::FlakyThenSucceed(failures) => {
                if call <= *failures {
                    return Err(BackendError::Unavailable("503: warming up".to_string()));
                }
            }
            Behavior::Fatal => {
                return Err(BackendError::InvalidPrompt("model refused".to_string()));
            }
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Gated(gate) => gate.notified().await,
            Behavior::Chatty(updates) => {
                for update in updates {
                    self.report(progress, update.to_string());
                }
            }
        }

        Ok(BackendOutput {
            bytes: PNG_BYTES.to_vec(),
            mime: Some("image/png".to_string()),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Small intervals so tests settle in milliseconds.
pub fn settings() -> ServiceSettings {
    ServiceSettings {
        rate_limit: RateLimit {
            max_jobs: 100,
            window: Duration::from_secs(60),
        },
        worker_pools: ModeMap::new(1, 1, 1, 1),
        dispatcher: DispatcherSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_delay: Duration::from_millis(20),
            },
            timeouts: ModeMap::from_fn(|_| Duration::from_secs(5)),
        },
        orchestrator: OrchestratorSettings {
            retention: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(3600),
            signed_url_ttl: Duration::from_secs(300),
            progress_interval: Duration::ZERO,
        },
    }
}

pub fn gateway(store: Arc<dyn ObjectStore>) -> Arc<AssetStoreGateway> {
    let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    let cipher = AssetCipher::new(&key).expect("test key is valid");
    let signer = UrlSigner::new(BASE_URL, "test-signing-secret");
    Arc::new(AssetStoreGateway::new(
        store,
        cipher,
        signer,
        Duration::from_secs(300),
    ))
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<InMemoryObjectStore>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    /// Every mode served by the same backend.
    pub fn with_backend(backend: Arc<dyn ModelBackend>, settings: ServiceSettings) -> Self {
        Self::start(ModeMap::from_fn(|_| backend.clone()), settings)
    }

    pub fn start(backends: ModeMap<Arc<dyn ModelBackend>>, settings: ServiceSettings) -> Self {
        let store = Arc::new(InMemoryObjectStore::new());
        let (state, tasks) = AppState::start(
            settings,
            BackendRegistry::new(backends),
            gateway(store.clone()),
            None,
        );
        Self {
            state,
            store,
            tasks,
        }
    }

    pub fn orchestrator(&self) -> &OrchestratorHandle {
        &self.state.orchestrator
    }
}

pub fn request(mode: Mode, prompt: &str) -> GenerateRequest {
    let duration = mode.requires_duration().then_some(5);
    GenerateRequest {
        mode,
        prompt: prompt.to_string(),
        options: GenerateOptions {
            duration,
            ..GenerateOptions::default()
        },
    }
}

/// Poll until the job is terminal or five seconds pass.
pub async fn wait_for_terminal(orchestrator: &OrchestratorHandle, job_id: Uuid) -> JobView {
    for _ in 0..500 {
        let view = orchestrator
            .get_status(job_id)
            .await
            .expect("job should be known");
        if view.job.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish in time");
}

/// Poll until `check` holds or five seconds pass.
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
