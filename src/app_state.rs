use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::JobArchive;
use crate::models::mode::ModeMap;
use crate::services::{
    assets::AssetStoreGateway,
    backend::BackendRegistry,
    dispatcher::{self, DispatcherSettings, WorkerDispatcher},
    orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSettings},
    queue::{JobQueue, RateLimit},
};

/// Tunables for the in-process pipeline, usually derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub rate_limit: RateLimit,
    pub worker_pools: ModeMap<usize>,
    pub dispatcher: DispatcherSettings,
    pub orchestrator: OrchestratorSettings,
}

impl From<&AppConfig> for ServiceSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            rate_limit: config.rate_limit(),
            worker_pools: config.worker_pools(),
            dispatcher: config.dispatcher_settings(),
            orchestrator: config.orchestrator_settings(),
        }
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub assets: Arc<AssetStoreGateway>,
    pub queue: Arc<JobQueue>,
    pub archive: Option<JobArchive>,
}

impl AppState {
    /// Start the orchestrator and worker pools. The returned tasks finish
    /// after [`OrchestratorHandle::shutdown`].
    pub fn start(
        settings: ServiceSettings,
        backends: BackendRegistry,
        assets: Arc<AssetStoreGateway>,
        archive: Option<JobArchive>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let queue = Arc::new(JobQueue::new(settings.rate_limit));

        let (orchestrator, orchestrator_task) = Orchestrator::start(
            queue.clone(),
            assets.clone(),
            archive.clone(),
            settings.orchestrator,
        );

        let dispatcher = Arc::new(WorkerDispatcher::new(
            backends,
            assets.clone(),
            settings.dispatcher,
        ));
        let mut tasks = dispatcher::spawn_workers(
            dispatcher,
            queue.clone(),
            orchestrator.clone(),
            &settings.worker_pools,
        );
        tasks.push(orchestrator_task);

        let state = Self {
            orchestrator,
            assets,
            queue,
            archive,
        };
        (state, tasks)
    }
}
