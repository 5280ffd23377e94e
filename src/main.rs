use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use media_gen_orchestrator::{
    app_state::{AppState, ServiceSettings},
    config::AppConfig,
    db::{self, JobArchive},
    routes,
    services::{
        assets::{AssetStoreGateway, UrlSigner},
        backend::BackendRegistry,
        encryption::AssetCipher,
        storage::{InMemoryObjectStore, ObjectStore, R2Client},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing media-gen-orchestrator");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "generation_jobs_submitted_total",
        "Jobs admitted to the queue"
    );
    metrics::describe_counter!(
        "generation_jobs_rejected_total",
        "Prompts rejected by moderation"
    );
    metrics::describe_counter!(
        "generation_jobs_finished_total",
        "Jobs that reached a terminal state"
    );
    metrics::describe_counter!(
        "generation_backend_retries_total",
        "Backend calls retried after a transient failure"
    );
    metrics::describe_histogram!(
        "generation_dispatch_seconds",
        "Time from dispatch to a finished backend run"
    );
    metrics::describe_gauge!(
        "generation_queue_depth",
        "Jobs waiting in the queue"
    );

    let archive = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL job archive");
            let pool = db::init_pool(url)
                .await
                .expect("Failed to connect to database");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            Some(JobArchive::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, finished jobs are not archived");
            None
        }
    };

    let store: Arc<dyn ObjectStore> = match config.r2() {
        Some(r2) => {
            tracing::info!(bucket = r2.bucket, "Initializing R2 asset storage");
            Arc::new(
                R2Client::new(r2.bucket, r2.endpoint, r2.access_key, r2.secret_key)
                    .expect("Failed to initialize R2 client"),
            )
        }
        None => {
            tracing::warn!("R2 not configured, assets are kept in memory");
            Arc::new(InMemoryObjectStore::new())
        }
    };

    let cipher = AssetCipher::new(&config.encryption_key).expect("Failed to initialize encryption");
    let signer = UrlSigner::new(&config.public_base_url, &config.signing_secret);
    let assets = Arc::new(AssetStoreGateway::new(
        store,
        cipher,
        signer,
        config.signed_url_ttl(),
    ));

    let backends =
        BackendRegistry::http(&config.backend_endpoints(), config.model_api_token.clone());

    let (state, tasks) = AppState::start(
        ServiceSettings::from(&config),
        backends,
        assets,
        archive,
    );
    let orchestrator = state.orchestrator.clone();

    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down, failing outstanding jobs");
    if let Err(e) = orchestrator.shutdown().await {
        tracing::error!(error = %e, "Orchestrator did not shut down cleanly");
    }
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
