use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::mode::Mode;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub orchestrator: ComponentHealth,
    pub queue: QueueHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub depth: Vec<LaneDepth>,
}

#[derive(Serialize)]
pub struct LaneDepth {
    pub mode: Mode,
    pub pending: usize,
}

impl ComponentHealth {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: health of the orchestrator, queue and archive.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let orchestrator = if state.orchestrator.is_running() {
        ComponentHealth::ok(None)
    } else {
        ComponentHealth::error()
    };

    let queue = QueueHealth {
        status: if state.queue.is_closed() { "closed" } else { "ok" }.to_string(),
        depth: Mode::ALL
            .into_iter()
            .map(|mode| LaneDepth {
                mode,
                pending: state.queue.depth(mode),
            })
            .collect(),
    };

    let database = match &state.archive {
        Some(archive) => {
            let start = std::time::Instant::now();
            Some(match archive.ping().await {
                Ok(()) => ComponentHealth::ok(Some(start.elapsed().as_millis() as u64)),
                Err(_) => ComponentHealth::error(),
            })
        }
        None => None,
    };

    let all_healthy = orchestrator.is_ok()
        && queue.status == "ok"
        && database.as_ref().map_or(true, ComponentHealth::is_ok);

    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            orchestrator,
            queue,
            database,
        },
    };

    (status_code, Json(response))
}
