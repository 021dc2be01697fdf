use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::JobCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobCounts>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub ledger: ComponentHealth,
    pub queue: ComponentHealth,
    pub inference: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(start: std::time::Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
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

/// GET /health: dependency status plus job counts by status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let (ledger_check, jobs) = match state.orchestrator.ledger().status_counts().await {
        Ok(counts) => (ComponentHealth::ok(start), Some(counts)),
        Err(e) => {
            tracing::warn!(error = %e, "Ledger health check failed");
            (ComponentHealth::error(), None)
        }
    };

    let queue_start = std::time::Instant::now();
    let queue_check = match state.dispatcher.health_check().await {
        Ok(()) => {
            let check = ComponentHealth::ok(queue_start);
            match state.dispatcher.queue_depth().await {
                Ok(depth) => metrics::gauge!("inference_queue_depth").set(depth as f64),
                Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
            }
            check
        }
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth::error()
        }
    };

    let inference_start = std::time::Instant::now();
    let inference_check = match state.orchestrator.inference().health_check().await {
        Ok(()) => ComponentHealth::ok(inference_start),
        Err(e) => {
            tracing::warn!(error = %e, "Inference health check failed");
            ComponentHealth::error()
        }
    };

    let all_healthy = ledger_check.is_ok() && queue_check.is_ok() && inference_check.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            ledger: ledger_check,
            queue: queue_check,
            inference: inference_check,
        },
        jobs,
    };

    (status_code, Json(response))
}
