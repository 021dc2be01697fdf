use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fruit_inference_jobs::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        inference::HttpInferenceClient, ledger::PgJobLedger, orchestrator::JobOrchestrator,
        queue::JobQueue, storage::R2Client,
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

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!("Initializing fruit-inference-jobs server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("inference_jobs_submitted_total", "Jobs accepted by submit");
    metrics::describe_counter!("inference_jobs_succeeded_total", "Jobs that reached succeeded");
    metrics::describe_counter!("inference_jobs_failed_total", "Jobs that reached failed");
    metrics::describe_counter!(
        "inference_jobs_retried_total",
        "Attempts that ended in a retryable failure with budget left"
    );
    metrics::describe_histogram!(
        "inference_call_seconds",
        "Latency of a single inference service call"
    );
    metrics::describe_gauge!(
        "inference_queue_depth",
        "Dispatched jobs waiting for a worker"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let images = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    tracing::info!(endpoint = %config.inference_endpoint, "Initializing inference client");
    let inference = HttpInferenceClient::new(
        &config.inference_endpoint,
        config.inference_timeout(),
        config.retry_policy(),
    )
    .expect("Failed to initialize inference client");

    let orchestrator = JobOrchestrator::new(
        Arc::new(images),
        Arc::new(PgJobLedger::new(db_pool)),
        Arc::new(inference),
        config.orchestrator_settings(),
    );
    let state = AppState::new(orchestrator, Arc::new(queue));

    let app = Router::new()
        .merge(routes::router(state))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(config.max_image_bytes() + 1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
