use fruit_inference_jobs::{
    config::AppConfig,
    db,
    models::job::JobStatus,
    services::{
        inference::HttpInferenceClient,
        ledger::PgJobLedger,
        orchestrator::{JobOrchestrator, OrchestratorError},
        queue::{JobQueue, QueueError, QueuedJob},
        storage::R2Client,
    },
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting inference worker");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let images = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let queue = Arc::new(JobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    let inference = HttpInferenceClient::new(
        &config.inference_endpoint,
        config.inference_timeout(),
        config.retry_policy(),
    )
    .expect("Failed to initialize inference client");

    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::new(images),
        Arc::new(PgJobLedger::new(db_pool)),
        Arc::new(inference),
        config.orchestrator_settings(),
    ));

    match queue.requeue_in_flight().await {
        Ok(0) => {}
        Ok(moved) => tracing::info!(moved, "Re-queued messages left in flight"),
        Err(e) => tracing::warn!(error = %e, "Failed to re-queue in-flight messages"),
    }

    tokio::spawn(run_watchdog(
        orchestrator.clone(),
        queue.clone(),
        Duration::from_secs(config.watchdog_interval_secs),
    ));

    let poll_interval = Duration::from_millis(config.worker_poll_interval_ms);
    tracing::info!("Worker ready, starting job processing loop");

    loop {
        match process_next_job(&orchestrator, &queue).await {
            Ok(Polled::Handled) => {
                tracing::debug!("Job handled, checking for next job");
            }
            Ok(Polled::Empty) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Ok(Polled::Deferred) => sleep(poll_interval).await,
            Err(e) => {
                tracing::error!(error = %e, "Queue error, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

enum Polled {
    Handled,
    Empty,
    /// A backing service failed; the message went back on the queue.
    Deferred,
}

/// Handle the next queued job.
async fn process_next_job(
    orchestrator: &JobOrchestrator,
    queue: &JobQueue,
) -> Result<Polled, QueueError> {
    let promoted = queue.promote_due(Utc::now()).await?;
    if promoted > 0 {
        tracing::debug!(promoted, "Scheduled retries are due");
    }

    let Some(message) = queue.dequeue().await? else {
        return Ok(Polled::Empty);
    };

    let mut polled = Polled::Handled;
    match orchestrator.process(message.job_id).await {
        Ok(job) if job.status == JobStatus::Pending => {
            let retry_at = job.next_attempt_at.unwrap_or_else(Utc::now);
            tracing::info!(
                job_id = %job.id,
                attempt_count = job.attempt_count,
                retry_at = %retry_at,
                "Job scheduled for retry"
            );
            queue.schedule(&message, retry_at).await?;
        }
        Err(OrchestratorError::NotReady { job_id, retry_at }) => {
            tracing::debug!(job_id = %job_id, retry_at = %retry_at, "Job delivered early, rescheduling");
            queue.schedule(&message, retry_at).await?;
        }
        Ok(job) => {
            tracing::info!(
                job_id = %job.id,
                status = job.status.as_str(),
                attempt_count = job.attempt_count,
                "Job finished"
            );
        }
        Err(OrchestratorError::InvalidState { job_id, status }) => {
            tracing::debug!(job_id = %job_id, status = ?status, "Job not pending, dropping message");
        }
        Err(OrchestratorError::NotFound(job_id)) => {
            tracing::warn!(job_id = %job_id, "Queued job does not exist, dropping message");
        }
        Err(e) => {
            // Ledger or store outage: keep the job deliverable. A job stuck in
            // processing is picked up by the watchdog instead.
            tracing::error!(job_id = %message.job_id, error = %e, "Job processing failed, re-queueing");
            queue.enqueue(&message).await?;
            polled = Polled::Deferred;
        }
    }

    queue.complete(&message).await?;
    Ok(polled)
}

/// Periodically recycle abandoned `processing` jobs and redispatch them,
/// along with pending jobs that were never delivered.
async fn run_watchdog(orchestrator: Arc<JobOrchestrator>, queue: Arc<JobQueue>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;

        match orchestrator.recover_stale().await {
            Ok(report) => {
                if !report.requeued.is_empty() || !report.failed.is_empty() {
                    tracing::info!(
                        requeued = report.requeued.len(),
                        failed = report.failed.len(),
                        skipped = report.skipped,
                        "Watchdog sweep recovered stale jobs"
                    );
                }
                for job_id in report.requeued {
                    if let Err(e) = queue.schedule(&QueuedJob { job_id }, Utc::now()).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to re-dispatch recovered job");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Watchdog sweep failed"),
        }

        if let Ok(depth) = queue.pending_len().await {
            metrics::gauge!("inference_queue_depth").set(depth as f64);
        }
    }
}
