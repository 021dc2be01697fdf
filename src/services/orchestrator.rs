use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::detection::DetectionResult;
use crate::models::job::{
    FailureKind, Job, JobFailure, JobStatus, NewJob, SubmissionContext, Transition,
};
use crate::services::inference::{InferenceBackend, InferenceError};
use crate::services::ledger::{JobLedger, LedgerError};
use crate::services::storage::{image_key, ImageStore, StorageError};
use crate::services::validation::{self, ValidationError, DEFAULT_MAX_IMAGE_BYTES};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Inference attempts a job may consume before it fails for good.
    pub max_attempts: u32,
    pub max_image_bytes: usize,
    /// Upper bound on one `process` attempt (image fetch plus inference).
    pub processing_timeout: Duration,
    /// Age after which a `processing` job is presumed abandoned, or a
    /// `pending` one presumed undispatched.
    pub stale_after: Duration,
    /// Wait before the second attempt; doubles per further attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl OrchestratorSettings {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            processing_timeout: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            retry_base_delay: Duration::from_secs(10),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

/// Outcome of one watchdog sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Jobs now pending that need to be dispatched again: abandoned attempts
    /// reverted by this sweep, plus pending jobs idle past `stale_after`.
    pub requeued: Vec<Uuid>,
    /// Jobs that hit the attempt cap and were failed.
    pub failed: Vec<Uuid>,
    /// Jobs that moved on before the sweep could touch them.
    pub skipped: usize,
}

/// Drives jobs through submit, process and query.
///
/// Holds no job state of its own: every decision is re-read from the ledger
/// and every mutation is a conditional ledger write, so any number of
/// orchestrators may run side by side.
pub struct JobOrchestrator {
    images: Arc<dyn ImageStore>,
    ledger: Arc<dyn JobLedger>,
    inference: Arc<dyn InferenceBackend>,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        images: Arc<dyn ImageStore>,
        ledger: Arc<dyn JobLedger>,
        inference: Arc<dyn InferenceBackend>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            images,
            ledger,
            inference,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn inference(&self) -> &Arc<dyn InferenceBackend> {
        &self.inference
    }

    /// Accept an image under a client idempotency key.
    ///
    /// A repeated key returns the job already recorded for it without storing
    /// the image again. The image is durably stored before the ledger record
    /// exists, so a crash in between is repaired by resubmitting.
    pub async fn submit(&self, image: &[u8], idempotency_key: &str) -> Result<Job, OrchestratorError> {
        self.submit_with(image, idempotency_key, SubmissionContext::default())
            .await
    }

    /// `submit` with an owner and free-form metadata recorded on the job.
    /// A repeated key returns the existing job; its context is not updated.
    pub async fn submit_with(
        &self,
        image: &[u8],
        idempotency_key: &str,
        context: SubmissionContext,
    ) -> Result<Job, OrchestratorError> {
        validation::validate_idempotency_key(idempotency_key)?;
        if let Some(user_id) = &context.user_id {
            validation::validate_user_id(user_id)?;
        }
        validation::validate_metadata(&context.metadata)?;
        let validated = validation::validate_image(image, self.settings.max_image_bytes)?;

        if let Some(existing) = self.ledger.find_by_idempotency_key(idempotency_key).await? {
            tracing::info!(
                job_id = %existing.id,
                idempotency_key = %idempotency_key,
                "Duplicate submission, returning existing job"
            );
            return Ok(existing);
        }

        let job_id = Uuid::new_v4();
        let key = image_key(job_id, validated.extension());
        self.images
            .put(&key, image, validated.content_type())
            .await?;

        let (job, created) = self
            .ledger
            .create_if_absent(NewJob {
                id: job_id,
                idempotency_key: idempotency_key.to_string(),
                image_ref: key.clone(),
                content_type: validated.content_type().to_string(),
                context,
            })
            .await?;

        if !created {
            // Lost a race on the same key; the winner's image is the one referenced.
            if let Err(e) = self.images.delete(&key).await {
                tracing::warn!(image_key = %key, error = %e, "Failed to remove orphaned image");
            }
            tracing::info!(
                job_id = %job.id,
                idempotency_key = %idempotency_key,
                "Concurrent submission resolved to existing job"
            );
            return Ok(job);
        }

        metrics::counter!("inference_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            image_ref = %job.image_ref,
            width = validated.width,
            height = validated.height,
            size_bytes = image.len(),
            "Job submitted"
        );

        Ok(job)
    }

    /// Run one inference attempt for a pending job.
    ///
    /// Returns the job as left by this attempt: `succeeded`, `failed`, or
    /// `pending` again when a retryable failure still has attempts left.
    /// A job that is not `pending` (including one another worker just
    /// claimed) yields `InvalidState` and is left untouched. A pending job
    /// whose retry delay has not elapsed yields `NotReady`.
    pub async fn process(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let job = self.ledger.get(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: Some(job.status),
            });
        }
        if let Some(retry_at) = job.next_attempt_at.filter(|at| *at > Utc::now()) {
            return Err(OrchestratorError::NotReady { job_id, retry_at });
        }

        let claimed = self
            .ledger
            .compare_and_set_status(
                job_id,
                JobStatus::Pending,
                JobStatus::Processing,
                Transition::fenced(job.attempt_count),
            )
            .await?;

        let attempt = claimed.attempt_count + 1;
        tracing::info!(
            job_id = %job_id,
            attempt,
            max_attempts = self.settings.max_attempts,
            "Processing job"
        );

        let outcome = match tokio::time::timeout(
            self.settings.processing_timeout,
            self.run_attempt(&claimed),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(InferenceError::Retryable {
                reason: format!(
                    "processing timed out after {}s",
                    self.settings.processing_timeout.as_secs_f64()
                ),
            }),
        };

        self.finish_attempt(&claimed, attempt, outcome).await
    }

    /// Current state of a job. Never waits on in-flight work.
    pub async fn get_result(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        Ok(self.ledger.get(job_id).await?)
    }

    /// Most recent jobs submitted by `user_id`, newest first.
    pub async fn list_results(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        validation::validate_user_id(user_id)?;
        let limit = limit.unwrap_or(validation::DEFAULT_LIST_LIMIT);
        validation::validate_list_limit(limit)?;
        Ok(self.ledger.list_by_user(user_id, limit).await?)
    }

    /// Watchdog sweep: recycle jobs whose worker vanished mid-attempt and
    /// surface pending jobs whose dispatch was lost.
    ///
    /// An abandoned attempt counts against the budget, so a job that keeps
    /// crashing its worker still terminates. Idle pending jobs are reported
    /// without a ledger write; redispatching one that is already queued is
    /// harmless since `process` admits a single claimant.
    pub async fn recover_stale(&self) -> Result<RecoveryReport, OrchestratorError> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = Utc::now() - stale_after;

        let mut report = RecoveryReport::default();
        for job in self.ledger.list_stale_pending(cutoff).await? {
            tracing::warn!(job_id = %job.id, updated_at = %job.updated_at, "Pending job idle, redispatching");
            metrics::counter!("inference_jobs_redispatched_total").increment(1);
            report.requeued.push(job.id);
        }

        for job in self.ledger.list_stale_processing(cutoff).await? {
            let attempt = job.attempt_count + 1;
            let fence = Transition::fenced(job.attempt_count).with_attempt_count(attempt);

            let (next, transition) = if attempt < self.settings.max_attempts {
                (JobStatus::Pending, fence)
            } else {
                (
                    JobStatus::Failed,
                    fence.with_error(JobFailure::new(
                        FailureKind::RetryableInferenceError,
                        format!("processing abandoned after {attempt} attempts"),
                    )),
                )
            };

            match self
                .ledger
                .compare_and_set_status(job.id, JobStatus::Processing, next, transition)
                .await
            {
                Ok(_) if next == JobStatus::Pending => {
                    tracing::warn!(job_id = %job.id, attempt, "Recovered stale job to pending");
                    metrics::counter!("inference_jobs_recovered_total").increment(1);
                    report.requeued.push(job.id);
                }
                Ok(_) => {
                    tracing::warn!(job_id = %job.id, attempt, "Stale job exhausted attempts");
                    metrics::counter!("inference_jobs_failed_total").increment(1);
                    report.failed.push(job.id);
                }
                Err(LedgerError::Conflict { .. }) | Err(LedgerError::NotFound(_)) => {
                    report.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    async fn run_attempt(&self, job: &Job) -> Result<DetectionResult, InferenceError> {
        let image = match self.images.get(&job.image_ref).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(key)) => {
                return Err(InferenceError::Fatal {
                    code: "image_missing".to_string(),
                    reason: format!("stored image {key} no longer exists"),
                })
            }
            Err(e) => {
                return Err(InferenceError::Retryable {
                    reason: format!("image store unavailable: {e}"),
                })
            }
        };

        self.inference
            .infer(&image, &job.content_type, &job.id.to_string())
            .await
    }

    async fn finish_attempt(
        &self,
        claimed: &Job,
        attempt: u32,
        outcome: Result<DetectionResult, InferenceError>,
    ) -> Result<Job, OrchestratorError> {
        let fence = Transition::fenced(claimed.attempt_count).with_attempt_count(attempt);

        let (next, transition) = match outcome {
            Ok(result) => {
                tracing::info!(
                    job_id = %claimed.id,
                    attempt,
                    detections = result.detections.len(),
                    "Inference succeeded"
                );
                (JobStatus::Succeeded, fence.with_result(result))
            }
            Err(InferenceError::Fatal { code, reason }) => {
                tracing::warn!(job_id = %claimed.id, attempt, code = %code, reason = %reason, "Inference rejected image");
                (
                    JobStatus::Failed,
                    fence.with_error(JobFailure::new(
                        FailureKind::FatalInferenceError,
                        format!("{code}: {reason}"),
                    )),
                )
            }
            Err(InferenceError::Retryable { reason }) if attempt < self.settings.max_attempts => {
                let delay = self.settings.retry_delay(attempt);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::warn!(
                    job_id = %claimed.id,
                    attempt,
                    reason = %reason,
                    retry_at = %retry_at,
                    "Inference failed, job will be retried"
                );
                (JobStatus::Pending, fence.not_before(retry_at))
            }
            Err(InferenceError::Retryable { reason }) => {
                tracing::error!(job_id = %claimed.id, attempt, reason = %reason, "Inference failed, attempts exhausted");
                (
                    JobStatus::Failed,
                    fence.with_error(JobFailure::new(
                        FailureKind::RetryableInferenceError,
                        format!("failed after {attempt} attempts: {reason}"),
                    )),
                )
            }
        };

        let job = self
            .ledger
            .compare_and_set_status(claimed.id, JobStatus::Processing, next, transition)
            .await?;

        match job.status {
            JobStatus::Succeeded => metrics::counter!("inference_jobs_succeeded_total").increment(1),
            JobStatus::Failed => metrics::counter!("inference_jobs_failed_total").increment(1),
            JobStatus::Pending => metrics::counter!("inference_jobs_retried_total").increment(1),
            JobStatus::Processing => {}
        }

        Ok(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} cannot be processed from status {status:?}")]
    InvalidState {
        job_id: Uuid,
        status: Option<JobStatus>,
    },

    #[error("Job {job_id} is waiting to retry until {retry_at}")]
    NotReady {
        job_id: Uuid,
        retry_at: DateTime<Utc>,
    },

    #[error("Backing service unavailable: {0}")]
    Unavailable(String),
}

impl From<LedgerError> for OrchestratorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => OrchestratorError::NotFound(id),
            LedgerError::Conflict { job_id, actual, .. } => OrchestratorError::InvalidState {
                job_id,
                status: actual,
            },
            other => OrchestratorError::Unavailable(other.to_string()),
        }
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(e: StorageError) -> Self {
        OrchestratorError::Unavailable(e.to_string())
    }
}
