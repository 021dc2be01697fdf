use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{Job, JobCounts, JobStatus, NewJob, Transition};

/// Key-value store for job records.
///
/// All mutual exclusion between workers is delegated to the conditional
/// writes here; callers hold no locks of their own.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert `job` unless a record with the same idempotency key exists.
    /// Returns the stored record and whether this call created it.
    async fn create_if_absent(&self, job: NewJob) -> Result<(Job, bool), LedgerError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, LedgerError>;

    /// Move `job_id` from `expected` to `new`, writing the transition fields.
    /// Fails with `Conflict` when the stored status (or fenced attempt count)
    /// differs, or when the edge is not a legal transition.
    async fn compare_and_set_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        transition: Transition,
    ) -> Result<Job, LedgerError>;

    async fn get(&self, job_id: Uuid) -> Result<Job, LedgerError>;

    /// Jobs in `processing` whose attempt started before `started_before`.
    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError>;

    /// Jobs in `pending` not updated since `updated_before` whose retry
    /// delay, if any, has elapsed. Candidates for a lost dispatch.
    async fn list_stale_pending(&self, updated_before: DateTime<Utc>)
        -> Result<Vec<Job>, LedgerError>;

    /// Up to `limit` jobs owned by `user_id`, newest first.
    async fn list_by_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, LedgerError>;

    async fn status_counts(&self) -> Result<JobCounts, LedgerError>;
}

/// PostgreSQL-backed ledger.
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn create_if_absent(&self, job: NewJob) -> Result<(Job, bool), LedgerError> {
        if let Some(created) = queries::insert_job_if_absent(&self.pool, &job).await? {
            return Ok((created, true));
        }

        let existing = queries::get_job_by_idempotency_key(&self.pool, &job.idempotency_key)
            .await?
            .ok_or_else(|| {
                LedgerError::Backend(format!(
                    "idempotency key {} conflicted but no record was found",
                    job.idempotency_key
                ))
            })?;
        Ok((existing, false))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, LedgerError> {
        Ok(queries::get_job_by_idempotency_key(&self.pool, key).await?)
    }

    async fn compare_and_set_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        transition: Transition,
    ) -> Result<Job, LedgerError> {
        if !expected.can_transition_to(new) {
            return Err(LedgerError::Conflict {
                job_id,
                expected,
                actual: None,
            });
        }

        match queries::transition_job(&self.pool, job_id, expected, new, &transition).await? {
            Some(job) => Ok(job),
            None => {
                let current = queries::get_job(&self.pool, job_id)
                    .await?
                    .ok_or(LedgerError::NotFound(job_id))?;
                Err(LedgerError::Conflict {
                    job_id,
                    expected,
                    actual: Some(current.status),
                })
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, LedgerError> {
        queries::get_job(&self.pool, job_id)
            .await?
            .ok_or(LedgerError::NotFound(job_id))
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        Ok(queries::get_stale_processing_jobs(&self.pool, started_before).await?)
    }

    async fn list_stale_pending(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        Ok(queries::get_stale_pending_jobs(&self.pool, updated_before).await?)
    }

    async fn list_by_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, LedgerError> {
        Ok(queries::list_jobs_by_user(&self.pool, user_id, limit).await?)
    }

    async fn status_counts(&self) -> Result<JobCounts, LedgerError> {
        Ok(queries::count_jobs_by_status(&self.pool).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} is not {expected} (found {actual:?})")]
    Conflict {
        job_id: Uuid,
        expected: JobStatus,
        actual: Option<JobStatus>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger backend error: {0}")]
    Backend(String),
}
