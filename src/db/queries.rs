use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use std::collections::BTreeMap;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::detection::DetectionResult;
use crate::models::job::{Job, JobCounts, JobFailure, JobStatus, NewJob, Transition};

const JOB_COLUMNS: &str = "id, idempotency_key, image_ref, content_type, user_id, metadata, status, \
                           result, error, attempt_count, created_at, updated_at, \
                           processing_started_at, next_attempt_at";

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn job_from_row(r: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = r.try_get("status")?;
    let status = status_str.parse::<JobStatus>().map_err(decode_err)?;

    let result: Option<serde_json::Value> = r.try_get("result")?;
    let result = result
        .map(serde_json::from_value::<DetectionResult>)
        .transpose()
        .map_err(decode_err)?;

    let error: Option<serde_json::Value> = r.try_get("error")?;
    let error = error
        .map(serde_json::from_value::<JobFailure>)
        .transpose()
        .map_err(decode_err)?;

    let metadata: serde_json::Value = r.try_get("metadata")?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_value(metadata).map_err(decode_err)?;

    let attempt_count: i32 = r.try_get("attempt_count")?;

    Ok(Job {
        id: r.try_get("id")?,
        idempotency_key: r.try_get("idempotency_key")?,
        image_ref: r.try_get("image_ref")?,
        content_type: r.try_get("content_type")?,
        user_id: r.try_get("user_id")?,
        metadata,
        status,
        result,
        error,
        attempt_count: attempt_count.max(0) as u32,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        processing_started_at: r.try_get("processing_started_at")?,
        next_attempt_at: r.try_get("next_attempt_at")?,
    })
}

/// Insert a new pending job unless its idempotency key is taken.
/// Returns `None` when another record already owns the key.
pub async fn insert_job_if_absent(pool: &PgPool, job: &NewJob) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO inference_jobs
            (id, idempotency_key, image_ref, content_type, user_id, metadata, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending')
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING {JOB_COLUMNS}
        "#
    );

    let metadata =
        serde_json::to_value(&job.context.metadata).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let row = sqlx::query(&sql)
        .bind(job.id)
        .bind(&job.idempotency_key)
        .bind(&job.image_ref)
        .bind(&job.content_type)
        .bind(&job.context.user_id)
        .bind(metadata)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM inference_jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by the client's idempotency key
pub async fn get_job_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM inference_jobs WHERE idempotency_key = $1");
    let row = sqlx::query(&sql).bind(key).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Conditionally move a job between statuses.
///
/// The `WHERE status = $2` clause (plus the optional attempt fence) makes this
/// a compare-and-set; `None` means the precondition did not hold.
/// `result` and `error` are only ever written by transitions into terminal
/// states, so COALESCE keeps them write-once.
pub async fn transition_job(
    pool: &PgPool,
    job_id: Uuid,
    expected: JobStatus,
    new: JobStatus,
    transition: &Transition,
) -> Result<Option<Job>, sqlx::Error> {
    let result = transition
        .result
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let error = transition
        .error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let sql = format!(
        r#"
        UPDATE inference_jobs
        SET status = $3,
            result = COALESCE(result, $4),
            error = COALESCE(error, $5),
            attempt_count = COALESCE($6, attempt_count),
            processing_started_at = CASE WHEN $3 = 'processing' THEN NOW() ELSE processing_started_at END,
            next_attempt_at = $8,
            updated_at = NOW()
        WHERE id = $1
          AND status = $2
          AND ($7::INTEGER IS NULL OR attempt_count = $7)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(result)
        .bind(error)
        .bind(transition.attempt_count.map(|n| n as i32))
        .bind(transition.fence_attempt_count.map(|n| n as i32))
        .bind(transition.next_attempt_at)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Jobs stuck in processing since before `started_before`
pub async fn get_stale_processing_jobs(
    pool: &PgPool,
    started_before: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM inference_jobs
        WHERE status = 'processing' AND processing_started_at < $1
        ORDER BY processing_started_at ASC
        LIMIT 500
        "#
    );

    let rows = sqlx::query(&sql).bind(started_before).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Pending jobs untouched since before `updated_before` and already due
pub async fn get_stale_pending_jobs(
    pool: &PgPool,
    updated_before: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM inference_jobs
        WHERE status = 'pending'
          AND updated_at < $1
          AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
        ORDER BY updated_at ASC
        LIMIT 500
        "#
    );

    let rows = sqlx::query(&sql).bind(updated_before).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Most recent jobs submitted by a user, newest first
pub async fn list_jobs_by_user(
    pool: &PgPool,
    user_id: &str,
    limit: u32,
) -> Result<Vec<Job>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM inference_jobs
        WHERE user_id = $1
        ORDER BY created_at DESC, id
        LIMIT $2
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    rows.iter().map(job_from_row).collect()
}

/// Count jobs per status
pub async fn count_jobs_by_status(pool: &PgPool) -> Result<JobCounts, sqlx::Error> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM inference_jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    let mut counts = JobCounts::default();
    for r in rows {
        let status: String = r.try_get("status")?;
        let n: i64 = r.try_get("n")?;
        let n = n.max(0) as u64;
        match status.parse::<JobStatus>() {
            Ok(JobStatus::Pending) => counts.pending = n,
            Ok(JobStatus::Processing) => counts.processing = n,
            Ok(JobStatus::Succeeded) => counts.succeeded = n,
            Ok(JobStatus::Failed) => counts.failed = n,
            Err(_) => tracing::warn!(status = %status, "Unknown job status in ledger"),
        }
    }
    Ok(counts)
}
