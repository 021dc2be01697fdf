use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::models::detection::DetectionResult;

/// Lifecycle status of an inference job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Legal ledger edges. `Processing -> Pending` is the retry loop; terminal
    /// states have no outgoing edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Succeeded)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// Classification carried by a failed job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    RetryableInferenceError,
    FatalInferenceError,
}

/// Terminal failure recorded on a job: a readable reason plus its classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Client attributes recorded with a submission: the owning user, if any,
/// and free-form string metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubmissionContext {
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SubmissionContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            metadata: BTreeMap::new(),
        }
    }
}

/// An image detection/ripeness job as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub idempotency_key: String,
    pub image_ref: String,
    pub content_type: String,
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub status: JobStatus,
    pub result: Option<DetectionResult>,
    pub error: Option<JobFailure>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may start. Set when a retryable
    /// failure sends the job back to `pending`.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Initial record handed to `JobLedger::create_if_absent`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub idempotency_key: String,
    pub image_ref: String,
    pub content_type: String,
    pub context: SubmissionContext,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            idempotency_key: self.idempotency_key,
            image_ref: self.image_ref,
            content_type: self.content_type,
            user_id: self.context.user_id,
            metadata: self.context.metadata,
            status: JobStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            next_attempt_at: None,
        }
    }
}

/// Fields written alongside a compare-and-set status change.
///
/// `fence_attempt_count` additionally conditions the write on the stored
/// attempt counter, so a worker whose job was recycled by the watchdog cannot
/// finalise it afterwards. `next_attempt_at` replaces the stored value on
/// every transition, so it is cleared unless the caller sets it.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub result: Option<DetectionResult>,
    pub error: Option<JobFailure>,
    pub attempt_count: Option<u32>,
    pub fence_attempt_count: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn fenced(attempt_count: u32) -> Self {
        Self {
            fence_attempt_count: Some(attempt_count),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: DetectionResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: JobFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
}
