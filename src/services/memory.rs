//! In-process adapters for the image store and job ledger.
//!
//! They honour the same conditional-write contracts as the R2 and PostgreSQL
//! adapters, for single-process runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, JobCounts, JobStatus, NewJob, SubmissionContext, Transition};
use crate::services::ledger::{JobLedger, LedgerError};
use crate::services::storage::{ImageStore, StorageError};

#[derive(Default)]
pub struct MemoryImageStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    puts: AtomicUsize,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    /// Total successful `put` calls, including overwrites.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Content type recorded by the last `put` under `key`.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().await.get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
struct LedgerState {
    jobs: HashMap<Uuid, Job>,
    by_key: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryJobLedger {
    state: Mutex<LedgerState>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.jobs.is_empty()
    }

    /// Overwrite `processing_started_at` on a stored job. Lets tests age a
    /// running attempt past the watchdog threshold.
    pub async fn backdate_processing(&self, job_id: Uuid, started_at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.processing_started_at = Some(started_at);
        }
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create_if_absent(&self, job: NewJob) -> Result<(Job, bool), LedgerError> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.by_key.get(&job.idempotency_key) {
            let existing = state
                .jobs
                .get(id)
                .cloned()
                .ok_or(LedgerError::NotFound(*id))?;
            return Ok((existing, false));
        }

        let record = job.into_job(Utc::now());
        state.by_key.insert(record.idempotency_key.clone(), record.id);
        state.jobs.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.by_key.get(key).and_then(|id| state.jobs.get(id)).cloned())
    }

    async fn compare_and_set_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        transition: Transition,
    ) -> Result<Job, LedgerError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(LedgerError::NotFound(job_id))?;

        let fence_holds = transition
            .fence_attempt_count
            .is_none_or(|fence| fence == job.attempt_count);

        if job.status != expected || !fence_holds || !expected.can_transition_to(new) {
            return Err(LedgerError::Conflict {
                job_id,
                expected,
                actual: Some(job.status),
            });
        }

        let now = Utc::now();
        job.status = new;
        if job.result.is_none() {
            job.result = transition.result;
        }
        if job.error.is_none() {
            job.error = transition.error;
        }
        if let Some(n) = transition.attempt_count {
            job.attempt_count = n;
        }
        if new == JobStatus::Processing {
            job.processing_started_at = Some(now);
        }
        job.next_attempt_at = transition.next_attempt_at;
        job.updated_at = now;

        Ok(job.clone())
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, LedgerError> {
        self.state
            .lock()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(LedgerError::NotFound(job_id))
    }

    async fn list_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .filter(|j| j.processing_started_at.is_some_and(|t| t < started_before))
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.processing_started_at);
        Ok(stale)
    }

    async fn list_stale_pending(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.updated_at < updated_before)
            .filter(|j| j.next_attempt_at.is_none_or(|t| t <= now))
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }

    async fn list_by_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, LedgerError> {
        let state = self.state.lock().await;
        let mut owned: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        owned.truncate(limit as usize);
        Ok(owned)
    }

    async fn status_counts(&self) -> Result<JobCounts, LedgerError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
