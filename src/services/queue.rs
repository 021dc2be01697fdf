use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "fruit_inference:jobs";
const PROCESSING_KEY: &str = "fruit_inference:processing";
/// Sorted set of delayed messages scored by due time in epoch millis.
const SCHEDULED_KEY: &str = "fruit_inference:scheduled";
const PROMOTE_BATCH: isize = 100;

fn schedule_score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Dispatch message serialized into Redis.
///
/// Only the job id travels; the ledger is the source of truth, so a
/// duplicated or stale message just ends in an `InvalidState` no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub job_id: Uuid,
}

/// Redis-backed dispatch queue feeding the worker.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Enqueue a job for processing.
    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue a job (pop with move to the processing list).
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let job: QueuedJob = serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Hold a message back until `due`.
    ///
    /// The set is keyed by payload, so scheduling a job that is already
    /// waiting only moves its due time.
    pub async fn schedule(&self, job: &QueuedJob, due: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.zadd::<_, _, _, ()>(SCHEDULED_KEY, &payload, schedule_score(due))
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Move scheduled messages due by `now` onto the queue. Returns how many
    /// were moved.
    ///
    /// Only the caller whose ZREM removes a message pushes it, so concurrent
    /// workers never duplicate a promotion.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let due: Vec<String> = conn
            .zrangebyscore_limit(SCHEDULED_KEY, "-inf", schedule_score(now), 0, PROMOTE_BATCH)
            .await
            .map_err(QueueError::Redis)?;

        let mut moved = 0;
        for payload in due {
            let removed: u64 = conn
                .zrem(SCHEDULED_KEY, &payload)
                .await
                .map_err(QueueError::Redis)?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Move every message left in the processing list back onto the queue.
    ///
    /// Run at worker start-up so messages held by a crashed worker are
    /// delivered again. Returns how many were moved.
    pub async fn requeue_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn
                .rpoplpush(PROCESSING_KEY, QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    /// Check Redis connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (undispatched jobs).
    pub async fn pending_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Remove a handled message from the processing list.
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// Hands job ids to whatever runs `process`.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    async fn queue_depth(&self) -> Result<u64, QueueError>;
}

#[async_trait]
impl JobDispatcher for JobQueue {
    async fn dispatch(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.enqueue(&QueuedJob { job_id }).await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.ping().await
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        self.pending_len().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_job_payload_is_stable() {
        let job = QueuedJob {
            job_id: Uuid::nil(),
        };
        let payload = serde_json::to_string(&job).unwrap();
        assert_eq!(payload, r#"{"job_id":"00000000-0000-0000-0000-000000000000"}"#);
        assert_eq!(serde_json::from_str::<QueuedJob>(&payload).unwrap(), job);
    }

    #[test]
    fn test_schedule_score_orders_by_due_time() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(1500);
        assert_eq!(schedule_score(later) - schedule_score(now), 1500);
    }
}
