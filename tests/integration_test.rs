use fruit_inference_jobs::{
    config::AppConfig,
    db,
    models::job::{JobStatus, NewJob, SubmissionContext, Transition},
    services::{
        ledger::{JobLedger, LedgerError, PgJobLedger},
        queue::{JobDispatcher, JobQueue, QueuedJob},
        storage::{image_key, ImageStore, R2Client},
    },
};
use uuid::Uuid;

/// Integration test: ledger, object store and queue against real backends.
///
/// Requires PostgreSQL, Redis and an R2 bucket configured via environment
/// variables (see `AppConfig`).
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");
    let ledger = PgJobLedger::new(db_pool);

    let images = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize queue");

    // Object store round trip
    let job_id = Uuid::new_v4();
    let key = image_key(job_id, "jpg");
    images
        .put(&key, b"integration image", "image/jpeg")
        .await
        .expect("Upload failed");
    assert!(images.exists(&key).await.unwrap());
    assert_eq!(images.get(&key).await.unwrap(), b"integration image");

    // Ledger: idempotent create
    let idempotency_key = format!("integration-{job_id}");
    let new_job = NewJob {
        id: job_id,
        idempotency_key: idempotency_key.clone(),
        image_ref: key.clone(),
        content_type: "image/jpeg".to_string(),
        context: SubmissionContext::for_user(format!("integration-user-{job_id}")),
    };
    let (job, created) = ledger.create_if_absent(new_job.clone()).await.unwrap();
    assert!(created);
    assert_eq!(job.status, JobStatus::Pending);

    let (again, created) = ledger
        .create_if_absent(NewJob {
            id: Uuid::new_v4(),
            ..new_job
        })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(again.id, job_id);

    let owned = ledger
        .list_by_user(&format!("integration-user-{job_id}"), 10)
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, job_id);

    // Ledger: compare-and-set
    let claimed = ledger
        .compare_and_set_status(job_id, JobStatus::Pending, JobStatus::Processing, Transition::fenced(0))
        .await
        .unwrap();
    assert!(claimed.processing_started_at.is_some());

    let conflict = ledger
        .compare_and_set_status(job_id, JobStatus::Pending, JobStatus::Processing, Transition::fenced(0))
        .await
        .unwrap_err();
    assert!(matches!(conflict, LedgerError::Conflict { .. }));

    let requeued = ledger
        .compare_and_set_status(
            job_id,
            JobStatus::Processing,
            JobStatus::Pending,
            Transition::fenced(0).with_attempt_count(1),
        )
        .await
        .unwrap();
    assert_eq!(requeued.attempt_count, 1);

    // Queue
    queue.health_check().await.expect("Redis unreachable");
    queue.dispatch(job_id).await.expect("Enqueue failed");
    let message = queue.dequeue().await.unwrap();
    assert!(message.is_some());
    queue.complete(&message.unwrap()).await.unwrap();

    // Delayed delivery: nothing is promoted before the due time.
    let now = chrono::Utc::now();
    let delayed = QueuedJob { job_id };
    queue
        .schedule(&delayed, now + chrono::Duration::seconds(3600))
        .await
        .unwrap();
    assert_eq!(queue.promote_due(now).await.unwrap(), 0);
    queue.schedule(&delayed, now).await.unwrap();
    assert!(queue.promote_due(now).await.unwrap() >= 1);
    let promoted = queue.dequeue().await.unwrap().expect("promoted message");
    queue.complete(&promoted).await.unwrap();

    // Cleanup
    images.delete(&key).await.expect("Delete failed");
    assert!(!images.exists(&key).await.unwrap());
}
