//! Shared test doubles and builders for the orchestrator and route tests.
#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use fruit_inference_jobs::models::detection::DetectionResult;
use fruit_inference_jobs::services::{
    inference::{InferenceBackend, InferenceError},
    memory::{MemoryImageStore, MemoryJobLedger},
    orchestrator::{JobOrchestrator, OrchestratorSettings},
    queue::{JobDispatcher, QueueError},
};

pub fn encode_image(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 3) as u8, (y * 11) as u8, 140]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn jpeg_bytes() -> Vec<u8> {
    encode_image(ImageFormat::Jpeg, 64, 48)
}

pub fn png_bytes() -> Vec<u8> {
    encode_image(ImageFormat::Png, 32, 32)
}

pub fn retryable(reason: &str) -> InferenceError {
    InferenceError::Retryable {
        reason: reason.to_string(),
    }
}

pub fn fatal(code: &str, reason: &str) -> InferenceError {
    InferenceError::Fatal {
        code: code.to_string(),
        reason: reason.to_string(),
    }
}

/// Inference backend that replays scripted outcomes, then repeats `fallback`.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<DetectionResult, InferenceError>>>,
    fallback: Result<DetectionResult, InferenceError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    healthy: AtomicBool,
}

impl ScriptedBackend {
    pub fn always(outcome: Result<DetectionResult, InferenceError>) -> Self {
        Self::sequence(Vec::new(), outcome)
    }

    pub fn sequence(
        script: Vec<Result<DetectionResult, InferenceError>>,
        fallback: Result<DetectionResult, InferenceError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Sleep this long inside every call before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn infer(
        &self,
        _image: &[u8],
        _content_type: &str,
        _request_id: &str,
    ) -> Result<DetectionResult, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(retryable("service down"))
        }
    }
}

/// Dispatcher that records job ids instead of queueing them.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<Uuid>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        let dispatcher = Self::default();
        dispatcher.failing.store(true, Ordering::SeqCst);
        dispatcher
    }

    pub fn dispatched(&self) -> Vec<Uuid> {
        self.dispatched.lock().unwrap().clone()
    }

    fn outage() -> QueueError {
        QueueError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job_id: Uuid) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.dispatched.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        Ok(())
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        Ok(self.dispatched.lock().unwrap().len() as u64)
    }
}

/// Orchestrator wired to in-memory adapters, with handles kept for assertions.
pub struct Harness {
    pub orchestrator: Arc<JobOrchestrator>,
    pub images: Arc<MemoryImageStore>,
    pub ledger: Arc<MemoryJobLedger>,
    pub backend: Arc<ScriptedBackend>,
}

impl Harness {
    pub fn new(backend: ScriptedBackend, settings: OrchestratorSettings) -> Self {
        let images = Arc::new(MemoryImageStore::new());
        let ledger = Arc::new(MemoryJobLedger::new());
        let backend = Arc::new(backend);
        let orchestrator = Arc::new(JobOrchestrator::new(
            images.clone(),
            ledger.clone(),
            backend.clone(),
            settings,
        ));
        Self {
            orchestrator,
            images,
            ledger,
            backend,
        }
    }

    pub fn with_backend(backend: ScriptedBackend) -> Self {
        Self::new(backend, test_settings())
    }
}

/// Default settings with short timeouts so failure paths finish quickly.
/// Retries are due immediately unless a test sets a delay.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_attempts: 3,
        processing_timeout: Duration::from_secs(5),
        stale_after: Duration::from_secs(30),
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
        ..OrchestratorSettings::default()
    }
}
