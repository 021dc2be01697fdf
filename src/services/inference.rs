use async_trait::async_trait;
use base64::Engine;
use garde::Validate;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::models::detection::{BoundingBox, Detection, DetectionResult, RipenessStage};

/// Remote vision-inference capability.
///
/// Every error leaving an implementation is already classified as retryable
/// or fatal; callers never see transport errors.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        image: &[u8],
        content_type: &str,
        request_id: &str,
    ) -> Result<DetectionResult, InferenceError>;

    /// Liveness check of the remote service.
    async fn health_check(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}

/// Local retry budget for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first call
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No local retries; every failure surfaces immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): exponential backoff with
    /// ±20% jitter, capped at `max_delay`. A server `Retry-After` wins when present.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(server_delay) = retry_after {
            return server_delay.min(self.max_delay);
        }

        let exponent = attempt.min(16) as i32;
        let base_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let ms = (capped * jitter).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    image: String,
    content_type: &'a str,
    request_id: &'a str,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    results: Vec<ServiceDetection>,
    #[serde(default)]
    summary: Option<ServiceSummary>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ServiceDetection {
    #[serde(alias = "class")]
    class_name: String,
    confidence: f64,
    bounding_box: Vec<f64>,
    #[serde(default)]
    maturation_level: Option<MaturationLevel>,
}

#[derive(Deserialize)]
struct MaturationLevel {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    estimated_days_until_spoilage: Option<u32>,
}

#[derive(Deserialize)]
struct ServiceSummary {
    #[serde(default)]
    detection_time_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// HTTP client for the fruit detection/ripeness service.
pub struct HttpInferenceClient {
    http: Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpInferenceClient {
    /// `request_timeout` bounds every individual HTTP call.
    pub fn new(
        endpoint: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(5)))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn call_once(
        &self,
        image: &[u8],
        content_type: &str,
        request_id: &str,
    ) -> Result<DetectionResult, (InferenceError, Option<Duration>)> {
        let body = AnalyzeRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            content_type,
            request_id,
        };

        let response = self
            .http
            .post(format!("{}/analyze", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| (classify_transport(e), None))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err((classify_status(status, &text), retry_after));
        }

        let text = response
            .text()
            .await
            .map_err(|e| (classify_transport(e), None))?;
        parse_success(&text).map_err(|e| (e, None))
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceClient {
    async fn infer(
        &self,
        image: &[u8],
        content_type: &str,
        request_id: &str,
    ) -> Result<DetectionResult, InferenceError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let outcome = self.call_once(image, content_type, request_id).await;
            metrics::histogram!("inference_call_seconds").record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(result) => return Ok(result),
                Err((err, retry_after)) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, retry_after);
                    tracing::warn!(
                        request_id = %request_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Inference call failed, retrying"
                    );
                    metrics::counter!("inference_client_retries_total").increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        let response = self
            .http
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Retryable {
                reason: format!("health check returned {}", response.status()),
            })
        }
    }
}

fn classify_transport(error: reqwest::Error) -> InferenceError {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    InferenceError::Retryable {
        reason: format!("inference endpoint {kind}: {error}"),
    }
}

/// Transient statuses are retryable; any other rejection is final.
fn classify_status(status: StatusCode, body: &str) -> InferenceError {
    let parsed: Option<ErrorResponse> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|e| e.error_message.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status.as_u16() {
        408 | 425 | 429 | 500..=599 => InferenceError::Retryable {
            reason: format!("inference endpoint returned {status}: {message}"),
        },
        _ => InferenceError::Fatal {
            code: parsed
                .and_then(|e| e.error_code)
                .unwrap_or_else(|| format!("http_{}", status.as_u16())),
            reason: message,
        },
    }
}

fn parse_success(body: &str) -> Result<DetectionResult, InferenceError> {
    let response: AnalyzeResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::Retryable {
            reason: format!("malformed inference response: {e}"),
        })?;

    if response.status.as_deref() == Some("error") {
        return Err(InferenceError::Fatal {
            code: response.error_code.unwrap_or_else(|| "rejected".to_string()),
            reason: response
                .error_message
                .unwrap_or_else(|| "inference service rejected the image".to_string()),
        });
    }

    let detections = response
        .results
        .into_iter()
        .map(into_detection)
        .collect::<Result<Vec<_>, _>>()?;

    let result = DetectionResult::new(
        response.request_id,
        detections,
        response.summary.and_then(|s| s.detection_time_ms),
    );

    result.validate().map_err(|report| InferenceError::Retryable {
        reason: format!("inference response out of range: {report}"),
    })?;

    Ok(result)
}

fn into_detection(d: ServiceDetection) -> Result<Detection, InferenceError> {
    let &[x, y, width, height] = d.bounding_box.as_slice() else {
        return Err(InferenceError::Retryable {
            reason: format!(
                "bounding box for {} has {} coordinates, expected 4",
                d.class_name,
                d.bounding_box.len()
            ),
        });
    };

    let (ripeness, ripeness_score, days_until_spoilage) = match d.maturation_level {
        Some(level) => {
            let stage = level.category.as_deref().and_then(|label| {
                let stage = RipenessStage::from_label(label);
                if stage.is_none() {
                    tracing::debug!(label = %label, "Unrecognised ripeness category");
                }
                stage
            });
            (stage, level.score, level.estimated_days_until_spoilage)
        }
        None => (None, None, None),
    };

    Ok(Detection {
        class_name: d.class_name,
        confidence: d.confidence,
        bounding_box: BoundingBox {
            x,
            y,
            width,
            height,
        },
        ripeness,
        ripeness_score,
        days_until_spoilage,
    })
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum InferenceError {
    /// Transport failure, timeout or transient server error.
    #[error("Retryable inference error: {reason}")]
    Retryable { reason: String },

    /// Well-formed rejection of the image by the service.
    #[error("Fatal inference error ({code}): {reason}")]
    Fatal { code: String, reason: String },
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InferenceError::Retryable { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            InferenceError::Retryable { reason } | InferenceError::Fatal { reason, .. } => reason,
        }
    }
}
