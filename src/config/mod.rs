use serde::Deserialize;
use std::time::Duration;

use crate::services::inference::RetryPolicy;
use crate::services::orchestrator::OrchestratorSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job ledger
    pub database_url: String,

    /// Redis connection string for the dispatch queue
    pub redis_url: String,

    /// R2 bucket name for uploaded images
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Base URL of the detection/ripeness inference service
    pub inference_endpoint: String,

    /// Timeout for a single inference HTTP call, in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Transport-level retries inside one inference attempt
    #[serde(default = "default_inference_max_retries")]
    pub inference_max_retries: u32,

    /// Inference attempts per job before it is failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Largest accepted upload, in megabytes
    #[serde(default = "default_max_upload_size_mb")]
    pub max_upload_size_mb: usize,

    /// Upper bound on one processing attempt, in seconds
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,

    /// Age after which a processing job is treated as abandoned, or a pending
    /// job as undispatched, in seconds
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Delay before a job's second attempt, doubling afterwards, in seconds
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Ceiling on the delay between attempts, in seconds
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Worker poll interval when the queue is empty, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Interval between stale-job sweeps in the worker, in seconds
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_inference_max_retries() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_upload_size_mb() -> usize {
    10
}

fn default_processing_timeout_secs() -> u64 {
    120
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_retry_base_delay_secs() -> u64 {
    10
}

fn default_retry_max_delay_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that `envy` cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.inference_max_retries >= self.max_attempts {
            return Err(ConfigError::Invalid(format!(
                "INFERENCE_MAX_RETRIES ({}) must be smaller than MAX_ATTEMPTS ({})",
                self.inference_max_retries, self.max_attempts
            )));
        }
        if self.inference_timeout_secs == 0 || self.processing_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.stale_after_secs <= self.processing_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "STALE_AFTER_SECS ({}) must exceed PROCESSING_TIMEOUT_SECS ({})",
                self.stale_after_secs, self.processing_timeout_secs
            )));
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "RETRY_BASE_DELAY_SECS ({}) must not exceed RETRY_MAX_DELAY_SECS ({})",
                self.retry_base_delay_secs, self.retry_max_delay_secs
            )));
        }
        if self.max_upload_size_mb == 0 {
            return Err(ConfigError::Invalid("MAX_UPLOAD_SIZE_MB must be positive".into()));
        }
        Ok(())
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_upload_size_mb * 1024 * 1024
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.inference_max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_attempts: self.max_attempts,
            max_image_bytes: self.max_image_bytes(),
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            retry_base_delay: Duration::from_secs(self.retry_base_delay_secs),
            retry_max_delay: Duration::from_secs(self.retry_max_delay_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
