//! Error types for the MySQL controllers

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Command execution failed: {0}")]
    ExecError(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Fatal error: {0}")]
    FatalError(String),
}

/// How an error is handled by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with exponential backoff
    Transient,
    /// Surfaced in status, no automatic retry until the spec changes
    Terminal,
    /// Manager-level failure, propagated to process health
    Fatal,
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }

    /// Classify this error for retry handling
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) will not heal by retrying
                    if (400..500).contains(&code) && code != 409 && code != 429 {
                        ErrorClass::Terminal
                    } else {
                        ErrorClass::Transient
                    }
                }
                // Network and other transport errors are retryable
                _ => ErrorClass::Transient,
            },
            Error::TransientError(_) | Error::ExecError(_) => ErrorClass::Transient,
            Error::ValidationError(_)
            | Error::InvalidConfig(_)
            | Error::SerializationError(_)
            | Error::MissingObjectKey(_) => ErrorClass::Terminal,
            Error::FatalError(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}

/// Consecutive-failure counters keyed by resource
///
/// The controller's error policy only sees the failing object, so attempts
/// are counted here and reset once a pass for the same key succeeds.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the attempt number (0-based) it represents
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = attempts.entry(key.to_string()).or_insert(0);
        let attempt = *counter;
        *counter = counter.saturating_add(1);
        attempt
    }

    /// Forget failures for a key after a successful pass
    pub fn reset(&self, key: &str) {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        attempts.remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        let attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        attempts.get(key).copied().unwrap_or(0)
    }
}
