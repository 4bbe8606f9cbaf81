//! Operator configuration read from the process environment

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Default port of the health and metrics server
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default number of concurrent reconciliations per controller
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;

/// Default requeue interval for converged resources
pub const DEFAULT_REQUEUE_READY_SECS: u64 = 300;

/// Default requeue interval while work remains
pub const DEFAULT_REQUEUE_PROGRESS_SECS: u64 = 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("LOG_FORMAT must be \"text\" or \"json\", got {0:?}")]
    InvalidLogFormat(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Runtime configuration of the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Restrict watches to one namespace; cluster-wide when `None`
    pub watch_namespace: Option<String>,
    /// Identity used for leader election and event reporting
    pub pod_name: Option<String>,
    /// Namespace holding the leader election lease
    pub pod_namespace: String,
    pub health_port: u16,
    pub reconcile_concurrency: u16,
    pub requeue_ready: Duration,
    pub requeue_progress: Duration,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_name: None,
            pod_namespace: "default".to_string(),
            health_port: DEFAULT_HEALTH_PORT,
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            requeue_ready: Duration::from_secs(DEFAULT_REQUEUE_READY_SECS),
            requeue_progress: Duration::from_secs(DEFAULT_REQUEUE_PROGRESS_SECS),
            log_format: LogFormat::Text,
        }
    }
}

impl OperatorConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Read configuration from a set of variables
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        };

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            pod_name: get("POD_NAME"),
            pod_namespace: get("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
            health_port: parse_positive("HEALTH_PORT", get("HEALTH_PORT"), DEFAULT_HEALTH_PORT)?,
            reconcile_concurrency: parse_positive(
                "RECONCILE_CONCURRENCY",
                get("RECONCILE_CONCURRENCY"),
                DEFAULT_RECONCILE_CONCURRENCY,
            )?,
            requeue_ready: Duration::from_secs(parse_positive(
                "REQUEUE_READY_SECS",
                get("REQUEUE_READY_SECS"),
                DEFAULT_REQUEUE_READY_SECS,
            )?),
            requeue_progress: Duration::from_secs(parse_positive(
                "REQUEUE_PROGRESS_SECS",
                get("REQUEUE_PROGRESS_SECS"),
                DEFAULT_REQUEUE_PROGRESS_SECS,
            )?),
            log_format,
        })
    }
}

fn parse_positive<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed: T = value
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { name, value })?;
    if parsed == T::default() {
        return Err(ConfigError::Zero { name });
    }
    Ok(parsed)
}
