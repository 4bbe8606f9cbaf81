use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::api::{KubeOperatorApi, OperatorApi};
use crate::controller::error::{BackoffConfig, RetryTracker};
use crate::controller::single_flight::KeyedLocks;
use crate::health::HealthState;

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Every read and write goes through this seam
    pub api: Arc<dyn OperatorApi>,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    /// One pass per resource key at a time
    pub locks: Arc<KeyedLocks>,
    /// Consecutive failures per resource key
    pub retries: Arc<RetryTracker>,
    pub backoff: BackoffConfig,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: OperatorConfig,
    ) -> Self {
        let api = KubeOperatorApi::new(client, config.pod_name.clone());
        Self::with_api(Arc::new(api), config).with_health_state(health_state)
    }

    /// Context over any [`OperatorApi`] implementation
    pub fn with_api(api: Arc<dyn OperatorApi>, config: OperatorConfig) -> Self {
        Self {
            api,
            health_state: None,
            locks: Arc::new(KeyedLocks::new()),
            retries: Arc::new(RetryTracker::new()),
            backoff: BackoffConfig::default(),
            config,
        }
    }

    pub fn with_health_state(mut self, health_state: Option<Arc<HealthState>>) -> Self {
        self.health_state = health_state;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}
