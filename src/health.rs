//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::crd::{BackupPhase, ClusterPhase};

/// Labels for per-resource metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ReconcileLabels {
    fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for phase metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Last known phase per resource, used to derive the by-phase gauges
#[derive(Default)]
struct PhaseIndex {
    phases: Mutex<HashMap<String, String>>,
}

impl PhaseIndex {
    /// Record a phase (or removal) and return the count for every phase seen
    fn update(&self, key: &str, phase: Option<&str>) -> HashMap<String, i64> {
        let mut phases = self
            .phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match phase {
            Some(phase) => {
                phases.insert(key.to_string(), phase.to_string());
            }
            None => {
                phases.remove(key);
            }
        }
        let mut counts = HashMap::new();
        for phase in phases.values() {
            *counts.entry(phase.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Executed planner actions by action name
    pub actions_total: Family<PhaseLabels, Counter>,

    // Fleet metrics
    /// Total clusters by phase
    pub clusters_total: Family<PhaseLabels, Gauge>,
    /// Total backups by phase
    pub backups_total: Family<PhaseLabels, Gauge>,
    /// Desired members per cluster
    pub cluster_replicas_desired: Family<ReconcileLabels, Gauge>,
    /// Ready members per cluster
    pub cluster_replicas_ready: Family<ReconcileLabels, Gauge>,

    cluster_phases: PhaseIndex,
    backup_phases: PhaseIndex,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "mysql_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "mysql_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "mysql_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let actions_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "mysql_operator_actions",
            "Total number of executed cluster actions, labelled by action",
            actions_total.clone(),
        );

        let clusters_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "mysql_operator_clusters_total",
            "Total number of MySQL clusters by phase",
            clusters_total.clone(),
        );

        let backups_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "mysql_operator_backups_total",
            "Total number of MySQL backups by phase",
            backups_total.clone(),
        );

        let cluster_replicas_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "mysql_operator_cluster_replicas_desired",
            "Desired number of members for each cluster",
            cluster_replicas_desired.clone(),
        );

        let cluster_replicas_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "mysql_operator_cluster_replicas_ready",
            "Number of ready members for each cluster",
            cluster_replicas_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            actions_total,
            clusters_total,
            backups_total,
            cluster_replicas_desired,
            cluster_replicas_ready,
            cluster_phases: PhaseIndex::default(),
            backup_phases: PhaseIndex::default(),
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels::new(kind, namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: &str, namespace: &str, name: &str) {
        let labels = ReconcileLabels::new(kind, namespace, name);
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record an executed planner action
    pub fn record_action(&self, action: &str) {
        self.actions_total
            .get_or_create(&PhaseLabels {
                phase: action.to_string(),
            })
            .inc();
    }

    /// Record the current phase of a cluster; `None` forgets it
    pub fn set_cluster_phase(&self, namespace: &str, name: &str, phase: Option<ClusterPhase>) {
        let key = format!("{}/{}", namespace, name);
        let counts = self
            .cluster_phases
            .update(&key, phase.map(|p| p.to_string()).as_deref());
        for phase in ClusterPhase::ALL {
            let phase = phase.to_string();
            let count = counts.get(&phase).copied().unwrap_or(0);
            self.clusters_total
                .get_or_create(&PhaseLabels { phase })
                .set(count);
        }
    }

    /// Record the current phase of a backup; `None` forgets it
    pub fn set_backup_phase(&self, namespace: &str, name: &str, phase: Option<BackupPhase>) {
        let key = format!("{}/{}", namespace, name);
        let counts = self
            .backup_phases
            .update(&key, phase.map(|p| p.to_string()).as_deref());
        for phase in BackupPhase::ALL {
            let phase = phase.to_string();
            let count = counts.get(&phase).copied().unwrap_or(0);
            self.backups_total
                .get_or_create(&PhaseLabels { phase })
                .set(count);
        }
    }

    /// Update cluster member metrics
    pub fn set_cluster_replicas(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ReconcileLabels::new("MySQLCluster", namespace, name);
        self.cluster_replicas_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_replicas_ready
            .get_or_create(&labels)
            .set(ready);
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leader, controllers running)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile, seconds since the Unix epoch
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Stamp the time of the last successful reconcile
    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:<port>`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
