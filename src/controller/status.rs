//! Status and conditions management for MySQLCluster and MySQLBackup
//!
//! Status is computed from scratch each pass and written only when it differs
//! from what the API server holds. Writes are merge patches carrying the
//! object's `resourceVersion`, so a status computed from stale data loses the
//! race instead of overwriting newer state.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::api::OperatorApi;
use crate::controller::error::{Error, Result};
use crate::controller::observed::ClusterSnapshot;
use crate::controller::planner::{Action, HealthReport};
use crate::crd::{
    ClusterPhase, Condition, MemberStatus, MySQLBackup, MySQLBackupStatus, MySQLCluster,
    MySQLClusterStatus,
};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is ready to accept connections
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Cluster lost health after having been ready
    pub const DEGRADED: &str = "Degraded";
    /// Spec passed validation
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// Every replica replicates from the primary
    pub const REPLICATION_HEALTHY: &str = "ReplicationHealthy";
    /// Backup Job finished successfully
    pub const COMPLETE: &str = "Complete";
    /// Referenced cluster does not exist
    pub const CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// `lastTransitionTime` only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Drop a condition that no longer applies
    pub fn remove(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            bool_status(is_degraded),
            reason,
            message,
        )
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::CONFIG_VALID,
            bool_status(is_valid),
            reason,
            message,
        )
    }

    pub fn replication_healthy(self, is_healthy: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::REPLICATION_HEALTHY,
            bool_status(is_healthy),
            reason,
            message,
        )
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether `metadata.generation` moved past the last observed generation
pub fn spec_changed(cluster: &MySQLCluster) -> bool {
    let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
    observed != cluster.metadata.generation
}

fn phase_started_at(previous: Option<&MySQLClusterStatus>, phase: ClusterPhase) -> Option<String> {
    match previous {
        Some(prev) if prev.phase == phase && prev.phase_started_at.is_some() => {
            prev.phase_started_at.clone()
        }
        _ => Some(Utc::now().to_rfc3339()),
    }
}

/// Everything a pass learned that feeds the cluster status
pub struct ClusterObservation<'a> {
    pub phase: ClusterPhase,
    pub snapshot: &'a ClusterSnapshot,
    pub health: &'a HealthReport,
    /// First action still planned after this pass, if any
    pub pending: Option<&'a Action>,
    /// Failure reported by the action executed this pass
    pub action_error: Option<String>,
}

/// Compute the status of a cluster after a successful pass
pub fn compute_cluster_status(
    cluster: &MySQLCluster,
    observation: &ClusterObservation<'_>,
) -> MySQLClusterStatus {
    let previous = cluster.status.as_ref();
    let generation = cluster.metadata.generation;
    let phase = observation.phase;
    let health = observation.health;

    let existing = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let (progress_reason, progress_message) = match observation.pending {
        Some(action) => (action.name().to_string(), action.describe()),
        None => ("Stable".to_string(), "No pending actions".to_string()),
    };
    let replication_message = if health.replication_healthy {
        "All replicas replicate from the primary".to_string()
    } else {
        health.summary()
    };

    let conditions = ConditionBuilder::from_existing(existing, generation)
        .config_valid(true, "Valid", "Spec is valid")
        .ready(
            phase == ClusterPhase::Ready,
            if phase == ClusterPhase::Ready {
                "ClusterReady"
            } else {
                "NotReady"
            },
            &health.summary(),
        )
        .progressing(
            observation.pending.is_some(),
            &progress_reason,
            &progress_message,
        )
        .degraded(
            phase == ClusterPhase::Degraded,
            if phase == ClusterPhase::Degraded {
                "HealthLost"
            } else {
                "Healthy"
            },
            &health.summary(),
        )
        .replication_healthy(
            health.replication_healthy,
            if health.replication_healthy {
                "Replicating"
            } else {
                "ReplicationBroken"
            },
            &replication_message,
        )
        .build();

    let last_error = if phase == ClusterPhase::Ready {
        None
    } else {
        observation
            .action_error
            .clone()
            .or_else(|| previous.and_then(|s| s.last_error.clone()))
    };

    let current_version = if phase == ClusterPhase::Ready {
        Some(cluster.spec.version.clone())
    } else {
        previous.and_then(|s| s.current_version.clone())
    };

    MySQLClusterStatus {
        phase,
        ready_replicas: health.ready_members,
        replicas: cluster.spec.replicas,
        primary: health.primary.clone(),
        members: observation
            .snapshot
            .members
            .iter()
            .map(|m| MemberStatus {
                name: m.name.clone(),
                ordinal: m.ordinal,
                ready: m.ready,
                role: m.role,
            })
            .collect(),
        observed_generation: generation,
        conditions,
        phase_started_at: phase_started_at(previous, phase),
        last_error,
        current_version,
    }
}

/// Status for a cluster whose spec cannot be reconciled
///
/// Topology fields are carried over from the previous status; nothing about
/// the running members was observed.
pub fn failed_cluster_status(cluster: &MySQLCluster, message: &str) -> MySQLClusterStatus {
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;

    let conditions = ConditionBuilder::from_existing(previous.conditions.clone(), generation)
        .config_valid(false, "InvalidSpec", message)
        .ready(false, "InvalidSpec", message)
        .progressing(false, "InvalidSpec", "Waiting for a spec change")
        .build();

    MySQLClusterStatus {
        phase: ClusterPhase::Failed,
        replicas: cluster.spec.replicas,
        observed_generation: generation,
        conditions,
        phase_started_at: phase_started_at(cluster.status.as_ref(), ClusterPhase::Failed),
        last_error: Some(message.to_string()),
        ..previous
    }
}

/// What happened to a status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    /// The stored status already matched
    Unchanged,
    /// The stored status was computed from a newer generation
    Stale,
    /// The object no longer exists
    Gone,
}

/// Write the cluster status if it changed
///
/// The patch is conditioned on the resourceVersion of `cluster`, the copy the
/// pass worked from. Any write that landed since then fails the patch with a
/// conflict, surfaced as a transient error.
pub async fn write_cluster_status<A: OperatorApi + ?Sized>(
    api: &A,
    cluster: &MySQLCluster,
    status: &MySQLClusterStatus,
) -> Result<StatusWrite> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();

    let Some(fresh) = api.get_cluster(&ns, &name).await? else {
        return Ok(StatusWrite::Gone);
    };

    let stored_generation = fresh.status.as_ref().and_then(|s| s.observed_generation);
    if is_stale(stored_generation, cluster.metadata.generation) {
        debug!(name = %name, ?stored_generation, "Status holds a newer generation, not writing");
        return Ok(StatusWrite::Stale);
    }
    if fresh.status.as_ref() == Some(status) {
        return Ok(StatusWrite::Unchanged);
    }

    api.patch_cluster_status(&ns, &name, cluster.resource_version(), status)
        .await
        .map_err(conflict_is_transient)?;
    debug!(name = %name, phase = %status.phase, "Updated cluster status");
    Ok(StatusWrite::Written)
}

/// Write the backup status if it changed, conditioned like
/// [`write_cluster_status`] on the resourceVersion the pass read
pub async fn write_backup_status<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    status: &MySQLBackupStatus,
) -> Result<StatusWrite> {
    let ns = backup
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = backup.name_any();

    let Some(fresh) = api.get_backup(&ns, &name).await? else {
        return Ok(StatusWrite::Gone);
    };

    let stored_generation = fresh.status.as_ref().and_then(|s| s.observed_generation);
    if is_stale(stored_generation, backup.metadata.generation) {
        return Ok(StatusWrite::Stale);
    }
    if fresh.status.as_ref() == Some(status) {
        return Ok(StatusWrite::Unchanged);
    }

    api.patch_backup_status(&ns, &name, backup.resource_version(), status)
        .await
        .map_err(conflict_is_transient)?;
    debug!(name = %name, phase = %status.phase, "Updated backup status");
    Ok(StatusWrite::Written)
}

fn is_stale(stored: Option<i64>, reconciled: Option<i64>) -> bool {
    matches!((stored, reconciled), (Some(stored), Some(reconciled)) if stored > reconciled)
}

fn conflict_is_transient(e: Error) -> Error {
    if e.is_conflict() {
        Error::TransientError(format!("status update conflict: {}", e))
    } else {
        e
    }
}
