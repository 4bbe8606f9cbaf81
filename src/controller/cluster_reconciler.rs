//! Reconciliation logic for MySQLCluster resources
//!
//! One pass: fetch the cluster, validate it, take a snapshot, plan, execute
//! the first planned action, then derive phase and status from what was
//! observed. Further work is left to the next pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::api::{EventRecord, OperatorApi};
use crate::controller::cluster_state_machine::{TransitionContext, next_phase};
use crate::controller::context::Context;
use crate::controller::error::{Error, ErrorClass, Result};
use crate::controller::executor::{self, ActionOutcome};
use crate::controller::observed;
use crate::controller::planner::{self, assess_health};
use crate::controller::single_flight::resource_key;
use crate::controller::status::{
    ClusterObservation, StatusWrite, compute_cluster_status, failed_cluster_status, spec_changed,
    write_cluster_status,
};
use crate::controller::validation::{
    validate_cluster_spec, validate_storage_class_change, validate_version_change,
};
use crate::crd::{ClusterPhase, MySQLCluster, MySQLClusterStatus};
use crate::resources::statefulset::existing_storage_class;

/// Kind used in lock keys, metrics and logs
pub const CLUSTER_KIND: &str = "MySQLCluster";

/// Delay before retrying a pass that was aborted by a concurrent spec change
const ABORTED_PASS_REQUEUE: Duration = Duration::from_secs(1);

/// What one pass did
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub requeue: Action,
    /// Phase written to status; `None` when the cluster is gone
    pub phase: Option<ClusterPhase>,
    /// Name and outcome of the action executed this pass
    pub executed: Option<(&'static str, ActionOutcome)>,
    pub status_write: Option<StatusWrite>,
    pub ready_members: i32,
}

impl PassOutcome {
    fn idle(requeue: Action) -> Self {
        Self {
            requeue,
            phase: None,
            executed: None,
            status_write: None,
            ready_members: 0,
        }
    }
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<MySQLCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();
    let key = resource_key(CLUSTER_KIND, &ns, &name);

    let _guard = ctx.locks.acquire(&key).await;
    debug!("Reconciling MySQLCluster");

    let result = run_pass(ctx.api.as_ref(), &ns, &name, &ctx.config).await;

    if let Some(health) = &ctx.health_state {
        let metrics = &health.metrics;
        match &result {
            Ok(outcome) => {
                metrics.record_reconcile(CLUSTER_KIND, &ns, &name, start.elapsed().as_secs_f64());
                metrics.set_cluster_phase(&ns, &name, outcome.phase);
                if outcome.phase.is_some() {
                    metrics.set_cluster_replicas(
                        &ns,
                        &name,
                        i64::from(cluster.spec.replicas),
                        i64::from(outcome.ready_members),
                    );
                }
                if let Some((action, _)) = &outcome.executed {
                    metrics.record_action(action);
                }
                health.touch();
            }
            Err(_) => metrics.record_error(CLUSTER_KIND, &ns, &name),
        }
    }

    let outcome = result?;
    ctx.retries.reset(&key);
    Ok(outcome.requeue)
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<MySQLCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = resource_key(
        CLUSTER_KIND,
        &cluster.namespace().unwrap_or_default(),
        &cluster.name_any(),
    );
    policy_for(&key, error, &ctx)
}

/// Requeue decision shared by both controllers
pub(crate) fn policy_for(key: &str, error: &Error, ctx: &Context) -> Action {
    match error.class() {
        ErrorClass::Transient => {
            let attempt = ctx.retries.record_failure(key);
            let delay = ctx.backoff.delay_for_attempt(attempt);
            warn!(key = %key, attempt, error = %error, "Retryable error, requeuing in {:?}", delay);
            Action::requeue(delay)
        }
        ErrorClass::Terminal => {
            error!(key = %key, error = %error, "Non-retryable error, waiting for a change");
            Action::await_change()
        }
        ErrorClass::Fatal => {
            error!(key = %key, error = %error, "Fatal error");
            if let Some(health) = ctx.health_state.clone() {
                tokio::spawn(async move { health.set_ready(false).await });
            }
            Action::await_change()
        }
    }
}

/// Checks that need the live StatefulSet or previous status
async fn validate_against_existing<A: OperatorApi + ?Sized>(
    api: &A,
    cluster: &MySQLCluster,
    ns: &str,
) -> Result<()> {
    validate_cluster_spec(&cluster.spec)?;

    if let Some(sts) = api.get_statefulset(ns, &cluster.name_any()).await? {
        validate_storage_class_change(
            existing_storage_class(&sts),
            cluster.spec.storage.storage_class.as_deref(),
        )?;
    }
    if let Some(current) = cluster
        .status
        .as_ref()
        .and_then(|s| s.current_version.as_deref())
    {
        validate_version_change(current, &cluster.spec.version)?;
    }
    Ok(())
}

/// Run one reconciliation pass for the cluster `ns/name`
///
/// The cluster is re-read at the start so a pass always works from the
/// latest spec, never from a cached trigger object.
pub async fn run_pass<A: OperatorApi + ?Sized>(
    api: &A,
    ns: &str,
    name: &str,
    config: &OperatorConfig,
) -> Result<PassOutcome> {
    let Some(cluster) = api.get_cluster(ns, name).await? else {
        debug!("MySQLCluster no longer exists");
        return Ok(PassOutcome::idle(Action::await_change()));
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        // Owned objects are garbage-collected through owner references
        debug!("MySQLCluster is being deleted");
        return Ok(PassOutcome::idle(Action::await_change()));
    }

    let reference = cluster.object_ref(&());
    let current_phase = cluster
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();
    let changed = spec_changed(&cluster);

    match validate_against_existing(api, &cluster, ns).await {
        Ok(()) => {}
        Err(Error::ValidationError(message)) | Err(Error::InvalidConfig(message)) => {
            warn!(error = %message, "MySQLCluster spec is invalid");
            let transition = TransitionContext {
                desired_members: cluster.spec.replicas,
                spec_changed: changed,
                validation_error: Some(message.clone()),
                ..Default::default()
            };
            let (phase, event) = next_phase(current_phase, &transition);
            if phase != current_phase {
                info!(from = %current_phase, to = %phase, event = %event, "Cluster phase changed");
            }
            let status = MySQLClusterStatus {
                phase,
                ..failed_cluster_status(&cluster, &message)
            };
            let write = write_cluster_status(api, &cluster, &status).await?;
            if current_phase != ClusterPhase::Failed || changed {
                api.publish_event(
                    &reference,
                    EventRecord::warning("InvalidSpec", "Validate", message),
                )
                .await;
            }
            return Ok(PassOutcome {
                requeue: Action::await_change(),
                phase: Some(phase),
                executed: None,
                status_write: Some(write),
                ready_members: status.ready_replicas,
            });
        }
        Err(e) => return Err(e),
    }

    if current_phase == ClusterPhase::Failed && !changed {
        debug!("MySQLCluster failed and spec unchanged, waiting for a change");
        return Ok(PassOutcome {
            phase: Some(ClusterPhase::Failed),
            ..PassOutcome::idle(Action::await_change())
        });
    }

    let snapshot = observed::collect(api, &cluster).await?;
    let actions = planner::plan(&cluster, &snapshot);

    let mut executed = None;
    if let Some(action) = actions.first() {
        if action.is_destructive() && generation_moved(api, &cluster, ns, name).await? {
            info!(action = action.name(), "Spec changed during pass, aborting before destructive action");
            return Ok(PassOutcome::idle(Action::requeue(ABORTED_PASS_REQUEUE)));
        }

        let outcome = executor::execute(api, &cluster, action).await?;
        if let Some(event) = executor::event_for(action, &outcome) {
            api.publish_event(&reference, event).await;
        }
        executed = Some((action.name(), outcome));
    }

    let health = assess_health(&cluster, &snapshot);
    let work_remaining = !actions.is_empty();
    let transition = TransitionContext {
        ready_members: health.ready_members,
        desired_members: cluster.spec.replicas,
        healthy: health.healthy && !work_remaining,
        work_remaining,
        spec_changed: changed,
        validation_error: None,
    };
    let (phase, event) = next_phase(current_phase, &transition);

    let action_error = match &executed {
        Some((_, ActionOutcome::Failed(reason))) => Some(reason.clone()),
        _ => None,
    };
    let status = compute_cluster_status(
        &cluster,
        &ClusterObservation {
            phase,
            snapshot: &snapshot,
            health: &health,
            pending: actions.first(),
            action_error,
        },
    );
    let write = write_cluster_status(api, &cluster, &status).await?;

    if phase != current_phase {
        info!(from = %current_phase, to = %phase, event = %event, "Cluster phase changed");
        let note = format!("{} -> {} ({})", current_phase, phase, health.summary());
        let record = match phase {
            ClusterPhase::Degraded | ClusterPhase::Failed => {
                EventRecord::warning("PhaseChanged", "Reconcile", note)
            }
            _ => EventRecord::normal("PhaseChanged", "Reconcile", note),
        };
        api.publish_event(&reference, record).await;
    }

    let requeue = if work_remaining || !health.healthy {
        Action::requeue(config.requeue_progress)
    } else {
        Action::requeue(config.requeue_ready)
    };

    Ok(PassOutcome {
        requeue,
        phase: Some(phase),
        executed,
        status_write: Some(write),
        ready_members: health.ready_members,
    })
}

async fn generation_moved<A: OperatorApi + ?Sized>(
    api: &A,
    cluster: &MySQLCluster,
    ns: &str,
    name: &str,
) -> Result<bool> {
    let fresh = api.get_cluster(ns, name).await?;
    Ok(fresh.is_none_or(|f| f.metadata.generation != cluster.metadata.generation))
}
