//! Execution of planned actions
//!
//! Every action is safe to repeat: managed objects are compared by their
//! spec-hash annotation before anything is written, and the SQL issued in
//! member pods converges to the same server state when run twice.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::api::{EventRecord, ManagedObject, OperatorApi};
use crate::controller::error::{Error, Result};
use crate::controller::observed::mysql_command;
use crate::controller::planner::Action;
use crate::crd::{MemberRole, MySQLCluster};
use crate::resources::common::{MYSQL_PORT, ROLE_LABEL, existing_spec_hash};
use crate::resources::secret::{REPLICATION_PASSWORD_KEY, REPLICATION_USER_KEY};
use crate::resources::statefulset::MYSQL_CONTAINER;

/// Statements that turn a member into a writable source
pub const ENABLE_WRITES_SQL: &str = "STOP REPLICA; RESET REPLICA ALL; \
     SET GLOBAL super_read_only = OFF; SET GLOBAL read_only = OFF;";

/// Statements that stop a member from accepting writes
pub const FENCE_SQL: &str = "SET GLOBAL super_read_only = ON;";

/// Result of executing one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action changed cluster state
    Applied,
    /// Observed state already matched; nothing was written
    NoOpAlreadySatisfied,
    /// The action ran but was rejected inside a member pod
    Failed(String),
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied)
    }
}

/// Statements that make a member replicate from `source_host` using GTID
/// auto-positioning
pub fn change_source_sql(source_host: &str) -> String {
    format!(
        "SET GLOBAL super_read_only = ON; STOP REPLICA; \
         CHANGE REPLICATION SOURCE TO SOURCE_HOST='{host}', SOURCE_PORT={port}, \
         SOURCE_USER='${{{user}}}', SOURCE_PASSWORD='${{{password}}}', \
         SOURCE_AUTO_POSITION=1, GET_SOURCE_PUBLIC_KEY=1; START REPLICA;",
        host = source_host,
        port = MYSQL_PORT,
        user = REPLICATION_USER_KEY,
        password = REPLICATION_PASSWORD_KEY,
    )
}

/// Execute a single action against the cluster
///
/// API failures propagate for retry classification. A statement rejected by
/// mysqld is reported as [`ActionOutcome::Failed`].
pub async fn execute<A: OperatorApi + ?Sized>(
    api: &A,
    cluster: &MySQLCluster,
    action: &Action,
) -> Result<ActionOutcome> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    debug!(action = action.name(), detail = %action.describe(), "Executing action");

    match action {
        Action::Apply(object) | Action::ApplyStatefulSet { object, .. } => {
            apply_object(api, &ns, object).await
        }
        Action::LabelMember { pod, role } => {
            api.label_pod(&ns, pod, ROLE_LABEL, role.label_value())
                .await?;
            info!(pod = %pod, role = role.label_value(), "Labelled member");
            Ok(ActionOutcome::Applied)
        }
        Action::EnableWrites { pod } => run_sql(api, &ns, pod, ENABLE_WRITES_SQL).await,
        Action::ConfigureReplication { pod, source_host } => {
            run_sql(api, &ns, pod, &change_source_sql(source_host)).await
        }
        Action::PromoteReplica { pod, previous } => promote(api, &ns, pod, previous.as_deref()).await,
    }
}

async fn apply_object<A: OperatorApi + ?Sized>(
    api: &A,
    ns: &str,
    object: &ManagedObject,
) -> Result<ActionOutcome> {
    let name = object.name();
    let satisfied = match object {
        // Credentials are generated once and never rotated by the operator
        ManagedObject::Secret(_) => api.get_secret(ns, &name).await?.is_some(),
        ManagedObject::ConfigMap(desired) => {
            same_hash(api.get_config_map(ns, &name).await?.as_ref(), desired)
        }
        ManagedObject::Service(desired) => {
            same_hash(api.get_service(ns, &name).await?.as_ref(), desired)
        }
        ManagedObject::PodDisruptionBudget(desired) => {
            same_hash(api.get_pdb(ns, &name).await?.as_ref(), desired)
        }
        ManagedObject::StatefulSet(desired) => {
            same_hash(api.get_statefulset(ns, &name).await?.as_ref(), desired)
        }
    };

    if satisfied {
        debug!(kind = object.kind(), name = %name, "Already up to date");
        return Ok(ActionOutcome::NoOpAlreadySatisfied);
    }

    api.apply(ns, object).await?;
    info!(kind = object.kind(), name = %name, "Applied object");
    Ok(ActionOutcome::Applied)
}

fn same_hash<K: kube::Resource>(existing: Option<&K>, desired: &K) -> bool {
    match (existing.and_then(existing_spec_hash), existing_spec_hash(desired)) {
        (Some(current), Some(wanted)) => current == wanted,
        _ => false,
    }
}

async fn run_sql<A: OperatorApi + ?Sized>(
    api: &A,
    ns: &str,
    pod: &str,
    sql: &str,
) -> Result<ActionOutcome> {
    match api.exec(ns, pod, MYSQL_CONTAINER, mysql_command(sql)).await {
        Ok(_) => Ok(ActionOutcome::Applied),
        Err(Error::ExecError(reason)) => {
            warn!(pod = %pod, reason = %reason, "Statement rejected");
            Ok(ActionOutcome::Failed(reason))
        }
        Err(e) => Err(e),
    }
}

async fn promote<A: OperatorApi + ?Sized>(
    api: &A,
    ns: &str,
    pod: &str,
    previous: Option<&str>,
) -> Result<ActionOutcome> {
    if let Some(previous) = previous {
        // The old primary is usually unreachable here; promotion goes ahead
        match run_sql(api, ns, previous, FENCE_SQL).await {
            Ok(ActionOutcome::Failed(reason)) => {
                debug!(pod = %previous, reason = %reason, "Previous primary rejected fencing");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(pod = %previous, error = %e, "Could not reach previous primary to fence it");
            }
        }
    }

    if let ActionOutcome::Failed(reason) = run_sql(api, ns, pod, ENABLE_WRITES_SQL).await? {
        return Ok(ActionOutcome::Failed(reason));
    }

    if let Some(previous) = previous {
        match api
            .label_pod(ns, previous, ROLE_LABEL, MemberRole::Replica.label_value())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    api.label_pod(ns, pod, ROLE_LABEL, MemberRole::Primary.label_value())
        .await?;

    info!(pod = %pod, previous = ?previous, "Promoted replica to primary");
    Ok(ActionOutcome::Applied)
}

/// Event to publish for an executed action, if any
pub fn event_for(action: &Action, outcome: &ActionOutcome) -> Option<EventRecord> {
    match (action, outcome) {
        (_, ActionOutcome::Failed(reason)) => Some(EventRecord::warning(
            "ActionFailed",
            action.name(),
            format!("{}: {}", action.describe(), reason),
        )),
        (_, ActionOutcome::NoOpAlreadySatisfied) => None,
        (Action::PromoteReplica { .. }, ActionOutcome::Applied) => Some(EventRecord::normal(
            "PrimaryPromoted",
            action.name(),
            action.describe(),
        )),
        (Action::ConfigureReplication { .. }, ActionOutcome::Applied) => Some(
            EventRecord::normal("ReplicationConfigured", action.name(), action.describe()),
        ),
        (Action::EnableWrites { .. }, ActionOutcome::Applied) => Some(EventRecord::normal(
            "PrimaryWritable",
            action.name(),
            action.describe(),
        )),
        (Action::ApplyStatefulSet { .. }, ActionOutcome::Applied) => Some(EventRecord::normal(
            "StatefulSetUpdated",
            action.name(),
            action.describe(),
        )),
        _ => None,
    }
}
