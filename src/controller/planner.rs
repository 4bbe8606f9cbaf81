//! Action planning for MySQLCluster
//!
//! `plan` is a pure function of the desired cluster and an observed
//! snapshot. It returns every corrective action still needed, in the order
//! they must happen; the reconciler executes only the first one per pass.
//!
//! Order:
//! 1. credentials Secret, ConfigMap, Services, PodDisruptionBudget
//! 2. failover, including handing off the primary before a scale-down
//! 3. StatefulSet
//! 4. primary election and role labels
//! 5. enable writes on the primary
//! 6. point replicas at the primary
//! 7. label replicas that replicate

use kube::ResourceExt;

use crate::controller::api::ManagedObject;
use crate::controller::observed::{ClusterSnapshot, MemberSnapshot, ReplicationState};
use crate::crd::{MemberRole, MySQLCluster};
use crate::resources::common::{existing_spec_hash, member_host, spec_hash, with_spec_hash};
use crate::resources::config_map::generate_config_map;
use crate::resources::pdb::generate_pdb;
use crate::resources::secret::generate_credentials_secret;
use crate::resources::service::{ServiceKind, generate_service};
use crate::resources::statefulset::generate_statefulset;

/// One unit of work
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Create or update a child object
    Apply(ManagedObject),
    /// Apply the StatefulSet; `scale_down` marks a replica count decrease
    ApplyStatefulSet {
        object: ManagedObject,
        scale_down: bool,
    },
    /// Make `pod` the primary, demoting `previous` if it is still around
    PromoteReplica {
        pod: String,
        previous: Option<String>,
    },
    /// Set the role label on a member
    LabelMember { pod: String, role: MemberRole },
    /// Turn off read-only mode on the primary
    EnableWrites { pod: String },
    /// Point a member at the primary and start replicating
    ConfigureReplication { pod: String, source_host: String },
}

impl Action {
    /// Short name for logs, events and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Action::Apply(object) => match object {
                ManagedObject::Secret(_) => "EnsureSecret",
                ManagedObject::ConfigMap(_) => "EnsureConfigMap",
                ManagedObject::Service(_) => "EnsureService",
                ManagedObject::PodDisruptionBudget(_) => "EnsurePodDisruptionBudget",
                ManagedObject::StatefulSet(_) => "EnsureStatefulSet",
            },
            Action::ApplyStatefulSet { .. } => "EnsureStatefulSet",
            Action::PromoteReplica { .. } => "PromoteReplica",
            Action::LabelMember { .. } => "LabelMember",
            Action::EnableWrites { .. } => "EnableWrites",
            Action::ConfigureReplication { .. } => "ConfigureReplication",
        }
    }

    /// Actions after which the old topology cannot be restored by reapplying
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Action::PromoteReplica { .. } | Action::ApplyStatefulSet { scale_down: true, .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            Action::Apply(object) => format!("apply {} {}", object.kind(), object.name()),
            Action::ApplyStatefulSet { object, scale_down } => {
                if *scale_down {
                    format!("scale down StatefulSet {}", object.name())
                } else {
                    format!("apply StatefulSet {}", object.name())
                }
            }
            Action::PromoteReplica { pod, previous } => match previous {
                Some(prev) => format!("promote {} to primary (replacing {})", pod, prev),
                None => format!("promote {} to primary", pod),
            },
            Action::LabelMember { pod, role } => {
                format!("label {} as {}", pod, role.label_value())
            }
            Action::EnableWrites { pod } => format!("enable writes on {}", pod),
            Action::ConfigureReplication { pod, source_host } => {
                format!("replicate {} from {}", pod, source_host)
            }
        }
    }
}

fn hash_differs<K: kube::Resource>(existing: Option<&K>, desired_hash: &str) -> bool {
    existing.and_then(existing_spec_hash) != Some(desired_hash)
}

/// Stable DNS name of a member in this cluster
pub fn host_of(cluster: &MySQLCluster, member: &MemberSnapshot) -> String {
    member_host(
        &cluster.name_any(),
        &cluster.namespace().unwrap_or_default(),
        member.ordinal,
    )
}

/// Which member is primary, as far as the snapshot can tell
///
/// A labelled primary wins; among several, the writable one, then the lowest
/// ordinal. Without labels, `status.primary` is trusted if the pod still
/// exists.
pub fn current_primary<'a>(
    cluster: &MySQLCluster,
    snapshot: &'a ClusterSnapshot,
) -> Option<&'a MemberSnapshot> {
    let labelled = snapshot.labelled_primaries();
    if let Some(writable) = labelled
        .iter()
        .copied()
        .find(|m| m.replication == ReplicationState::Writable)
    {
        return Some(writable);
    }
    if let Some(first) = labelled.first() {
        return Some(first);
    }

    let recorded = cluster.status.as_ref()?.primary.as_deref()?;
    snapshot.member(recorded)
}

/// Pick a primary for a cluster that has none
///
/// A member that already accepts writes is kept, then the member the other
/// replicas follow, then the lowest ready ordinal.
pub fn elect_primary<'a>(
    cluster: &MySQLCluster,
    snapshot: &'a ClusterSnapshot,
) -> Option<&'a MemberSnapshot> {
    let eligible: Vec<&MemberSnapshot> = snapshot
        .ready_members()
        .filter(|m| m.ordinal < cluster.spec.replicas)
        .collect();

    if let Some(writable) = eligible
        .iter()
        .copied()
        .find(|m| m.replication == ReplicationState::Writable)
    {
        return Some(writable);
    }

    let followed = eligible.iter().copied().find(|candidate| {
        let host = host_of(cluster, candidate);
        snapshot.members.iter().any(|m| {
            matches!(&m.replication, ReplicationState::Replicating { source_host, .. } if *source_host == host)
        })
    });
    if let Some(followed) = followed {
        return Some(followed);
    }

    eligible.first().copied()
}

/// Best ready member to take over from `current`
fn promotion_candidate<'a>(
    cluster: &MySQLCluster,
    snapshot: &'a ClusterSnapshot,
    current: &MemberSnapshot,
) -> Option<&'a MemberSnapshot> {
    let current_host = host_of(cluster, current);
    let mut candidates: Vec<&MemberSnapshot> = snapshot
        .ready_members()
        .filter(|m| m.name != current.name && m.ordinal < cluster.spec.replicas)
        .filter(|m| {
            matches!(
                m.replication,
                ReplicationState::Replicating { .. } | ReplicationState::Idle
            )
        })
        .collect();

    // Healthy followers of the old primary first, least lag next
    candidates.sort_by_key(|m| {
        let following = m.replication.is_replicating_from(&current_host);
        let lag = match &m.replication {
            ReplicationState::Replicating { seconds_behind, .. } => {
                seconds_behind.unwrap_or(i64::MAX)
            }
            _ => i64::MAX,
        };
        (!following, lag, m.ordinal)
    });

    candidates.first().copied()
}

/// The primary after any pending failover
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryDecision<'a> {
    /// No member can be primary yet
    None,
    /// Keep the current primary
    Keep(&'a MemberSnapshot),
    /// Label a primary for a cluster that had none
    Elect(&'a MemberSnapshot),
    /// Promote a replica over the current primary
    Promote {
        candidate: &'a MemberSnapshot,
        previous: &'a MemberSnapshot,
    },
    /// The primary must move but no replica can take over; hold changes
    Blocked(&'a MemberSnapshot),
}

impl<'a> PrimaryDecision<'a> {
    /// The member that is or will be primary
    pub fn primary(&self) -> Option<&'a MemberSnapshot> {
        match self {
            PrimaryDecision::None => None,
            PrimaryDecision::Keep(m) | PrimaryDecision::Elect(m) | PrimaryDecision::Blocked(m) => {
                Some(m)
            }
            PrimaryDecision::Promote { candidate, .. } => Some(candidate),
        }
    }
}

/// Decide who the primary is for this pass
pub fn decide_primary<'a>(
    cluster: &MySQLCluster,
    snapshot: &'a ClusterSnapshot,
) -> PrimaryDecision<'a> {
    let Some(current) = current_primary(cluster, snapshot) else {
        return match elect_primary(cluster, snapshot) {
            Some(elected) => PrimaryDecision::Elect(elected),
            None => PrimaryDecision::None,
        };
    };

    let removed_by_scale_down = current.ordinal >= cluster.spec.replicas;
    if current.ready && !removed_by_scale_down {
        return PrimaryDecision::Keep(current);
    }

    match promotion_candidate(cluster, snapshot, current) {
        Some(candidate) => PrimaryDecision::Promote {
            candidate,
            previous: current,
        },
        None => PrimaryDecision::Blocked(current),
    }
}

/// Compute the ordered list of actions still needed
pub fn plan(cluster: &MySQLCluster, snapshot: &ClusterSnapshot) -> Vec<Action> {
    let cluster_name = cluster.name_any();
    let mut actions = Vec::new();

    // Passwords are random: only ever created
    if snapshot.secret.is_none() {
        actions.push(Action::Apply(ManagedObject::Secret(
            generate_credentials_secret(cluster),
        )));
    }

    let config_map = generate_config_map(cluster);
    if hash_differs(snapshot.config_map.as_ref(), &spec_hash(&config_map)) {
        actions.push(Action::Apply(ManagedObject::ConfigMap(with_spec_hash(
            config_map,
        ))));
    }

    for kind in ServiceKind::ALL {
        let service = generate_service(cluster, kind);
        if hash_differs(snapshot.service(kind, &cluster_name), &spec_hash(&service)) {
            actions.push(Action::Apply(ManagedObject::Service(with_spec_hash(service))));
        }
    }

    let pdb = generate_pdb(cluster);
    if hash_differs(snapshot.pdb.as_ref(), &spec_hash(&pdb)) {
        actions.push(Action::Apply(ManagedObject::PodDisruptionBudget(
            with_spec_hash(pdb),
        )));
    }

    let decision = decide_primary(cluster, snapshot);

    if let PrimaryDecision::Promote {
        candidate,
        previous,
    } = &decision
    {
        actions.push(Action::PromoteReplica {
            pod: candidate.name.clone(),
            previous: Some(previous.name.clone()),
        });
    }

    let statefulset = generate_statefulset(cluster);
    if hash_differs(snapshot.statefulset.as_ref(), &spec_hash(&statefulset)) {
        let scale_down = snapshot
            .statefulset_replicas()
            .is_some_and(|current| current > cluster.spec.replicas);
        // Never remove the primary's pod before another member took over
        let primary_removed = decision
            .primary()
            .is_some_and(|p| p.ordinal >= cluster.spec.replicas);
        if !(scale_down && primary_removed) {
            actions.push(Action::ApplyStatefulSet {
                object: ManagedObject::StatefulSet(with_spec_hash(statefulset)),
                scale_down,
            });
        }
    }

    let primary = match decision {
        PrimaryDecision::Keep(p) | PrimaryDecision::Elect(p) => p,
        // Everything past this point depends on a settled primary
        PrimaryDecision::Promote { .. } | PrimaryDecision::Blocked(_) | PrimaryDecision::None => {
            return actions;
        }
    };
    let primary_host = host_of(cluster, primary);

    for stale in snapshot
        .labelled_primaries()
        .into_iter()
        .filter(|m| m.name != primary.name)
    {
        actions.push(Action::LabelMember {
            pod: stale.name.clone(),
            role: MemberRole::Replica,
        });
    }

    if primary.role != Some(MemberRole::Primary) {
        actions.push(Action::LabelMember {
            pod: primary.name.clone(),
            role: MemberRole::Primary,
        });
    }

    if primary.ready
        && !matches!(
            primary.replication,
            ReplicationState::Writable | ReplicationState::Unknown
        )
    {
        actions.push(Action::EnableWrites {
            pod: primary.name.clone(),
        });
    }

    if !primary.ready {
        return actions;
    }

    let replicas: Vec<&MemberSnapshot> = snapshot
        .ready_members()
        .filter(|m| m.name != primary.name && m.ordinal < cluster.spec.replicas)
        .collect();

    for member in &replicas {
        if needs_replication_setup(&member.replication, &primary_host) {
            actions.push(Action::ConfigureReplication {
                pod: member.name.clone(),
                source_host: primary_host.clone(),
            });
        }
    }

    for member in &replicas {
        if member.role != Some(MemberRole::Replica)
            && member.role != Some(MemberRole::Primary)
            && member.replication.is_replicating_from(&primary_host)
        {
            actions.push(Action::LabelMember {
                pod: member.name.clone(),
                role: MemberRole::Replica,
            });
        }
    }

    actions
}

/// Whether a non-primary member must be (re)pointed at `primary_host`
///
/// Threads stopped on a reported error are left alone; restarting them would
/// fail the same way, so the error is surfaced in status instead.
fn needs_replication_setup(state: &ReplicationState, primary_host: &str) -> bool {
    match state {
        ReplicationState::Unknown => false,
        ReplicationState::Writable | ReplicationState::Idle => true,
        ReplicationState::Replicating { source_host, .. } if source_host != primary_host => true,
        ReplicationState::Replicating {
            io_running,
            sql_running,
            last_error,
            ..
        } => !(*io_running && *sql_running) && last_error.is_none(),
    }
}

/// Outcome of the health assessment of one snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthReport {
    /// Every member ready, one writable primary, replicas replicating
    pub healthy: bool,
    pub ready_members: i32,
    pub primary: Option<String>,
    /// All replicas replicate from the primary without errors
    pub replication_healthy: bool,
    /// Human-readable reasons the cluster is not healthy
    pub problems: Vec<String>,
}

impl HealthReport {
    pub fn summary(&self) -> String {
        if self.problems.is_empty() {
            "All members ready".to_string()
        } else {
            self.problems.join("; ")
        }
    }
}

/// Assess the health of the observed cluster against its spec
pub fn assess_health(cluster: &MySQLCluster, snapshot: &ClusterSnapshot) -> HealthReport {
    let desired = cluster.spec.replicas;
    let ready_members = snapshot.ready_count();
    let mut problems = Vec::new();

    match snapshot.statefulset_replicas() {
        None => problems.push("StatefulSet not created".to_string()),
        Some(replicas) if replicas != desired => {
            problems.push(format!("StatefulSet has {} of {} replicas", replicas, desired))
        }
        _ => {}
    }

    if snapshot.members.len() as i32 != desired || ready_members != desired {
        problems.push(format!("{}/{} members ready", ready_members, desired));
    }

    let unscheduled: Vec<&str> = snapshot
        .members
        .iter()
        .filter(|m| !m.scheduled)
        .map(|m| m.name.as_str())
        .collect();
    if !unscheduled.is_empty() {
        problems.push(format!("members not scheduled: {}", unscheduled.join(", ")));
    }

    let unbound = snapshot.unbound_volumes();
    if !unbound.is_empty() {
        problems.push(format!("volumes not bound: {}", unbound.join(", ")));
    }

    let labelled = snapshot.labelled_primaries();
    let primary = match labelled.as_slice() {
        [only] => Some(*only),
        [] => {
            problems.push("no primary".to_string());
            None
        }
        many => {
            problems.push(format!("{} members labelled primary", many.len()));
            None
        }
    };

    let mut replication_healthy = primary.is_some();
    if let Some(primary) = primary {
        if !primary.ready {
            problems.push(format!("primary {} not ready", primary.name));
        } else if primary.replication != ReplicationState::Writable {
            problems.push(format!("primary {} is read-only", primary.name));
        }

        let host = host_of(cluster, primary);
        for member in snapshot.members.iter().filter(|m| m.name != primary.name) {
            if !member.replication.is_replicating_from(&host) {
                replication_healthy = false;
                let detail = member
                    .replication
                    .replication_error()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default();
                problems.push(format!("{} not replicating{}", member.name, detail));
            } else if member.role != Some(MemberRole::Replica) {
                problems.push(format!("{} missing replica label", member.name));
            }
        }
    }

    HealthReport {
        healthy: problems.is_empty(),
        ready_members,
        primary: primary.map(|p| p.name.clone()),
        replication_healthy,
        problems,
    }
}
