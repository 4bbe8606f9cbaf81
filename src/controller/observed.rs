//! Observed-state collection for MySQLCluster
//!
//! A snapshot is a best-effort, side-effect free view of everything the
//! planner reasons about. Missing objects are `None`, unscheduled pods are
//! non-ready members, and a failed replication probe is `Unknown`. Only
//! failures to read from the API server fail the snapshot.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::api::OperatorApi;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberRole, MySQLCluster};
use crate::resources::common::{
    ROLE_LABEL, config_map_name, credentials_secret_name, ordinal_from_pod_name, pdb_name,
};
use crate::resources::service::ServiceKind;
use crate::resources::statefulset::MYSQL_CONTAINER;

/// Query run in each ready member to learn its replication state
pub const REPLICATION_PROBE_SQL: &str =
    "SELECT @@global.read_only, @@global.super_read_only; SHOW REPLICA STATUS\\G";

/// Replication state of a single member as reported by mysqld
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ReplicationState {
    /// Accepts writes (`read_only = 0`)
    Writable,
    /// Read-only with a configured replication source
    Replicating {
        source_host: String,
        io_running: bool,
        sql_running: bool,
        seconds_behind: Option<i64>,
        last_error: Option<String>,
    },
    /// Read-only with no replication configured
    Idle,
    /// The probe could not run or its output was not understood
    #[default]
    Unknown,
}

impl ReplicationState {
    /// Replication threads are running against `source_host`
    pub fn is_replicating_from(&self, host: &str) -> bool {
        matches!(
            self,
            ReplicationState::Replicating {
                source_host,
                io_running: true,
                sql_running: true,
                ..
            } if source_host == host
        )
    }

    /// Replication from `host` stopped on an error mysqld reported
    pub fn replication_error(&self) -> Option<&str> {
        match self {
            ReplicationState::Replicating {
                io_running,
                sql_running,
                last_error: Some(error),
                ..
            } if !(*io_running && *sql_running) => Some(error.as_str()),
            _ => None,
        }
    }
}

/// One member pod as the snapshot sees it
#[derive(Clone, Debug, PartialEq)]
pub struct MemberSnapshot {
    pub name: String,
    pub ordinal: i32,
    /// Pod is bound to a node
    pub scheduled: bool,
    /// Pod reports the Ready condition
    pub ready: bool,
    /// Role label currently on the pod
    pub role: Option<MemberRole>,
    pub replication: ReplicationState,
}

/// Everything observed about one cluster in one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub statefulset: Option<StatefulSet>,
    pub services: BTreeMap<String, Service>,
    pub config_map: Option<ConfigMap>,
    pub secret: Option<Secret>,
    pub pdb: Option<PodDisruptionBudget>,
    /// Member pods sorted by ordinal
    pub members: Vec<MemberSnapshot>,
    /// Data volume claims sorted by name
    pub volumes: Vec<VolumeSnapshot>,
}

/// A data volume claim and its binding phase
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSnapshot {
    pub name: String,
    pub phase: Option<String>,
}

impl VolumeSnapshot {
    pub fn is_bound(&self) -> bool {
        self.phase.as_deref() == Some("Bound")
    }
}

impl ClusterSnapshot {
    pub fn service(&self, kind: ServiceKind, cluster_name: &str) -> Option<&Service> {
        self.services.get(&kind.service_name(cluster_name))
    }

    pub fn member(&self, name: &str) -> Option<&MemberSnapshot> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn ready_members(&self) -> impl Iterator<Item = &MemberSnapshot> {
        self.members.iter().filter(|m| m.ready)
    }

    pub fn ready_count(&self) -> i32 {
        self.ready_members().count() as i32
    }

    /// Replica count currently requested on the StatefulSet
    pub fn statefulset_replicas(&self) -> Option<i32> {
        self.statefulset.as_ref()?.spec.as_ref()?.replicas
    }

    /// Names of data volume claims that are not bound yet
    pub fn unbound_volumes(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter(|v| !v.is_bound())
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Members carrying the primary role label
    pub fn labelled_primaries(&self) -> Vec<&MemberSnapshot> {
        self.members
            .iter()
            .filter(|m| m.role == Some(MemberRole::Primary))
            .collect()
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
        && pod.metadata.deletion_timestamp.is_none()
}

fn pod_is_scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_ref())
        .is_some()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "0" | "OFF" => Some(false),
        "1" | "ON" => Some(true),
        _ => None,
    }
}

/// Interpret the output of [`REPLICATION_PROBE_SQL`] run with `mysql -N -B`
///
/// The first line holds the read-only flags; any following lines are the
/// vertical `SHOW REPLICA STATUS` output, empty when no source is configured.
pub fn parse_replication_probe(output: &str) -> ReplicationState {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());

    let Some(flags) = lines.next() else {
        return ReplicationState::Unknown;
    };
    let mut parts = flags.split_whitespace();
    let (Some(read_only), super_read_only) = (parts.next().and_then(parse_flag), parts.next())
    else {
        return ReplicationState::Unknown;
    };
    let super_read_only = super_read_only.and_then(parse_flag).unwrap_or(false);

    if !read_only && !super_read_only {
        return ReplicationState::Writable;
    }

    let fields: BTreeMap<&str, &str> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let Some(source_host) = fields.get("Source_Host").filter(|h| !h.is_empty()) else {
        return ReplicationState::Idle;
    };

    let running = |key: &str| fields.get(key).is_some_and(|v| *v != "No");
    let last_error = ["Last_IO_Error", "Last_SQL_Error"]
        .iter()
        .filter_map(|k| fields.get(k))
        .find(|v| !v.is_empty())
        .map(|v| v.to_string());

    ReplicationState::Replicating {
        source_host: source_host.to_string(),
        io_running: running("Replica_IO_Running"),
        sql_running: running("Replica_SQL_Running"),
        seconds_behind: fields
            .get("Seconds_Behind_Source")
            .and_then(|v| v.parse().ok()),
        last_error,
    }
}

/// Shell command running `sql` as root inside the mysqld container
///
/// The statement is expanded by the container shell, so `${VAR}` references
/// resolve against the container environment.
pub fn mysql_command(sql: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mysql -uroot -p\"${{MYSQL_ROOT_PASSWORD}}\" -N -B -e \"{}\"",
            sql
        ),
    ]
}

/// Shell command that runs the replication probe inside the mysqld container
pub fn replication_probe_command() -> Vec<String> {
    mysql_command(REPLICATION_PROBE_SQL)
}

async fn probe_member<A: OperatorApi + ?Sized>(
    api: &A,
    namespace: &str,
    pod: &str,
) -> ReplicationState {
    match api
        .exec(namespace, pod, MYSQL_CONTAINER, replication_probe_command())
        .await
    {
        Ok(output) => parse_replication_probe(&output),
        Err(e) => {
            debug!(pod = %pod, error = %e, "Replication probe failed");
            ReplicationState::Unknown
        }
    }
}

/// Build the snapshot for a cluster
pub async fn collect<A: OperatorApi + ?Sized>(
    api: &A,
    cluster: &MySQLCluster,
) -> Result<ClusterSnapshot> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let ns = namespace.as_str();

    let statefulset = api.get_statefulset(ns, &name).await?;
    let config_map = api.get_config_map(ns, &config_map_name(&name)).await?;
    let secret = api.get_secret(ns, &credentials_secret_name(&name)).await?;
    let pdb = api.get_pdb(ns, &pdb_name(&name)).await?;

    let mut services = BTreeMap::new();
    for kind in ServiceKind::ALL {
        let svc_name = kind.service_name(&name);
        if let Some(svc) = api.get_service(ns, &svc_name).await? {
            services.insert(svc_name, svc);
        }
    }

    let mut members = Vec::new();
    for pod in api.list_member_pods(ns, &name).await? {
        let pod_name = pod.name_any();
        let Some(ordinal) = ordinal_from_pod_name(&name, &pod_name) else {
            continue;
        };
        let ready = pod_is_ready(&pod);
        let replication = if ready {
            probe_member(api, ns, &pod_name).await
        } else {
            ReplicationState::Unknown
        };
        members.push(MemberSnapshot {
            ordinal,
            scheduled: pod_is_scheduled(&pod),
            ready,
            role: pod
                .labels()
                .get(ROLE_LABEL)
                .and_then(|v| MemberRole::from_label(v)),
            replication,
            name: pod_name,
        });
    }
    members.sort_by_key(|m| m.ordinal);

    let mut volumes: Vec<VolumeSnapshot> = api
        .list_data_volumes(ns, &name)
        .await?
        .into_iter()
        .map(|pvc| VolumeSnapshot {
            phase: pvc.status.as_ref().and_then(|s| s.phase.clone()),
            name: pvc.name_any(),
        })
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ClusterSnapshot {
        statefulset,
        services,
        config_map,
        secret,
        pdb,
        members,
        volumes,
    })
}
