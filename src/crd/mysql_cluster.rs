use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Condition;

/// MySQLCluster is the Schema for the mysqlclusters API
///
/// Example:
/// ```yaml
/// apiVersion: mysql.qwzhou.io/v1alpha1
/// kind: MySQLCluster
/// metadata:
///   name: orders
/// spec:
///   version: "8.0"
///   replicas: 3
///   storage:
///     size: 20Gi
/// ```
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "mysql.qwzhou.io",
    version = "v1alpha1",
    kind = "MySQLCluster",
    plural = "mysqlclusters",
    shortname = "myc",
    namespaced,
    status = "MySQLClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.primary"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MySQLClusterSpec {
    /// MySQL server version (e.g., "8.0", "8.4", "8.0.36")
    #[serde(default = "default_version")]
    pub version: String,

    /// Total number of members: one primary plus `replicas - 1` async replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image override. Defaults to `mysql:<version>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Storage configuration for MySQL data volumes
    pub storage: StorageSpec,

    /// Resource requirements for MySQL pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra `[mysqld]` settings rendered into my.cnf
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mysql_config: BTreeMap<String, String>,

    /// Labels added to every object the operator creates for this cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_version() -> String {
    "8.0".to_string()
}

fn default_replicas() -> i32 {
    1
}

/// Storage configuration for MySQL data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,
}

/// Resource requirements for MySQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl MySQLClusterSpec {
    /// Image used for the mysqld container
    pub fn effective_image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("mysql:{}", self.version))
    }
}

/// Status of the MySQLCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MySQLClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of ready members
    #[serde(default)]
    pub ready_replicas: i32,

    /// Desired number of members
    #[serde(default)]
    pub replicas: i32,

    /// Name of the current primary pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// Member pods of the cluster, ordered by ordinal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberStatus>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    /// Last reconciliation error, cleared once the cluster is Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Version running when the cluster last became Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
}

/// A member pod reference
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Pod name
    pub name: String,
    /// StatefulSet ordinal
    pub ordinal: i32,
    /// Whether the pod reports Ready
    pub ready: bool,
    /// Role label currently carried by the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,
}

/// Replication role of a member
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum MemberRole {
    Primary,
    Replica,
}

impl MemberRole {
    /// Value of the role label on member pods
    pub fn label_value(&self) -> &'static str {
        match self {
            MemberRole::Primary => "primary",
            MemberRole::Replica => "replica",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(MemberRole::Primary),
            "replica" => Some(MemberRole::Replica),
            _ => None,
        }
    }
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Resources are being created or reshaped toward the spec
    #[default]
    Provisioning,
    /// All members ready with a single writable primary
    Ready,
    /// The cluster lost health after having been Ready
    Degraded,
    /// The spec cannot be reconciled (configuration error)
    Failed,
}

impl ClusterPhase {
    pub const ALL: [ClusterPhase; 4] = [
        ClusterPhase::Provisioning,
        ClusterPhase::Ready,
        ClusterPhase::Degraded,
        ClusterPhase::Failed,
    ];
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Provisioning => write!(f, "Provisioning"),
            ClusterPhase::Ready => write!(f, "Ready"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}
