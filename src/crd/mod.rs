mod mysql_backup;
mod mysql_cluster;

pub use mysql_backup::*;
pub use mysql_cluster::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by all resources of this operator
pub const API_GROUP: &str = "mysql.qwzhou.io";

/// API version shared by all resources of this operator
pub const API_VERSION: &str = "mysql.qwzhou.io/v1alpha1";

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Every custom resource served by the operator.
///
/// Registration is explicit: the `crdgen` binary and startup logging both
/// call this instead of relying on a global scheme.
pub fn registered_crds() -> Vec<CustomResourceDefinition> {
    vec![MySQLCluster::crd(), MySQLBackup::crd()]
}
