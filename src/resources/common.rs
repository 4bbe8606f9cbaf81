//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, labels and owner references used by every generator so
//! that child objects of one cluster are selected and garbage-collected
//! consistently.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::{API_VERSION, MemberRole, MySQLBackup, MySQLCluster};

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "mysql-operator";

/// Label carrying the owning cluster name
pub const CLUSTER_LABEL: &str = "mysql.qwzhou.io/cluster";

/// Label carrying the replication role of a member pod
pub const ROLE_LABEL: &str = "mysql.qwzhou.io/role";

/// Label carrying the owning backup name on Jobs and child backups
pub const BACKUP_LABEL: &str = "mysql.qwzhou.io/backup";

/// Label linking scheduled children to their template
pub const SCHEDULE_LABEL: &str = "mysql.qwzhou.io/schedule";

/// Annotation holding the hash of the desired object
pub const SPEC_HASH_ANNOTATION: &str = "mysql.qwzhou.io/spec-hash";

/// MySQL client port
pub const MYSQL_PORT: i32 = 3306;

/// Generate an owner reference for any operator resource
pub fn owner_reference_for<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner reference pointing at a MySQLCluster
pub fn owner_reference(cluster: &MySQLCluster) -> OwnerReference {
    owner_reference_for(cluster)
}

/// Owner reference pointing at a MySQLBackup
pub fn backup_owner_reference(backup: &MySQLBackup) -> OwnerReference {
    owner_reference_for(backup)
}

/// Generate standard labels for all resources belonging to a MySQLCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "mysql".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Standard labels merged with the user labels from the cluster spec
///
/// User labels may override anything except the cluster identifier.
pub fn cluster_labels(cluster: &MySQLCluster) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let mut labels = standard_labels(&name);

    for (key, value) in &cluster.spec.labels {
        if key != CLUSTER_LABEL {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Labels selecting every member pod of a cluster
pub fn selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels selecting member pods that carry a given role
pub fn role_selector_labels(cluster_name: &str, role: MemberRole) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster_name);
    labels.insert(ROLE_LABEL.to_string(), role.label_value().to_string());
    labels
}

/// Label selector string for listing member pods
pub fn member_selector(cluster_name: &str) -> String {
    selector_labels(cluster_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// SHA-256 of the JSON form of a desired object
pub fn spec_hash<T: Serialize>(desired: &T) -> String {
    let bytes = serde_json::to_vec(desired).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Stamp the spec-hash annotation on a desired object
///
/// The hash is computed before the annotation is added, so it only covers
/// the rest of the object.
pub fn with_spec_hash<K>(mut desired: K) -> K
where
    K: Resource + Serialize,
{
    let hash = spec_hash(&desired);
    desired
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    desired
}

/// Read the spec-hash annotation of an existing object
pub fn existing_spec_hash<K: Resource>(existing: &K) -> Option<&str> {
    existing
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Name of the credentials Secret
pub fn credentials_secret_name(cluster_name: &str) -> String {
    format!("{}-credentials", cluster_name)
}

/// Name of the my.cnf ConfigMap
pub fn config_map_name(cluster_name: &str) -> String {
    format!("{}-config", cluster_name)
}

/// Name of the read-write Service
pub fn primary_service_name(cluster_name: &str) -> String {
    format!("{}-primary", cluster_name)
}

/// Name of the read-only Service
pub fn replicas_service_name(cluster_name: &str) -> String {
    format!("{}-replicas", cluster_name)
}

/// Name of the PodDisruptionBudget
pub fn pdb_name(cluster_name: &str) -> String {
    format!("{}-pdb", cluster_name)
}

/// Pod name for a StatefulSet ordinal
pub fn member_pod_name(cluster_name: &str, ordinal: i32) -> String {
    format!("{}-{}", cluster_name, ordinal)
}

/// Stable DNS name of a member behind the headless Service
pub fn member_host(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "{}.{}.{}.svc",
        member_pod_name(cluster_name, ordinal),
        cluster_name,
        namespace
    )
}

/// Parse the ordinal suffix of a member pod name
pub fn ordinal_from_pod_name(cluster_name: &str, pod_name: &str) -> Option<i32> {
    pod_name
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}
