//! PodDisruptionBudget resource generation for MySQL clusters

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::MySQLCluster;
use crate::resources::common::{cluster_labels, owner_reference, pdb_name, selector_labels};

/// Minimum available members for a replica count
///
/// - 1 member: 0 (a drain takes the only member down)
/// - 2 members: 1
/// - n members: n - 1 (one disruption at a time)
pub fn min_available(replicas: i32) -> i32 {
    match replicas {
        i32::MIN..=1 => 0,
        2 => 1,
        n => n - 1,
    }
}

/// Generate a PodDisruptionBudget covering all members of the cluster
pub fn generate_pdb(cluster: &MySQLCluster) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(cluster)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available(cluster.spec.replicas))),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&cluster_name)),
                ..Default::default()
            }),
            // Unhealthy pods may be evicted even when the budget is exhausted
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
