//! Service generation for MySQL clusters
//!
//! Three Services front a cluster:
//! - `<name>`: headless, gives every member a stable DNS name
//! - `<name>-primary`: read-write, selects the pod labelled as primary
//! - `<name>-replicas`: read-only, selects pods labelled as replicas
//!
//! Routing follows the role label, which the reconciler moves during
//! failover, so the Services themselves never change on promotion.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::{MemberRole, MySQLCluster};
use crate::resources::common::{
    MYSQL_PORT, cluster_labels, owner_reference, primary_service_name, replicas_service_name,
    role_selector_labels, selector_labels,
};

/// Which of the cluster Services to generate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Headless,
    Primary,
    Replicas,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::Headless,
        ServiceKind::Primary,
        ServiceKind::Replicas,
    ];

    pub fn service_name(&self, cluster_name: &str) -> String {
        match self {
            ServiceKind::Headless => cluster_name.to_string(),
            ServiceKind::Primary => primary_service_name(cluster_name),
            ServiceKind::Replicas => replicas_service_name(cluster_name),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Headless => write!(f, "headless"),
            ServiceKind::Primary => write!(f, "primary"),
            ServiceKind::Replicas => write!(f, "replicas"),
        }
    }
}

fn mysql_port() -> ServicePort {
    ServicePort {
        port: MYSQL_PORT,
        target_port: Some(IntOrString::Int(MYSQL_PORT)),
        name: Some("mysql".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate one of the cluster Services
pub fn generate_service(cluster: &MySQLCluster, kind: ServiceKind) -> Service {
    let cluster_name = cluster.name_any();

    let selector: BTreeMap<String, String> = match kind {
        ServiceKind::Headless => selector_labels(&cluster_name),
        ServiceKind::Primary => role_selector_labels(&cluster_name, MemberRole::Primary),
        ServiceKind::Replicas => role_selector_labels(&cluster_name, MemberRole::Replica),
    };

    let spec = match kind {
        ServiceKind::Headless => ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Members must resolve each other before they report Ready
            publish_not_ready_addresses: Some(true),
            selector: Some(selector),
            ports: Some(vec![mysql_port()]),
            ..Default::default()
        },
        ServiceKind::Primary | ServiceKind::Replicas => ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![mysql_port()]),
            ..Default::default()
        },
    };

    Service {
        metadata: ObjectMeta {
            name: Some(kind.service_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(cluster)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}
