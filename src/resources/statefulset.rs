//! StatefulSet generation for MySQL clusters
//!
//! One StatefulSet holds every member. Ordinal 0 starts as primary; roles are
//! tracked with the role label on pods, not in the StatefulSet itself, so a
//! failover never requires a pod template change.

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector,
    Volume, VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::{MySQLCluster, ResourceList};
use crate::resources::common::{
    MYSQL_PORT, cluster_labels, config_map_name, credentials_secret_name, owner_reference,
    selector_labels, spec_hash,
};
use crate::resources::config_map::{
    INIT_SCRIPT_KEY, REPLICATION_USER_SCRIPT_KEY, generate_config_map,
};
use crate::resources::secret::{
    REPLICATION_PASSWORD_KEY, REPLICATION_USER_KEY, ROOT_PASSWORD_KEY,
};

/// Name of the mysqld container, also the exec target for probes
pub const MYSQL_CONTAINER: &str = "mysql";

/// Name of the data volume claim template
pub const DATA_VOLUME: &str = "data";

/// Pod template annotation that rolls members when my.cnf changes
pub const CONFIG_HASH_ANNOTATION: &str = "mysql.qwzhou.io/config-hash";

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn mysql_probe(command: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Spread members across nodes, then zones
fn generate_anti_affinity(cluster_name: &str) -> Affinity {
    let term = |weight: i32, topology_key: &str| WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(selector_labels(cluster_name)),
                ..Default::default()
            }),
            topology_key: topology_key.to_string(),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                term(100, "kubernetes.io/hostname"),
                term(50, "topology.kubernetes.io/zone"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the StatefulSet for the cluster
pub fn generate_statefulset(cluster: &MySQLCluster) -> StatefulSet {
    let name = cluster.name_any();
    let labels = cluster_labels(cluster);
    let selector = selector_labels(&name);
    let secret_name = credentials_secret_name(&name);
    let image = cluster.spec.effective_image();

    let mut pod_labels = labels.clone();
    pod_labels.extend(selector.clone());

    let config_hash = spec_hash(&generate_config_map(cluster).data);

    let init_container = Container {
        name: "init-member".to_string(),
        image: Some(image.clone()),
        command: Some(vec![
            "sh".to_string(),
            format!("/mnt/config/{}", INIT_SCRIPT_KEY),
        ]),
        env: Some(vec![EnvVar {
            name: "SERVICE_NAME".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/mnt/config".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "conf-d".to_string(),
                mount_path: "/mnt/conf.d".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: "/var/lib/mysql".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mysql_container = Container {
        name: MYSQL_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: MYSQL_PORT,
            name: Some("mysql".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env("MYSQL_ROOT_PASSWORD", &secret_name, ROOT_PASSWORD_KEY),
            secret_env("MYSQL_REPLICATION_USER", &secret_name, REPLICATION_USER_KEY),
            secret_env(
                "MYSQL_REPLICATION_PASSWORD",
                &secret_name,
                REPLICATION_PASSWORD_KEY,
            ),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: "/var/lib/mysql".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "conf-d".to_string(),
                mount_path: "/etc/mysql/conf.d".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: format!("/docker-entrypoint-initdb.d/{}", REPLICATION_USER_SCRIPT_KEY),
                sub_path: Some(REPLICATION_USER_SCRIPT_KEY.to_string()),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: cluster.spec.resources.as_ref().map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        }),
        startup_probe: Some(mysql_probe(
            "mysqladmin ping -uroot -p\"${MYSQL_ROOT_PASSWORD}\"",
            10,
            30,
        )),
        readiness_probe: Some(mysql_probe(
            "mysql -uroot -p\"${MYSQL_ROOT_PASSWORD}\" -e 'SELECT 1'",
            5,
            3,
        )),
        liveness_probe: Some(mysql_probe(
            "mysqladmin ping -uroot -p\"${MYSQL_ROOT_PASSWORD}\"",
            30,
            6,
        )),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(&name),
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "conf-d".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cluster.spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cluster.spec.storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(name.clone()),
            replicas: Some(cluster.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(0),
                    ..Default::default()
                }),
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        config_hash,
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![init_container]),
                    containers: vec![mysql_container],
                    volumes: Some(volumes),
                    affinity: Some(generate_anti_affinity(&name)),
                    termination_grace_period_seconds: Some(60),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Storage class of the data claim template of an existing StatefulSet
pub fn existing_storage_class(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()?
        .volume_claim_templates
        .as_ref()?
        .iter()
        .find(|t| t.metadata.name.as_deref() == Some(DATA_VOLUME))?
        .spec
        .as_ref()?
        .storage_class_name
        .as_deref()
}
