//! Test fixtures and builders for MySQLCluster and MySQLBackup resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = create_test_cluster("orders", "db", 3);
//! let backup = MySQLBackupBuilder::new("nightly", "db", "orders")
//!     .with_schedule("0 2 * * *")
//!     .with_keep_last(3)
//!     .build();
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use mysql_operator::crd::{
    BackupPhase, BackupStorage, MySQLBackup, MySQLBackupSpec, MySQLBackupStatus, MySQLCluster,
    MySQLClusterSpec, RetentionPolicy, StorageSpec,
};
use mysql_operator::resources::common::{ROLE_LABEL, SCHEDULE_LABEL, selector_labels};

// =============================================================================
// Time helpers
// =============================================================================

/// A fixed instant on 2026-03-01
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap()
}

/// Kubernetes timestamp for a chrono instant
pub fn k8s_time(time: DateTime<Utc>) -> Time {
    serde_json::from_value(serde_json::Value::String(time.to_rfc3339())).unwrap()
}

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a basic test cluster with minimal configuration
pub fn create_test_cluster(name: &str, namespace: &str, replicas: i32) -> MySQLCluster {
    MySQLClusterBuilder::new(name, namespace)
        .with_replicas(replicas)
        .build()
}

/// Create a one-shot backup against `cluster`
pub fn create_test_backup(name: &str, namespace: &str, cluster: &str) -> MySQLBackup {
    MySQLBackupBuilder::new(name, namespace, cluster).build()
}

// =============================================================================
// MySQLCluster Builder
// =============================================================================

/// Builder for MySQLCluster test fixtures
pub struct MySQLClusterBuilder {
    name: String,
    namespace: String,
    uid: String,
    generation: Option<i64>,
    version: String,
    replicas: i32,
    storage_size: String,
    storage_class: Option<String>,
    mysql_config: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
}

impl MySQLClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: format!("uid-{}", name),
            generation: Some(1),
            version: "8.0".to_string(),
            replicas: 1,
            storage_size: "10Gi".to_string(),
            storage_class: None,
            mysql_config: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_storage(mut self, size: &str, storage_class: Option<&str>) -> Self {
        self.storage_size = size.to_string();
        self.storage_class = storage_class.map(String::from);
        self
    }

    pub fn with_mysql_config(mut self, key: &str, value: &str) -> Self {
        self.mysql_config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> MySQLCluster {
        MySQLCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some(self.uid),
                generation: self.generation,
                ..Default::default()
            },
            spec: MySQLClusterSpec {
                version: self.version,
                replicas: self.replicas,
                image: None,
                storage: StorageSpec {
                    storage_class: self.storage_class,
                    size: self.storage_size,
                },
                resources: None,
                mysql_config: self.mysql_config,
                labels: self.labels,
            },
            status: None,
        }
    }
}

// =============================================================================
// MySQLBackup Builder
// =============================================================================

/// Builder for MySQLBackup test fixtures
pub struct MySQLBackupBuilder {
    name: String,
    namespace: String,
    generation: Option<i64>,
    created: Option<DateTime<Utc>>,
    labels: BTreeMap<String, String>,
    spec: MySQLBackupSpec,
    status: Option<MySQLBackupStatus>,
}

impl MySQLBackupBuilder {
    pub fn new(name: &str, namespace: &str, cluster: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            generation: Some(1),
            created: None,
            labels: BTreeMap::new(),
            spec: MySQLBackupSpec {
                cluster_ref: cluster.to_string(),
                schedule: None,
                suspend: false,
                storage: BackupStorage::PersistentVolumeClaim {
                    claim_name: "backups".to_string(),
                    path: None,
                },
                retention: RetentionPolicy::default(),
                from_replica: true,
                image: None,
            },
            status: None,
        }
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.spec.schedule = Some(schedule.to_string());
        self
    }

    pub fn suspended(mut self) -> Self {
        self.spec.suspend = true;
        self
    }

    pub fn with_keep_last(mut self, keep: i32) -> Self {
        self.spec.retention.keep_last = Some(keep);
        self
    }

    pub fn with_max_age(mut self, age: &str) -> Self {
        self.spec.retention.max_age = Some(age.to_string());
        self
    }

    pub fn with_s3(mut self, bucket: &str, prefix: Option<&str>) -> Self {
        self.spec.storage = BackupStorage::S3 {
            bucket: bucket.to_string(),
            prefix: prefix.map(String::from),
            endpoint: None,
            region: None,
            credentials_secret: "s3-credentials".to_string(),
        };
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn created_at(mut self, time: DateTime<Utc>) -> Self {
        self.created = Some(time);
        self
    }

    /// Mark as a child spawned by the schedule `parent`
    pub fn child_of(mut self, parent: &str) -> Self {
        self.labels
            .insert(SCHEDULE_LABEL.to_string(), parent.to_string());
        self
    }

    /// Give the backup a finished status completed at `completed`
    pub fn finished(mut self, phase: BackupPhase, completed: DateTime<Utc>) -> Self {
        self.status = Some(MySQLBackupStatus {
            phase,
            completion_time: Some(completed.to_rfc3339()),
            observed_generation: self.generation,
            ..Default::default()
        });
        self
    }

    pub fn with_status(mut self, status: MySQLBackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> MySQLBackup {
        MySQLBackup {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace),
                uid: Some(format!("uid-{}", self.name)),
                generation: self.generation,
                creation_timestamp: self.created.map(k8s_time),
                labels: (!self.labels.is_empty()).then_some(self.labels),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

// =============================================================================
// Pods and Jobs
// =============================================================================

/// A scheduled member pod, ready or not, optionally carrying a role label
pub fn member_pod(cluster: &str, namespace: &str, ordinal: i32, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", cluster, ordinal)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector_labels(cluster)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Set or replace the role label on a pod
pub fn with_role(mut pod: Pod, role: &str) -> Pod {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(ROLE_LABEL.to_string(), role.to_string());
    pod
}

/// Job status reporting completion at `completed`
pub fn job_succeeded(completed: DateTime<Utc>) -> JobStatus {
    JobStatus {
        succeeded: Some(1),
        completion_time: Some(k8s_time(completed)),
        conditions: Some(vec![JobCondition {
            type_: "Complete".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Job status reporting failure with `message`
pub fn job_failed(message: &str) -> JobStatus {
    JobStatus {
        failed: Some(3),
        conditions: Some(vec![JobCondition {
            type_: "Failed".to_string(),
            status: "True".to_string(),
            reason: Some("BackoffLimitExceeded".to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Apply a status to a Job
pub fn with_job_status(mut job: Job, status: JobStatus) -> Job {
    job.status = Some(status);
    job
}
