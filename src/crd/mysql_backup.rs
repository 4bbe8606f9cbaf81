use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// MySQLBackup is the Schema for the mysqlbackups API
///
/// Without `schedule` the resource describes a single backup run. With a
/// `schedule` it acts as a template that spawns one-shot child backups.
///
/// Example:
/// ```yaml
/// apiVersion: mysql.qwzhou.io/v1alpha1
/// kind: MySQLBackup
/// metadata:
///   name: orders-nightly
/// spec:
///   clusterRef: orders
///   schedule: "0 2 * * *"
///   storage:
///     type: PersistentVolumeClaim
///     claimName: backups
///   retention:
///     keepLast: 7
/// ```
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "mysql.qwzhou.io",
    version = "v1alpha1",
    kind = "MySQLBackup",
    plural = "mysqlbackups",
    shortname = "myb",
    namespaced,
    status = "MySQLBackupStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterRef"}"#,
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Completed", "type":"date", "jsonPath":".status.completionTime"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MySQLBackupSpec {
    /// Name of the MySQLCluster to back up (same namespace)
    pub cluster_ref: String,

    /// Cron schedule. When absent the backup runs once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Pause a schedule without deleting it
    #[serde(default)]
    pub suspend: bool,

    /// Where the dump is written
    #[schemars(schema_with = "backup_storage_schema")]
    pub storage: BackupStorage,

    /// Retention policy for completed backups
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Dump from the replicas service when the cluster has replicas
    #[serde(default = "default_from_replica")]
    pub from_replica: bool,

    /// Image used by the backup Job. Defaults depend on the storage type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_from_replica() -> bool {
    true
}

/// Structural schema for [`BackupStorage`]
///
/// Structural CRD schemas cannot express an internally tagged enum, so every
/// variant's fields share one object keyed by a single `type` enum.
fn backup_storage_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "description": "Where the dump is written",
        "type": "object",
        "required": ["type"],
        "properties": {
            "type": {
                "type": "string",
                "enum": ["PersistentVolumeClaim", "S3"]
            },
            "claimName": {
                "description": "PersistentVolumeClaim receiving the dumps",
                "type": "string"
            },
            "path": {
                "description": "Directory inside the claim",
                "type": "string"
            },
            "bucket": { "type": "string" },
            "prefix": { "type": "string" },
            "endpoint": { "type": "string" },
            "region": { "type": "string" },
            "credentialsSecret": {
                "description": "Secret with AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY",
                "type": "string"
            }
        }
    })
}

/// Backup destination
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum BackupStorage {
    /// Write dumps to an existing PersistentVolumeClaim
    #[serde(rename_all = "camelCase")]
    PersistentVolumeClaim {
        claim_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Stream dumps to an S3-compatible bucket
    #[serde(rename_all = "camelCase")]
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        /// Secret with AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
        credentials_secret: String,
    },
}

impl BackupStorage {
    pub fn storage_type(&self) -> &'static str {
        match self {
            BackupStorage::PersistentVolumeClaim { .. } => "PersistentVolumeClaim",
            BackupStorage::S3 { .. } => "S3",
        }
    }
}

/// Retention policy for backups
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Number of succeeded backups a schedule keeps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<i32>,

    /// Maximum age of a completed backup (e.g., "12h", "7d", "2w")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
}

/// Status of the MySQLBackup
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MySQLBackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    /// Job running this backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    /// URI of the written dump (pvc://claim/path or s3://bucket/key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Last time a schedule spawned a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<String>,

    /// Next time a schedule will spawn a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Backup lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    /// Waiting for the target cluster or for the Job to be created
    #[default]
    Pending,
    /// Schedule template that spawns child backups
    Scheduled,
    /// The backup Job is executing
    Running,
    /// The dump completed
    Succeeded,
    /// The dump failed or the spec is invalid
    Failed,
}

impl BackupPhase {
    pub const ALL: [BackupPhase; 5] = [
        BackupPhase::Pending,
        BackupPhase::Scheduled,
        BackupPhase::Running,
        BackupPhase::Succeeded,
        BackupPhase::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupPhase::Succeeded | BackupPhase::Failed)
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::Pending => write!(f, "Pending"),
            BackupPhase::Scheduled => write!(f, "Scheduled"),
            BackupPhase::Running => write!(f, "Running"),
            BackupPhase::Succeeded => write!(f, "Succeeded"),
            BackupPhase::Failed => write!(f, "Failed"),
        }
    }
}
