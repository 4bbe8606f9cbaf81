//! Backup Jobs and scheduled child backups
//!
//! A one-shot MySQLBackup runs as a single Kubernetes Job that executes
//! `mysqldump` against the target cluster and writes a gzip-compressed dump.
//!
//! # Storage
//!
//! ## PersistentVolumeClaim
//! The dump container mounts the claim and writes
//! `<path>/<job-name>.sql.gz` directly.
//!
//! ## S3 / S3-Compatible Storage
//! The dump runs in an init container into an `emptyDir`; the main
//! container uploads it with the AWS CLI. Credentials come from the
//! referenced Secret:
//! - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
//! - `AWS_DEFAULT_REGION` when `region` is set
//! - `--endpoint-url` when `endpoint` is set (MinIO and friends)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, SecretKeySelector, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{
    BackupStorage, MySQLBackup, MySQLBackupSpec, MySQLCluster, RetentionPolicy,
};
use crate::resources::common::{
    BACKUP_LABEL, SCHEDULE_LABEL, backup_owner_reference, credentials_secret_name,
    primary_service_name, replicas_service_name, standard_labels,
};
use crate::resources::secret::ROOT_PASSWORD_KEY;

/// Default image for uploading dumps to S3
pub const DEFAULT_S3_IMAGE: &str = "amazon/aws-cli:2.17.0";

/// Arguments passed to every dump
pub const MYSQLDUMP_ARGS: &str = "--single-transaction --all-databases --routines --events --triggers --set-gtid-purged=ON";

/// Longest name a Job may carry (the job-name label is limited to 63 chars)
const MAX_JOB_NAME_LEN: usize = 63;

/// Retries of the dump pod before the Job is marked failed
const JOB_BACKOFF_LIMIT: i32 = 2;

/// Hard deadline for one backup run
const JOB_ACTIVE_DEADLINE_SECONDS: i64 = 6 * 60 * 60;

/// Timestamp format used in child backup names
const CHILD_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Name of the Job for the current generation of a backup
pub fn backup_job_name(backup: &MySQLBackup) -> String {
    let suffix = format!("-g{}", backup.metadata.generation.unwrap_or(0));
    let mut base = backup.name_any();
    base.truncate(MAX_JOB_NAME_LEN.saturating_sub(suffix.len()));
    let base = base.trim_end_matches('-');
    format!("{}{}", base, suffix)
}

/// Host the dump connects to
///
/// Replicas are preferred to keep load off the primary, but only when the
/// cluster actually has replicas.
pub fn dump_host(spec: &MySQLBackupSpec, cluster: &MySQLCluster) -> String {
    if spec.from_replica && cluster.spec.replicas > 1 {
        replicas_service_name(&cluster.name_any())
    } else {
        primary_service_name(&cluster.name_any())
    }
}

fn dump_file_name(job_name: &str) -> String {
    format!("{}.sql.gz", job_name)
}

fn join_key(prefix: Option<&str>, file: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, file),
        None => file.to_string(),
    }
}

/// URI of the dump written by the Job for the current generation
pub fn backup_location(backup: &MySQLBackup) -> String {
    job_location(backup, &backup_job_name(backup))
}

/// URI of the dump written by the Job `job_name`
pub fn job_location(backup: &MySQLBackup, job_name: &str) -> String {
    let file = dump_file_name(job_name);
    match &backup.spec.storage {
        BackupStorage::PersistentVolumeClaim { claim_name, path } => {
            format!("pvc://{}/{}", claim_name, join_key(path.as_deref(), &file))
        }
        BackupStorage::S3 { bucket, prefix, .. } => {
            format!("s3://{}/{}", bucket, join_key(prefix.as_deref(), &file))
        }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

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

fn dump_container(image: String, host: String, secret_name: &str, out_dir: &str, out_file: &str) -> Container {
    let script = format!(
        "set -euo pipefail\n\
         mkdir -p \"{dir}\"\n\
         mysqldump -h \"$BACKUP_HOST\" -uroot {args} | gzip > \"{dir}/{file}.tmp\"\n\
         mv \"{dir}/{file}.tmp\" \"{dir}/{file}\"\n",
        dir = out_dir,
        file = out_file,
        args = MYSQLDUMP_ARGS,
    );

    Container {
        name: "mysqldump".to_string(),
        image: Some(image),
        command: Some(vec!["bash".to_string(), "-c".to_string(), script]),
        env: Some(vec![
            env("BACKUP_HOST", host),
            secret_env("MYSQL_PWD", secret_name, ROOT_PASSWORD_KEY),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "backup".to_string(),
            mount_path: "/backup".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Generate the Job that performs one backup run
pub fn generate_backup_job(backup: &MySQLBackup, cluster: &MySQLCluster) -> Job {
    let job_name = backup_job_name(backup);
    let cluster_name = cluster.name_any();
    let file = dump_file_name(&job_name);
    let host = dump_host(&backup.spec, cluster);
    let secret_name = credentials_secret_name(&cluster_name);
    let dump_image = backup
        .spec
        .image
        .clone()
        .unwrap_or_else(|| cluster.spec.effective_image());

    let mut labels = standard_labels(&cluster_name);
    labels.insert("app.kubernetes.io/component".to_string(), "backup".to_string());
    labels.insert(BACKUP_LABEL.to_string(), backup.name_any());

    let (init_containers, containers, volumes) = match &backup.spec.storage {
        BackupStorage::PersistentVolumeClaim { claim_name, path } => {
            let dir = format!("/backup/{}", path.as_deref().unwrap_or("").trim_matches('/'));
            let dir = dir.trim_end_matches('/').to_string();
            let volume = Volume {
                name: "backup".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            };
            (
                None,
                vec![dump_container(dump_image, host, &secret_name, &dir, &file)],
                vec![volume],
            )
        }
        BackupStorage::S3 {
            bucket,
            prefix,
            endpoint,
            region,
            credentials_secret,
        } => {
            let key = join_key(prefix.as_deref(), &file);
            let endpoint_arg = endpoint
                .as_ref()
                .map(|e| format!(" --endpoint-url \"{}\"", e))
                .unwrap_or_default();

            let mut upload_env = vec![
                secret_env("AWS_ACCESS_KEY_ID", credentials_secret, "AWS_ACCESS_KEY_ID"),
                secret_env("AWS_SECRET_ACCESS_KEY", credentials_secret, "AWS_SECRET_ACCESS_KEY"),
            ];
            if let Some(region) = region {
                upload_env.push(env("AWS_DEFAULT_REGION", region.clone()));
            }

            let upload = Container {
                name: "upload".to_string(),
                image: Some(DEFAULT_S3_IMAGE.to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "aws s3 cp{} \"/backup/{}\" \"s3://{}/{}\"",
                        endpoint_arg, file, bucket, key
                    ),
                ]),
                env: Some(upload_env),
                volume_mounts: Some(vec![VolumeMount {
                    name: "backup".to_string(),
                    mount_path: "/backup".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            };
            let volume = Volume {
                name: "backup".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            };
            (
                Some(vec![dump_container(dump_image, host, &secret_name, "/backup", &file)]),
                vec![upload],
                vec![volume],
            )
        }
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: backup.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![backup_owner_reference(backup)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            active_deadline_seconds: Some(JOB_ACTIVE_DEADLINE_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers,
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name of a child backup spawned at `fire_time`
pub fn child_backup_name(parent: &str, fire_time: DateTime<Utc>) -> String {
    format!("{}-{}", parent, fire_time.format(CHILD_TIMESTAMP_FORMAT))
}

/// Generate the one-shot child backup a schedule spawns at `fire_time`
///
/// The child inherits the template's target and storage. Retention is
/// enforced by the parent, so the child carries none of its own.
pub fn generate_child_backup(parent: &MySQLBackup, fire_time: DateTime<Utc>) -> MySQLBackup {
    let parent_name = parent.name_any();

    let mut labels = BTreeMap::from([
        (SCHEDULE_LABEL.to_string(), parent_name.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            crate::resources::common::FIELD_MANAGER.to_string(),
        ),
    ]);
    if let Some(parent_labels) = parent.metadata.labels.as_ref() {
        for (k, v) in parent_labels {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    let mut child = MySQLBackup::new(
        &child_backup_name(&parent_name, fire_time),
        MySQLBackupSpec {
            schedule: None,
            suspend: false,
            retention: RetentionPolicy::default(),
            ..parent.spec.clone()
        },
    );
    child.metadata.namespace = parent.namespace();
    child.metadata.labels = Some(labels);
    child.metadata.owner_references = Some(vec![backup_owner_reference(parent)]);
    child
}
