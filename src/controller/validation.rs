//! Validation logic for MySQLCluster and MySQLBackup specs
//!
//! Validation failures are terminal: the reconciler surfaces them in status
//! and waits for the next spec change instead of retrying.

use std::str::FromStr;

use chrono::Duration as ChronoDuration;
use cron::Schedule;

use crate::controller::error::{Error, Result};
use crate::crd::{BackupStorage, MySQLBackupSpec, MySQLClusterSpec};

/// Minimum number of members
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of members (async replication fan-out from one primary)
pub const MAX_REPLICAS: i32 = 9;

/// Supported MySQL release series
pub const SUPPORTED_VERSIONS: &[&str] = &["8.0", "8.4"];

/// `[mysqld]` settings the operator manages itself
pub const RESERVED_MYSQL_SETTINGS: &[&str] = &[
    "server-id",
    "server_id",
    "gtid-mode",
    "gtid_mode",
    "enforce-gtid-consistency",
    "enforce_gtid_consistency",
    "log-bin",
    "log_bin",
    "datadir",
    "read-only",
    "read_only",
    "super-read-only",
    "super_read_only",
];

/// Validate the cluster spec
pub fn validate_cluster_spec(spec: &MySQLClusterSpec) -> Result<()> {
    validate_replicas(spec.replicas)?;
    validate_version(&spec.version)?;
    validate_storage_size(&spec.storage.size)?;
    validate_mysql_config(spec)?;
    Ok(())
}

fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

/// Return the release series ("8.0") of a version string ("8.0.36")
pub fn release_series(version: &str) -> Option<String> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    if let Some(patch) = parts.next() {
        patch.parse::<u32>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(format!("{}.{}", major, minor))
}

fn validate_version(version: &str) -> Result<()> {
    let series = release_series(version).ok_or_else(|| {
        Error::ValidationError(format!(
            "version {:?} must look like MAJOR.MINOR or MAJOR.MINOR.PATCH",
            version
        ))
    })?;

    if !SUPPORTED_VERSIONS.contains(&series.as_str()) {
        return Err(Error::ValidationError(format!(
            "unsupported MySQL version {} (supported: {})",
            version,
            SUPPORTED_VERSIONS.join(", ")
        )));
    }

    Ok(())
}

fn validate_storage_size(size: &str) -> Result<()> {
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size must end with Gi, Mi, or Ti: {}",
            size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid storage size number: {}", size)))?;
    if num == 0 {
        return Err(Error::ValidationError(
            "storage size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_mysql_config(spec: &MySQLClusterSpec) -> Result<()> {
    for key in spec.mysql_config.keys() {
        if RESERVED_MYSQL_SETTINGS.contains(&key.as_str()) {
            return Err(Error::ValidationError(format!(
                "mysqlConfig key {} is managed by the operator",
                key
            )));
        }
        if key.is_empty() || key.contains(char::is_whitespace) || key.contains('=') {
            return Err(Error::ValidationError(format!(
                "mysqlConfig key {:?} is not a valid option name",
                key
            )));
        }
    }
    Ok(())
}

/// Validate a version change against the version the cluster last ran
///
/// Downgrades across release series are rejected; MySQL cannot open a data
/// directory written by a newer series.
pub fn validate_version_change(current: &str, desired: &str) -> Result<()> {
    let (Some(current_series), Some(desired_series)) =
        (release_series(current), release_series(desired))
    else {
        return Ok(());
    };

    let parse = |s: &str| -> (u32, u32) {
        let mut it = s.split('.').filter_map(|p| p.parse().ok());
        (it.next().unwrap_or(0), it.next().unwrap_or(0))
    };

    if parse(&desired_series) < parse(&current_series) {
        return Err(Error::ValidationError(format!(
            "MySQL downgrade from {} to {} is not supported",
            current, desired
        )));
    }

    Ok(())
}

/// Validate that an immutable storage class is not being changed
pub fn validate_storage_class_change(
    existing: Option<&str>,
    desired: Option<&str>,
) -> Result<()> {
    if existing != desired {
        return Err(Error::ValidationError(format!(
            "storage class cannot be changed after creation ({:?} -> {:?})",
            existing, desired
        )));
    }
    Ok(())
}

/// Parse a cron expression, accepting standard 5-field syntax
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::ValidationError(format!("invalid schedule {:?}: {}", expr, e)))
}

/// Parse a retention age such as "12h", "7d" or "2w"
pub fn parse_retention_age(age: &str) -> Option<ChronoDuration> {
    let age = age.trim();
    let unit = age.chars().last()?;
    let num: i64 = age[..age.len() - unit.len_utf8()].parse().ok()?;
    if num <= 0 {
        return None;
    }

    match unit.to_ascii_lowercase() {
        'h' => ChronoDuration::try_hours(num),
        'd' => ChronoDuration::try_days(num),
        'w' => ChronoDuration::try_weeks(num),
        _ => None,
    }
}

/// Validate the backup spec
pub fn validate_backup_spec(spec: &MySQLBackupSpec) -> Result<()> {
    if spec.cluster_ref.trim().is_empty() {
        return Err(Error::ValidationError(
            "clusterRef must name a MySQLCluster".to_string(),
        ));
    }

    if let Some(ref schedule) = spec.schedule {
        parse_schedule(schedule)?;
    }

    if let Some(keep_last) = spec.retention.keep_last
        && keep_last < 1
    {
        return Err(Error::ValidationError(format!(
            "retention.keepLast must be at least 1, got {}",
            keep_last
        )));
    }

    if let Some(ref max_age) = spec.retention.max_age
        && parse_retention_age(max_age).is_none()
    {
        return Err(Error::ValidationError(format!(
            "retention.maxAge {:?} must be a positive number followed by h, d or w",
            max_age
        )));
    }

    match &spec.storage {
        BackupStorage::PersistentVolumeClaim { claim_name, .. } if claim_name.is_empty() => {
            Err(Error::ValidationError(
                "storage.claimName must not be empty".to_string(),
            ))
        }
        BackupStorage::S3 {
            bucket,
            credentials_secret,
            ..
        } if bucket.is_empty() || credentials_secret.is_empty() => Err(Error::ValidationError(
            "storage.bucket and storage.credentialsSecret must not be empty".to_string(),
        )),
        _ => Ok(()),
    }
}
