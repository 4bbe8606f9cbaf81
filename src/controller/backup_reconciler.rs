//! Reconciliation logic for MySQLBackup resources
//!
//! One-shot backups create a Job for their current generation and follow it
//! to completion. Schedule templates spawn one-shot children named after the
//! fire time and prune old children according to the retention policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cron::Schedule;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::api::{EventRecord, OperatorApi};
use crate::controller::backup_state_machine::{BackupEvent, BackupStateMachine};
use crate::controller::cluster_reconciler::policy_for;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::single_flight::resource_key;
use crate::controller::status::{
    ConditionBuilder, StatusWrite, condition_status, condition_types, write_backup_status,
};
use crate::controller::validation::{parse_retention_age, parse_schedule, validate_backup_spec};
use crate::crd::{
    BackupPhase, ClusterPhase, MemberRole, MySQLBackup, MySQLBackupStatus, MySQLCluster,
    RetentionPolicy,
};
use crate::resources::backup::{
    backup_job_name, generate_backup_job, generate_child_backup, job_location,
};
use crate::resources::common::SCHEDULE_LABEL;

/// Kind used in lock keys, metrics and logs
pub const BACKUP_KIND: &str = "MySQLBackup";

/// Longest a schedule template sleeps between passes
pub const SCHEDULE_MAX_REQUEUE: Duration = Duration::from_secs(300);

/// Poll interval while waiting for the target cluster
const CLUSTER_WAIT_REQUEUE: Duration = Duration::from_secs(30);

/// Poll interval while a backup Job runs
const JOB_POLL_REQUEUE: Duration = Duration::from_secs(15);

/// Upper bound on fire times walked when catching up a schedule
const MAX_MISSED_RUNS: usize = 1024;

/// What one backup pass did
#[derive(Debug, Clone, PartialEq)]
pub struct BackupPassOutcome {
    pub requeue: Action,
    /// Phase after the pass; `None` when the backup is gone
    pub phase: Option<BackupPhase>,
    pub status_write: Option<StatusWrite>,
    /// Child backup created by a schedule this pass
    pub spawned: Option<String>,
    /// Backups deleted by retention this pass
    pub deleted: Vec<String>,
}

impl BackupPassOutcome {
    fn idle(requeue: Action, phase: Option<BackupPhase>) -> Self {
        Self {
            requeue,
            phase,
            status_write: None,
            spawned: None,
            deleted: Vec::new(),
        }
    }

    fn written(requeue: Action, phase: BackupPhase, write: StatusWrite) -> Self {
        Self {
            status_write: Some(write),
            ..Self::idle(requeue, Some(phase))
        }
    }
}

/// Convert an API server timestamp through its RFC 3339 wire form
pub fn time_to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let wire = serde_json::to_value(time).ok()?;
    parse_rfc3339(wire.as_str())
}

fn parse_rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Main reconciliation function for backups
#[instrument(skip(backup, ctx), fields(name = %backup.name_any(), namespace = backup.namespace().unwrap_or_default()))]
pub async fn reconcile_backup(backup: Arc<MySQLBackup>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = backup
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = backup.name_any();
    let key = resource_key(BACKUP_KIND, &ns, &name);

    let _guard = ctx.locks.acquire(&key).await;
    debug!("Reconciling MySQLBackup");

    let result = run_backup_pass(ctx.api.as_ref(), &ns, &name, Utc::now()).await;

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(outcome) => {
                health.metrics.record_reconcile(
                    BACKUP_KIND,
                    &ns,
                    &name,
                    start.elapsed().as_secs_f64(),
                );
                health.metrics.set_backup_phase(&ns, &name, outcome.phase);
                health.touch();
            }
            Err(_) => health.metrics.record_error(BACKUP_KIND, &ns, &name),
        }
    }

    let outcome = result?;
    ctx.retries.reset(&key);
    Ok(outcome.requeue)
}

/// Error policy for the backup controller
pub fn backup_error_policy(backup: Arc<MySQLBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = resource_key(
        BACKUP_KIND,
        &backup.namespace().unwrap_or_default(),
        &backup.name_any(),
    );
    policy_for(&key, error, &ctx)
}

/// Run one pass for the backup `ns/name` as of `now`
pub async fn run_backup_pass<A: OperatorApi + ?Sized>(
    api: &A,
    ns: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<BackupPassOutcome> {
    let Some(backup) = api.get_backup(ns, name).await? else {
        debug!("MySQLBackup no longer exists");
        return Ok(BackupPassOutcome::idle(Action::await_change(), None));
    };
    if backup.metadata.deletion_timestamp.is_some() {
        return Ok(BackupPassOutcome::idle(Action::await_change(), None));
    }

    let sm = BackupStateMachine::new();
    let mut status = backup.status.clone().unwrap_or_default();

    match status.phase {
        BackupPhase::Succeeded => return expire_if_due(api, &backup, now).await,
        BackupPhase::Failed => {
            if status.observed_generation == backup.metadata.generation {
                return Ok(BackupPassOutcome::idle(
                    Action::await_change(),
                    Some(BackupPhase::Failed),
                ));
            }
            info!("Failed backup has a new generation, retrying");
            status = MySQLBackupStatus {
                phase: sm.apply(BackupPhase::Failed, BackupEvent::SpecChanged),
                conditions: status.conditions,
                ..Default::default()
            };
        }
        _ => {}
    }

    // A running Job is followed to completion whatever the spec says now
    if status.phase != BackupPhase::Running {
        match validate_backup_spec(&backup.spec) {
            Ok(()) => {}
            Err(Error::ValidationError(message)) => {
                return fail_invalid(api, &backup, status, &message).await;
            }
            Err(e) => return Err(e),
        }
    }

    if backup.spec.schedule.is_some()
        && matches!(status.phase, BackupPhase::Pending | BackupPhase::Scheduled)
    {
        return reconcile_schedule(api, &backup, status, now).await;
    }

    if status.phase == BackupPhase::Scheduled {
        status = MySQLBackupStatus {
            phase: sm.apply(BackupPhase::Scheduled, BackupEvent::ScheduleRemoved),
            conditions: status.conditions,
            ..Default::default()
        };
    }

    match status.phase {
        BackupPhase::Running => follow_job(api, &backup, status).await,
        _ => start_backup(api, &backup, status, now).await,
    }
}

async fn fail_invalid<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    status: MySQLBackupStatus,
    message: &str,
) -> Result<BackupPassOutcome> {
    warn!(error = %message, "MySQLBackup spec is invalid");
    let sm = BackupStateMachine::new();
    let phase = sm.apply(status.phase, BackupEvent::ValidationFailed);
    let generation = backup.metadata.generation;
    let status = MySQLBackupStatus {
        phase,
        observed_generation: generation,
        message: Some(message.to_string()),
        conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
            .ready(false, "InvalidSpec", message)
            .build(),
        ..status
    };
    let write = write_backup_status(api, backup, &status).await?;
    if write == StatusWrite::Written {
        api.publish_event(
            &backup.object_ref(&()),
            EventRecord::warning("InvalidSpec", "Validate", message),
        )
        .await;
    }
    Ok(BackupPassOutcome::written(
        Action::await_change(),
        phase,
        write,
    ))
}

/// Whether a cluster can serve a dump right now
pub fn cluster_can_serve(cluster: &MySQLCluster) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return false;
    };
    if !matches!(status.phase, ClusterPhase::Ready | ClusterPhase::Degraded) {
        return false;
    }
    let Some(primary) = status.primary.as_deref() else {
        return false;
    };
    status
        .members
        .iter()
        .any(|m| m.name == primary && m.ready && m.role == Some(MemberRole::Primary))
}

async fn start_backup<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    status: MySQLBackupStatus,
    now: DateTime<Utc>,
) -> Result<BackupPassOutcome> {
    let ns = backup.namespace().unwrap_or_default();
    let generation = backup.metadata.generation;
    let cluster_ref = &backup.spec.cluster_ref;

    let cluster = api.get_cluster(&ns, cluster_ref).await?;
    let ready = match &cluster {
        None => {
            let message = format!("MySQLCluster {} not found", cluster_ref);
            let status = MySQLBackupStatus {
                phase: BackupPhase::Pending,
                observed_generation: generation,
                message: Some(message.clone()),
                conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
                    .set_condition(
                        condition_types::CLUSTER_NOT_FOUND,
                        condition_status::TRUE,
                        "ClusterNotFound",
                        &message,
                    )
                    .ready(false, "WaitingForCluster", &message)
                    .build(),
                ..status
            };
            let write = write_backup_status(api, backup, &status).await?;
            return Ok(BackupPassOutcome::written(
                Action::requeue(CLUSTER_WAIT_REQUEUE),
                BackupPhase::Pending,
                write,
            ));
        }
        Some(cluster) if !cluster_can_serve(cluster) => {
            let message = format!("Waiting for MySQLCluster {} to have a ready primary", cluster_ref);
            let status = MySQLBackupStatus {
                phase: BackupPhase::Pending,
                observed_generation: generation,
                message: Some(message.clone()),
                conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
                    .remove(condition_types::CLUSTER_NOT_FOUND)
                    .ready(false, "WaitingForCluster", &message)
                    .build(),
                ..status
            };
            let write = write_backup_status(api, backup, &status).await?;
            return Ok(BackupPassOutcome::written(
                Action::requeue(CLUSTER_WAIT_REQUEUE),
                BackupPhase::Pending,
                write,
            ));
        }
        Some(cluster) => cluster,
    };

    let job_name = backup_job_name(backup);
    if api.get_job(&ns, &job_name).await?.is_none() {
        api.create_job(&ns, &generate_backup_job(backup, ready)).await?;
        info!(job = %job_name, cluster = %cluster_ref, "Created backup Job");
        api.publish_event(
            &backup.object_ref(&()),
            EventRecord::normal(
                "BackupStarted",
                "CreateJob",
                format!("Created Job {}", job_name),
            ),
        )
        .await;
    }

    let phase = BackupStateMachine::new().apply(BackupPhase::Pending, BackupEvent::JobStarted);
    let status = MySQLBackupStatus {
        phase,
        job_name: Some(job_name.clone()),
        start_time: Some(now.to_rfc3339()),
        completion_time: None,
        location: None,
        observed_generation: generation,
        message: Some(format!("Job {} running", job_name)),
        conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
            .remove(condition_types::CLUSTER_NOT_FOUND)
            .ready(false, "Running", "Backup Job is running")
            .build(),
        ..status
    };
    let write = write_backup_status(api, backup, &status).await?;
    Ok(BackupPassOutcome::written(
        Action::requeue(JOB_POLL_REQUEUE),
        phase,
        write,
    ))
}

/// Observed state of a backup Job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded { completed_at: Option<DateTime<Utc>> },
    Failed(String),
}

/// Read completion from the Job's status conditions
pub fn job_state(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Active;
    };
    let conditions = status.conditions.as_deref().unwrap_or_default();
    let is_true = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };

    if let Some(failed) = is_true("Failed") {
        let reason = failed
            .message
            .clone()
            .or_else(|| failed.reason.clone())
            .unwrap_or_else(|| "Job failed".to_string());
        return JobState::Failed(reason);
    }
    if is_true("Complete").is_some() || status.succeeded.unwrap_or(0) > 0 {
        return JobState::Succeeded {
            completed_at: status.completion_time.as_ref().and_then(time_to_utc),
        };
    }
    JobState::Active
}

async fn follow_job<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    status: MySQLBackupStatus,
) -> Result<BackupPassOutcome> {
    let ns = backup.namespace().unwrap_or_default();
    let sm = BackupStateMachine::new();
    let job_name = status
        .job_name
        .clone()
        .unwrap_or_else(|| backup_job_name(backup));
    // The Job belongs to the generation that started it
    let generation = status.observed_generation;
    let reference = backup.object_ref(&());

    let (event, message) = match api.get_job(&ns, &job_name).await? {
        None => (
            BackupEvent::JobMissing,
            format!("Job {} not found", job_name),
        ),
        Some(job) => match job_state(&job) {
            JobState::Active => {
                return Ok(BackupPassOutcome::idle(
                    Action::requeue(JOB_POLL_REQUEUE),
                    Some(BackupPhase::Running),
                ));
            }
            JobState::Succeeded { completed_at } => {
                let location = job_location(backup, &job_name);
                let status = MySQLBackupStatus {
                    phase: sm.apply(BackupPhase::Running, BackupEvent::JobSucceeded),
                    completion_time: Some(completed_at.unwrap_or_else(Utc::now).to_rfc3339()),
                    location: Some(location.clone()),
                    message: Some(format!("Backup written to {}", location)),
                    conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
                        .ready(true, "Succeeded", "Backup completed")
                        .set_condition(
                            condition_types::COMPLETE,
                            condition_status::TRUE,
                            "JobComplete",
                            &format!("Job {} completed", job_name),
                        )
                        .build(),
                    ..status
                };
                let write = write_backup_status(api, backup, &status).await?;
                api.publish_event(
                    &reference,
                    EventRecord::normal(
                        "BackupSucceeded",
                        "Backup",
                        format!("Backup written to {}", location),
                    ),
                )
                .await;
                return Ok(BackupPassOutcome::written(
                    Action::await_change(),
                    status.phase,
                    write,
                ));
            }
            JobState::Failed(reason) => (BackupEvent::JobFailed, reason),
        },
    };

    let phase = sm.apply(BackupPhase::Running, event);
    let status = MySQLBackupStatus {
        phase,
        message: Some(message.clone()),
        conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
            .ready(false, "Failed", &message)
            .set_condition(
                condition_types::COMPLETE,
                condition_status::FALSE,
                &event.to_string(),
                &message,
            )
            .build(),
        ..status
    };
    let write = write_backup_status(api, backup, &status).await?;
    api.publish_event(
        &reference,
        EventRecord::warning("BackupFailed", "Backup", message),
    )
    .await;
    Ok(BackupPassOutcome::written(
        Action::await_change(),
        phase,
        write,
    ))
}

/// Delete a standalone backup once it is older than its `maxAge`
async fn expire_if_due<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    now: DateTime<Utc>,
) -> Result<BackupPassOutcome> {
    let steady = BackupPassOutcome::idle(Action::await_change(), Some(BackupPhase::Succeeded));

    // Children are pruned by their schedule
    if backup.labels().contains_key(SCHEDULE_LABEL) {
        return Ok(steady);
    }
    let Some(max_age) = backup
        .spec
        .retention
        .max_age
        .as_deref()
        .and_then(parse_retention_age)
    else {
        return Ok(steady);
    };
    let Some(completed) = completed_at(backup) else {
        return Ok(steady);
    };

    let expires = completed + max_age;
    if expires > now {
        let wait = (expires - now).to_std().unwrap_or(SCHEDULE_MAX_REQUEUE);
        return Ok(BackupPassOutcome {
            requeue: Action::requeue(wait.min(SCHEDULE_MAX_REQUEUE * 12)),
            ..steady
        });
    }

    let ns = backup.namespace().unwrap_or_default();
    let name = backup.name_any();
    info!(age = %max_age, "Backup expired, deleting");
    api.delete_backup(&ns, &name).await?;
    Ok(BackupPassOutcome {
        phase: None,
        deleted: vec![name],
        ..steady
    })
}

fn completed_at(backup: &MySQLBackup) -> Option<DateTime<Utc>> {
    parse_rfc3339(
        backup
            .status
            .as_ref()
            .and_then(|s| s.completion_time.as_deref()),
    )
    .or_else(|| {
        backup
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(time_to_utc)
    })
}

/// Most recent fire time in `(after, now]`, if any
pub fn latest_due(
    schedule: &Schedule,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut latest = None;
    let mut walked = 0;
    for fire in schedule.after(&after).take_while(|t| *t <= now) {
        latest = Some(fire);
        walked += 1;
        if walked >= MAX_MISSED_RUNS {
            // Too far behind to walk every run; fire once for now
            return Some(now);
        }
    }
    latest
}

/// Children to delete under `retention`
///
/// Only finished children are considered. Succeeded children beyond the
/// newest `keepLast` go, as does any finished child older than `maxAge`.
pub fn retention_victims(
    children: &[MySQLBackup],
    retention: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut finished: Vec<(&MySQLBackup, DateTime<Utc>)> = children
        .iter()
        .filter(|b| b.status.as_ref().is_some_and(|s| s.phase.is_terminal()))
        .filter_map(|b| completed_at(b).map(|t| (b, t)))
        .collect();
    finished.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name_any().cmp(&b.0.name_any())));

    let mut victims = Vec::new();

    if let Some(keep) = retention.keep_last {
        let keep = usize::try_from(keep.max(0)).unwrap_or(0);
        victims.extend(
            finished
                .iter()
                .filter(|(b, _)| b.status.as_ref().is_some_and(|s| s.phase == BackupPhase::Succeeded))
                .skip(keep)
                .map(|(b, _)| b.name_any()),
        );
    }

    if let Some(max_age) = retention.max_age.as_deref().and_then(parse_retention_age) {
        victims.extend(
            finished
                .iter()
                .filter(|(_, t)| *t + max_age < now)
                .map(|(b, _)| b.name_any()),
        );
    }

    victims.sort();
    victims.dedup();
    victims
}

async fn reconcile_schedule<A: OperatorApi + ?Sized>(
    api: &A,
    backup: &MySQLBackup,
    status: MySQLBackupStatus,
    now: DateTime<Utc>,
) -> Result<BackupPassOutcome> {
    let ns = backup.namespace().unwrap_or_default();
    let name = backup.name_any();
    let generation = backup.metadata.generation;
    let expr = backup.spec.schedule.as_deref().unwrap_or_default();
    let schedule = parse_schedule(expr)?;
    let reference = backup.object_ref(&());

    let phase = BackupStateMachine::new().apply(status.phase, BackupEvent::ScheduleConfigured);

    let anchor = parse_rfc3339(status.last_schedule_time.as_deref())
        .or_else(|| {
            backup
                .metadata
                .creation_timestamp
                .as_ref()
                .and_then(time_to_utc)
        })
        .unwrap_or(now);

    let mut last_fire = parse_rfc3339(status.last_schedule_time.as_deref());
    let mut spawned = None;
    if !backup.spec.suspend
        && let Some(fire) = latest_due(&schedule, anchor, now)
    {
        let child = generate_child_backup(backup, fire);
        let child_name = child.name_any();
        api.create_backup(&ns, &child).await?;
        info!(child = %child_name, fire_time = %fire, "Spawned scheduled backup");
        api.publish_event(
            &reference,
            EventRecord::normal(
                "BackupScheduled",
                "CreateBackup",
                format!("Created backup {}", child_name),
            ),
        )
        .await;
        last_fire = Some(fire);
        spawned = Some(child_name);
    }

    let next = schedule.after(&last_fire.unwrap_or(anchor)).next();

    let children = api
        .list_backups(&ns, &format!("{}={}", SCHEDULE_LABEL, name))
        .await?;
    let deleted = retention_victims(&children, &backup.spec.retention, now);
    for victim in &deleted {
        api.delete_backup(&ns, victim).await?;
    }
    if !deleted.is_empty() {
        info!(count = deleted.len(), "Pruned backups by retention");
        api.publish_event(
            &reference,
            EventRecord::normal(
                "RetentionApplied",
                "DeleteBackup",
                format!("Deleted {}", deleted.join(", ")),
            ),
        )
        .await;
    }

    let (message, next_schedule_time, reason) = match (backup.spec.suspend, next) {
        (true, _) => ("Schedule suspended".to_string(), None, "Suspended"),
        (false, Some(next)) => (
            format!("Next backup at {}", next.to_rfc3339()),
            Some(next.to_rfc3339()),
            "Scheduled",
        ),
        (false, None) => ("Schedule has no future runs".to_string(), None, "Exhausted"),
    };

    let status = MySQLBackupStatus {
        phase,
        last_schedule_time: last_fire.map(|t| t.to_rfc3339()),
        next_schedule_time,
        observed_generation: generation,
        message: Some(message.clone()),
        conditions: ConditionBuilder::from_existing(status.conditions.clone(), generation)
            .ready(!backup.spec.suspend, reason, &message)
            .build(),
        ..status
    };
    let write = write_backup_status(api, backup, &status).await?;

    let requeue = match (backup.spec.suspend, next) {
        (false, Some(next)) => (next - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .clamp(Duration::from_secs(1), SCHEDULE_MAX_REQUEUE),
        _ => SCHEDULE_MAX_REQUEUE,
    };

    Ok(BackupPassOutcome {
        requeue: Action::requeue(requeue),
        phase: Some(phase),
        status_write: Some(write),
        spawned,
        deleted,
    })
}
