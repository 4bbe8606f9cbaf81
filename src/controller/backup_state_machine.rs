//! Finite state machine for the MySQLBackup lifecycle
//!
//! One-shot backups move `Pending -> Running -> Succeeded | Failed`.
//! Schedule templates sit in `Scheduled`. `Succeeded` has no outgoing
//! transitions; `Failed` only leaves on a new generation.

use std::fmt;

use crate::crd::BackupPhase;

/// Events that drive the backup lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupEvent {
    /// The spec carries a schedule
    ScheduleConfigured,
    /// The schedule was removed from a template
    ScheduleRemoved,
    /// The backup Job exists
    JobStarted,
    /// The Job reported completion
    JobSucceeded,
    /// The Job reported failure
    JobFailed,
    /// The Job vanished while the backup was running
    JobMissing,
    /// A new generation of a failed backup
    SpecChanged,
    /// The spec failed validation
    ValidationFailed,
}

impl fmt::Display for BackupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupEvent::ScheduleConfigured => "ScheduleConfigured",
            BackupEvent::ScheduleRemoved => "ScheduleRemoved",
            BackupEvent::JobStarted => "JobStarted",
            BackupEvent::JobSucceeded => "JobSucceeded",
            BackupEvent::JobFailed => "JobFailed",
            BackupEvent::JobMissing => "JobMissing",
            BackupEvent::SpecChanged => "SpecChanged",
            BackupEvent::ValidationFailed => "ValidationFailed",
        };
        write!(f, "{}", name)
    }
}

struct BackupTransition {
    from: BackupPhase,
    event: BackupEvent,
    to: BackupPhase,
    description: &'static str,
}

const fn transition(
    from: BackupPhase,
    event: BackupEvent,
    to: BackupPhase,
    description: &'static str,
) -> BackupTransition {
    BackupTransition {
        from,
        event,
        to,
        description,
    }
}

/// State machine for the MySQLBackup lifecycle
pub struct BackupStateMachine {
    transitions: Vec<BackupTransition>,
}

impl Default for BackupStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStateMachine {
    pub fn new() -> Self {
        use BackupEvent::*;
        use BackupPhase::*;

        Self {
            transitions: vec![
                transition(Pending, ScheduleConfigured, Scheduled, "Schedule template"),
                transition(Pending, JobStarted, Running, "Backup Job created"),
                transition(Pending, ValidationFailed, Failed, "Spec is invalid"),
                transition(Scheduled, ScheduleRemoved, Pending, "Schedule removed"),
                transition(Scheduled, ValidationFailed, Failed, "Spec is invalid"),
                transition(Running, JobSucceeded, Succeeded, "Backup Job completed"),
                transition(Running, JobFailed, Failed, "Backup Job failed"),
                transition(Running, JobMissing, Failed, "Backup Job disappeared"),
                transition(Failed, SpecChanged, Pending, "Retrying with new spec"),
            ],
        }
    }

    /// Phase after `event`, or `None` if the event does not apply
    pub fn next(&self, current: BackupPhase, event: BackupEvent) -> Option<BackupPhase> {
        self.find(current, event).map(|t| t.to)
    }

    /// Human-readable description of a transition
    pub fn describe(&self, current: BackupPhase, event: BackupEvent) -> Option<&'static str> {
        self.find(current, event).map(|t| t.description)
    }

    pub fn can_transition(&self, current: BackupPhase, event: BackupEvent) -> bool {
        self.find(current, event).is_some()
    }

    /// Phase after `event`; an inapplicable event keeps the current phase
    pub fn apply(&self, current: BackupPhase, event: BackupEvent) -> BackupPhase {
        self.next(current, event).unwrap_or(current)
    }

    fn find(&self, current: BackupPhase, event: BackupEvent) -> Option<&BackupTransition> {
        self.transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
    }
}
