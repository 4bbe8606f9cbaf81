//! Finite state machine for the MySQLCluster lifecycle
//!
//! Transitions are driven by what the current pass observed (health, spec
//! generation, validation), never by elapsed time. An event with no entry in
//! the transition table keeps the cluster in its current phase.

use std::fmt;

use crate::crd::ClusterPhase;

/// Events that trigger state transitions in the cluster lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// Every member is ready, one writable primary, replicas replicating,
    /// and the planner has nothing left to do
    Converged,
    /// A previously healthy cluster no longer is
    HealthLost,
    /// `metadata.generation` moved past the last observed generation
    SpecChanged,
    /// The spec failed validation
    ValidationFailed,
    /// Work is still in progress; no phase change
    Reconciling,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::Converged => write!(f, "Converged"),
            ClusterEvent::HealthLost => write!(f, "HealthLost"),
            ClusterEvent::SpecChanged => write!(f, "SpecChanged"),
            ClusterEvent::ValidationFailed => write!(f, "ValidationFailed"),
            ClusterEvent::Reconciling => write!(f, "Reconciling"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Number of ready members
    pub ready_members: i32,
    /// Desired number of members
    pub desired_members: i32,
    /// Whether the health assessment passed
    pub healthy: bool,
    /// Whether the planner still has actions queued
    pub work_remaining: bool,
    /// Whether the spec generation differs from the observed generation
    pub spec_changed: bool,
    /// Validation failure message, if any
    pub validation_error: Option<String>,
}

impl TransitionContext {
    pub fn new(ready_members: i32, desired_members: i32) -> Self {
        Self {
            ready_members,
            desired_members,
            ..Default::default()
        }
    }

    pub fn all_members_ready(&self) -> bool {
        self.ready_members >= self.desired_members
    }

    pub fn is_converged(&self) -> bool {
        self.healthy && !self.work_remaining && self.all_members_ready()
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterPhase,
    pub to: ClusterPhase,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase the cluster is in after this result is applied
    pub fn resulting_phase(&self, current: ClusterPhase) -> ClusterPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// State machine for the MySQLCluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        use ClusterEvent::*;
        use ClusterPhase::*;

        Self {
            transitions: vec![
                // === Provisioning ===
                Transition::new(
                    Provisioning,
                    Ready,
                    Converged,
                    "All members ready with a writable primary",
                ),
                Transition::new(
                    Provisioning,
                    Failed,
                    ValidationFailed,
                    "Spec is invalid",
                ),
                // === Ready ===
                Transition::new(Ready, Degraded, HealthLost, "Cluster health lost"),
                Transition::new(
                    Ready,
                    Provisioning,
                    SpecChanged,
                    "Spec changed, reshaping cluster",
                ),
                Transition::new(Ready, Failed, ValidationFailed, "Spec is invalid"),
                // === Degraded ===
                Transition::new(Degraded, Ready, Converged, "Cluster healed"),
                Transition::new(
                    Degraded,
                    Provisioning,
                    SpecChanged,
                    "Spec changed while degraded",
                ),
                Transition::new(Degraded, Failed, ValidationFailed, "Spec is invalid"),
                // === Failed ===
                Transition::new(
                    Failed,
                    Provisioning,
                    SpecChanged,
                    "Spec changed, retrying",
                ),
                Transition::new(Failed, Failed, ValidationFailed, "Spec is still invalid"),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ClusterPhase, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ClusterPhase) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            (ClusterPhase::Ready, ClusterEvent::Converged) => {
                if !ctx.all_members_ready() {
                    Some(format!(
                        "Not all members ready: {}/{}",
                        ctx.ready_members, ctx.desired_members
                    ))
                } else if !ctx.is_converged() {
                    Some("Cluster has not converged".to_string())
                } else {
                    None
                }
            }
            (ClusterPhase::Degraded, ClusterEvent::HealthLost) if ctx.healthy => {
                Some("Cluster is healthy".to_string())
            }
            _ => None,
        }
    }
}

/// Determine the event the current pass represents
pub fn determine_event(current_phase: &ClusterPhase, ctx: &TransitionContext) -> ClusterEvent {
    if ctx.validation_error.is_some() {
        return ClusterEvent::ValidationFailed;
    }

    if ctx.spec_changed
        && matches!(
            current_phase,
            ClusterPhase::Ready | ClusterPhase::Degraded | ClusterPhase::Failed
        )
    {
        return ClusterEvent::SpecChanged;
    }

    if ctx.is_converged() {
        return ClusterEvent::Converged;
    }

    if *current_phase == ClusterPhase::Ready && !ctx.healthy {
        return ClusterEvent::HealthLost;
    }

    ClusterEvent::Reconciling
}

/// Compute the phase after the current pass
pub fn next_phase(current: ClusterPhase, ctx: &TransitionContext) -> (ClusterPhase, ClusterEvent) {
    let event = determine_event(&current, ctx);
    let result = ClusterStateMachine::new().transition(&current, event.clone(), ctx);
    (result.resulting_phase(current), event)
}
