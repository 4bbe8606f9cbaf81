//! Additional unit tests for cluster and backup lifecycle transitions

use mysql_operator::controller::cluster_state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult, determine_event,
    next_phase,
};
use mysql_operator::controller::{BackupEvent, BackupStateMachine};
use mysql_operator::crd::{BackupPhase, ClusterPhase};

fn converged(members: i32) -> TransitionContext {
    TransitionContext {
        ready_members: members,
        desired_members: members,
        healthy: true,
        ..Default::default()
    }
}

mod transition_context_tests {
    use super::*;

    #[test]
    fn test_new_context() {
        let ctx = TransitionContext::new(2, 3);
        assert_eq!(ctx.ready_members, 2);
        assert_eq!(ctx.desired_members, 3);
        assert!(!ctx.healthy);
        assert!(!ctx.spec_changed);
        assert!(ctx.validation_error.is_none());
    }

    #[test]
    fn test_all_members_ready() {
        assert!(TransitionContext::new(3, 3).all_members_ready());
        assert!(!TransitionContext::new(2, 3).all_members_ready());
    }

    #[test]
    fn test_pending_work_blocks_convergence() {
        let ctx = TransitionContext {
            work_remaining: true,
            ..converged(3)
        };
        assert!(!ctx.is_converged());
        assert!(converged(3).is_converged());
    }
}

mod determine_event_tests {
    use super::*;

    #[test]
    fn test_validation_error_wins() {
        let ctx = TransitionContext {
            validation_error: Some("bad".to_string()),
            spec_changed: true,
            ..converged(3)
        };
        for phase in ClusterPhase::ALL {
            assert_eq!(determine_event(&phase, &ctx), ClusterEvent::ValidationFailed);
        }
    }

    #[test]
    fn test_spec_change_while_provisioning_keeps_reconciling() {
        let ctx = TransitionContext {
            spec_changed: true,
            ..TransitionContext::new(1, 3)
        };
        assert_eq!(
            determine_event(&ClusterPhase::Provisioning, &ctx),
            ClusterEvent::Reconciling
        );
        assert_eq!(
            determine_event(&ClusterPhase::Ready, &ctx),
            ClusterEvent::SpecChanged
        );
    }

    #[test]
    fn test_unhealthy_ready_cluster_loses_health() {
        let ctx = TransitionContext::new(2, 3);
        assert_eq!(
            determine_event(&ClusterPhase::Ready, &ctx),
            ClusterEvent::HealthLost
        );
        assert_eq!(
            determine_event(&ClusterPhase::Degraded, &ctx),
            ClusterEvent::Reconciling
        );
    }
}

mod next_phase_tests {
    use super::*;

    #[test]
    fn test_provisioning_to_ready() {
        let (phase, event) = next_phase(ClusterPhase::Provisioning, &converged(3));
        assert_eq!(phase, ClusterPhase::Ready);
        assert_eq!(event, ClusterEvent::Converged);
    }

    #[test]
    fn test_provisioning_never_degrades() {
        let (phase, _) = next_phase(ClusterPhase::Provisioning, &TransitionContext::new(0, 3));
        assert_eq!(phase, ClusterPhase::Provisioning);
    }

    #[test]
    fn test_ready_to_degraded_and_back() {
        let (degraded, _) = next_phase(ClusterPhase::Ready, &TransitionContext::new(2, 3));
        assert_eq!(degraded, ClusterPhase::Degraded);

        let (healed, event) = next_phase(degraded, &converged(3));
        assert_eq!(healed, ClusterPhase::Ready);
        assert_eq!(event, ClusterEvent::Converged);
    }

    #[test]
    fn test_ready_stays_ready_when_converged() {
        let (phase, _) = next_phase(ClusterPhase::Ready, &converged(1));
        assert_eq!(phase, ClusterPhase::Ready);
    }

    #[test]
    fn test_failed_only_leaves_on_spec_change() {
        let (stuck, _) = next_phase(ClusterPhase::Failed, &converged(3));
        assert_eq!(stuck, ClusterPhase::Failed);

        let ctx = TransitionContext {
            spec_changed: true,
            ..converged(3)
        };
        let (phase, event) = next_phase(ClusterPhase::Failed, &ctx);
        assert_eq!(phase, ClusterPhase::Provisioning);
        assert_eq!(event, ClusterEvent::SpecChanged);
    }

    #[test]
    fn test_every_phase_fails_on_validation_error() {
        let ctx = TransitionContext {
            validation_error: Some("replica count 0 is below minimum 1".to_string()),
            ..Default::default()
        };
        for phase in ClusterPhase::ALL {
            assert_eq!(next_phase(phase, &ctx).0, ClusterPhase::Failed);
        }
    }
}

mod guard_tests {
    use super::*;

    #[test]
    fn test_converged_guard_requires_all_members() {
        let sm = ClusterStateMachine::new();
        let ctx = TransitionContext {
            healthy: true,
            ..TransitionContext::new(2, 3)
        };
        let result = sm.transition(&ClusterPhase::Provisioning, ClusterEvent::Converged, &ctx);
        match result {
            TransitionResult::GuardFailed { reason, .. } => {
                assert!(reason.contains("2/3"), "unexpected reason {}", reason)
            }
            other => panic!("expected guard failure, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_transition_is_rejected() {
        let sm = ClusterStateMachine::new();
        let result = sm.transition(
            &ClusterPhase::Provisioning,
            ClusterEvent::HealthLost,
            &TransitionContext::default(),
        );
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
        assert_eq!(
            result.resulting_phase(ClusterPhase::Provisioning),
            ClusterPhase::Provisioning
        );
    }

    #[test]
    fn test_valid_events_from_ready() {
        let sm = ClusterStateMachine::new();
        let events = sm.valid_events(&ClusterPhase::Ready);
        assert!(events.contains(&&ClusterEvent::HealthLost));
        assert!(events.contains(&&ClusterEvent::SpecChanged));
        assert!(events.contains(&&ClusterEvent::ValidationFailed));
        assert!(!events.contains(&&ClusterEvent::Converged));
    }
}

mod backup_transition_tests {
    use super::*;

    #[test]
    fn test_one_shot_lifecycle() {
        let sm = BackupStateMachine::new();
        let running = sm.apply(BackupPhase::Pending, BackupEvent::JobStarted);
        assert_eq!(running, BackupPhase::Running);
        assert_eq!(
            sm.apply(running, BackupEvent::JobSucceeded),
            BackupPhase::Succeeded
        );
        assert_eq!(sm.apply(running, BackupEvent::JobFailed), BackupPhase::Failed);
        assert_eq!(sm.apply(running, BackupEvent::JobMissing), BackupPhase::Failed);
    }

    #[test]
    fn test_succeeded_is_final() {
        let sm = BackupStateMachine::new();
        for event in [
            BackupEvent::ScheduleConfigured,
            BackupEvent::ScheduleRemoved,
            BackupEvent::JobStarted,
            BackupEvent::JobSucceeded,
            BackupEvent::JobFailed,
            BackupEvent::JobMissing,
            BackupEvent::SpecChanged,
            BackupEvent::ValidationFailed,
        ] {
            assert!(!sm.can_transition(BackupPhase::Succeeded, event));
            assert_eq!(sm.apply(BackupPhase::Succeeded, event), BackupPhase::Succeeded);
        }
    }

    #[test]
    fn test_failed_retries_only_on_spec_change() {
        let sm = BackupStateMachine::new();
        assert_eq!(
            sm.apply(BackupPhase::Failed, BackupEvent::JobStarted),
            BackupPhase::Failed
        );
        assert_eq!(
            sm.apply(BackupPhase::Failed, BackupEvent::SpecChanged),
            BackupPhase::Pending
        );
    }

    #[test]
    fn test_schedule_template_transitions() {
        let sm = BackupStateMachine::new();
        assert_eq!(
            sm.apply(BackupPhase::Pending, BackupEvent::ScheduleConfigured),
            BackupPhase::Scheduled
        );
        assert_eq!(
            sm.apply(BackupPhase::Scheduled, BackupEvent::ScheduleConfigured),
            BackupPhase::Scheduled
        );
        assert_eq!(
            sm.apply(BackupPhase::Scheduled, BackupEvent::ScheduleRemoved),
            BackupPhase::Pending
        );
        assert!(sm.describe(BackupPhase::Scheduled, BackupEvent::ValidationFailed).is_some());
    }
}
