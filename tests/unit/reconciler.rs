//! Reconcile passes driven end to end against the in-memory API server

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use mysql_operator::config::OperatorConfig;
use mysql_operator::controller::executor::execute;
use mysql_operator::controller::planner::Action as PlannedAction;
use mysql_operator::controller::{
    ActionOutcome, CLUSTER_KIND, Context, Error, OperatorApi, PassOutcome, StatusWrite,
    error_policy, reconcile, resource_key, run_pass,
};
use mysql_operator::crd::{ClusterPhase, MemberRole, StorageSpec};
use mysql_operator::health::HealthState;
use mysql_operator::resources::common::member_host;

use crate::common::{FakeApi, FakeMysql, MySQLClusterBuilder, create_test_cluster, member_pod, with_role};

const NS: &str = "db";
const MAX_PASSES: usize = 40;

async fn pass(fake: &FakeApi, name: &str) -> PassOutcome {
    run_pass(fake, NS, name, &OperatorConfig::default())
        .await
        .unwrap()
}

/// Run passes, letting pods start in between, until a pass finds nothing to
/// do on a Ready cluster. Returns the names of the actions executed.
async fn converge(fake: &FakeApi, name: &str) -> Vec<&'static str> {
    let mut executed = Vec::new();
    for _ in 0..MAX_PASSES {
        let outcome = pass(fake, name).await;
        fake.materialize_pods(NS, name);
        match outcome.executed {
            Some((action, _)) => executed.push(action),
            None if outcome.phase == Some(ClusterPhase::Ready) => return executed,
            None => {}
        }
    }
    panic!("cluster did not converge, executed {:?}", executed);
}

fn host(name: &str, ordinal: i32) -> String {
    member_host(name, NS, ordinal)
}

fn ready_cluster(fake: &FakeApi, replicas: i32) {
    fake.insert_cluster(create_test_cluster("orders", NS, replicas));
}

mod provisioning_tests {
    use super::*;

    #[tokio::test]
    async fn test_new_cluster_converges_to_ready() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);

        let executed = converge(&fake, "orders").await;
        assert_eq!(executed.first(), Some(&"EnsureSecret"));
        assert!(executed.contains(&"EnsureStatefulSet"));
        assert!(executed.contains(&"EnableWrites"));

        assert_eq!(fake.role_of(NS, "orders-0").as_deref(), Some("primary"));
        assert_eq!(fake.role_of(NS, "orders-1").as_deref(), Some("replica"));
        assert_eq!(fake.role_of(NS, "orders-2").as_deref(), Some("replica"));
        assert_eq!(fake.mysql(NS, "orders-0"), Some(FakeMysql::Writable));
        for replica in ["orders-1", "orders-2"] {
            assert_eq!(
                fake.mysql(NS, replica),
                Some(FakeMysql::replicating(&host("orders", 0)))
            );
        }

        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.primary.as_deref(), Some("orders-0"));
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.current_version.as_deref(), Some("8.0"));
        assert!(status.last_error.is_none());
        assert!(fake.event_reasons().contains(&"PrimaryWritable".to_string()));
    }

    #[tokio::test]
    async fn test_converged_pass_writes_nothing() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        let writes = fake.writes();
        for _ in 0..3 {
            let outcome = pass(&fake, "orders").await;
            assert_eq!(outcome.executed, None);
            assert_eq!(outcome.status_write, Some(StatusWrite::Unchanged));
            assert_eq!(
                outcome.requeue,
                Action::requeue(OperatorConfig::default().requeue_ready)
            );
        }
        assert_eq!(fake.writes(), writes);
    }

    #[tokio::test]
    async fn test_progress_requeues_sooner() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 1);

        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.phase, Some(ClusterPhase::Provisioning));
        assert_eq!(
            outcome.executed,
            Some(("EnsureSecret", ActionOutcome::Applied))
        );
        assert_eq!(
            outcome.requeue,
            Action::requeue(OperatorConfig::default().requeue_progress)
        );
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_left_alone() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 1);
        fake.delete_cluster(NS, "orders");

        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.phase, None);
        assert_eq!(outcome.requeue, Action::await_change());
        assert_eq!(fake.writes(), 0);
    }
}

mod scaling_tests {
    use super::*;

    #[tokio::test]
    async fn test_scale_up_keeps_observed_generation_monotonic() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 1);
        converge(&fake, "orders").await;

        fake.update_cluster(NS, "orders", |spec| spec.replicas = 3);
        let mut last_generation = 0;
        for _ in 0..MAX_PASSES {
            let outcome = pass(&fake, "orders").await;
            fake.materialize_pods(NS, "orders");
            let observed = fake
                .cluster(NS, "orders")
                .and_then(|c| c.status)
                .and_then(|s| s.observed_generation)
                .unwrap_or_default();
            assert!(observed >= last_generation);
            last_generation = observed;
            if outcome.executed.is_none() && outcome.phase == Some(ClusterPhase::Ready) {
                break;
            }
        }

        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.primary.as_deref(), Some("orders-0"));
        assert_eq!(
            fake.mysql(NS, "orders-2"),
            Some(FakeMysql::replicating(&host("orders", 0)))
        );
    }

    #[tokio::test]
    async fn test_scale_down_keeping_primary() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        fake.update_cluster(NS, "orders", |spec| spec.replicas = 1);
        let executed = converge(&fake, "orders").await;
        assert!(!executed.contains(&"PromoteReplica"));

        let sts = fake.statefulset(NS, "orders").unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(1));
        assert!(fake.pod(NS, "orders-1").is_none());
        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert_eq!(status.members.len(), 1);
        assert_eq!(status.primary.as_deref(), Some("orders-0"));
    }

    #[tokio::test]
    async fn test_scale_down_hands_off_primary_first() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        // An earlier failover left the primary on the highest ordinal
        let source = host("orders", 2);
        for ordinal in [0, 1] {
            fake.insert_pod(
                with_role(member_pod("orders", NS, ordinal, true), "replica"),
                FakeMysql::replicating(&source),
            );
        }
        fake.insert_pod(
            with_role(member_pod("orders", NS, 2, true), "primary"),
            FakeMysql::Writable,
        );

        fake.update_cluster(NS, "orders", |spec| spec.replicas = 2);
        let executed = converge(&fake, "orders").await;

        let promoted = executed.iter().position(|a| *a == "PromoteReplica").unwrap();
        let scaled = executed.iter().rposition(|a| *a == "EnsureStatefulSet").unwrap();
        assert!(promoted < scaled, "{:?}", executed);

        assert!(fake.pod(NS, "orders-2").is_none());
        assert_eq!(fake.role_of(NS, "orders-0").as_deref(), Some("primary"));
        assert_eq!(fake.mysql(NS, "orders-0"), Some(FakeMysql::Writable));
        assert_eq!(
            fake.mysql(NS, "orders-1"),
            Some(FakeMysql::replicating(&host("orders", 0)))
        );
        assert!(fake.event_reasons().contains(&"PrimaryPromoted".to_string()));
    }

    #[tokio::test]
    async fn test_spec_change_mid_pass_aborts_destructive_action() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        fake.update_cluster(NS, "orders", |spec| spec.replicas = 1);
        // PDB first, then the scale-down
        let first = pass(&fake, "orders").await;
        assert_eq!(first.executed.map(|(a, _)| a), Some("EnsurePodDisruptionBudget"));

        // Second read inside the pass sees a newer generation
        fake.bump_generation_on_read(NS, "orders", 2);
        let aborted = pass(&fake, "orders").await;
        assert_eq!(aborted.executed, None);
        assert_eq!(aborted.requeue, Action::requeue(Duration::from_secs(1)));
        assert_eq!(
            fake.statefulset(NS, "orders").unwrap().spec.unwrap().replicas,
            Some(3)
        );
    }
}

mod failover_tests {
    use super::*;

    #[tokio::test]
    async fn test_lost_primary_is_replaced() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        fake.set_pod_ready(NS, "orders-0", false);
        let outcome = pass(&fake, "orders").await;
        assert_eq!(
            outcome.executed,
            Some(("PromoteReplica", ActionOutcome::Applied))
        );
        assert_eq!(outcome.phase, Some(ClusterPhase::Degraded));
        assert_eq!(fake.role_of(NS, "orders-1").as_deref(), Some("primary"));
        assert_eq!(fake.role_of(NS, "orders-0").as_deref(), Some("replica"));
        assert_eq!(fake.mysql(NS, "orders-1"), Some(FakeMysql::Writable));
        assert!(fake.event_reasons().contains(&"PrimaryPromoted".to_string()));

        // The old primary comes back and rejoins as a replica
        fake.set_pod_ready(NS, "orders-0", true);
        converge(&fake, "orders").await;

        let new_source = host("orders", 1);
        assert_eq!(
            fake.mysql(NS, "orders-0"),
            Some(FakeMysql::replicating(&new_source))
        );
        assert_eq!(
            fake.mysql(NS, "orders-2"),
            Some(FakeMysql::replicating(&new_source))
        );
        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.primary.as_deref(), Some("orders-1"));
        let roles: Vec<_> = status.members.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Some(MemberRole::Replica),
                Some(MemberRole::Primary),
                Some(MemberRole::Replica)
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_primary_does_not_block_promotion() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        // Exec into orders-0 now fails at the API server, not inside mysqld
        fake.set_pod_ready(NS, "orders-0", false);
        assert!(matches!(
            fake.exec(NS, "orders-0", "mysql", vec!["true".to_string()]).await,
            Err(Error::KubeError(_))
        ));
        let before = fake.statements().len();

        let outcome = pass(&fake, "orders").await;
        assert_eq!(
            outcome.executed,
            Some(("PromoteReplica", ActionOutcome::Applied))
        );
        assert_eq!(fake.mysql(NS, "orders-1"), Some(FakeMysql::Writable));
        assert_eq!(fake.role_of(NS, "orders-1").as_deref(), Some("primary"));
        let during: Vec<_> = fake.statements().split_off(before);
        assert!(during.iter().all(|(pod, _)| pod != "orders-0"), "{:?}", during);
    }

    #[tokio::test]
    async fn test_vanished_previous_primary_does_not_block_promotion() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;
        let cluster = fake.cluster(NS, "orders").unwrap();

        let promote = PlannedAction::PromoteReplica {
            pod: "orders-1".to_string(),
            previous: Some("orders-9".to_string()),
        };
        let outcome = execute(&fake, &cluster, &promote).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Applied);
        assert_eq!(fake.role_of(NS, "orders-1").as_deref(), Some("primary"));
        assert_eq!(fake.mysql(NS, "orders-1"), Some(FakeMysql::Writable));
    }

    #[tokio::test]
    async fn test_single_member_primary_loss_is_degraded() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 1);
        converge(&fake, "orders").await;

        fake.set_pod_ready(NS, "orders-0", false);
        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.executed, None);
        assert_eq!(outcome.phase, Some(ClusterPhase::Degraded));
        assert_eq!(fake.role_of(NS, "orders-0").as_deref(), Some("primary"));
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_spec_fails_until_changed() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 0);

        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.phase, Some(ClusterPhase::Failed));
        assert_eq!(outcome.requeue, Action::await_change());
        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert!(status.last_error.unwrap().contains("below minimum"));
        assert!(fake.statefulset(NS, "orders").is_none());

        let again = pass(&fake, "orders").await;
        assert_eq!(again.phase, Some(ClusterPhase::Failed));
        let invalid = fake
            .event_reasons()
            .into_iter()
            .filter(|r| r == "InvalidSpec")
            .count();
        assert_eq!(invalid, 1);

        fake.update_cluster(NS, "orders", |spec| spec.replicas = 1);
        let fixed = pass(&fake, "orders").await;
        assert_eq!(fixed.phase, Some(ClusterPhase::Provisioning));
        assert!(fixed.executed.is_some());
    }

    #[tokio::test]
    async fn test_invalid_edit_of_ready_cluster_fails_it() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 3);
        converge(&fake, "orders").await;

        fake.update_cluster(NS, "orders", |spec| spec.version = "9.9".to_string());
        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.phase, Some(ClusterPhase::Failed));
        assert_eq!(outcome.executed, None);

        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(status.observed_generation, Some(2));
        // Members keep running untouched
        assert_eq!(status.primary.as_deref(), Some("orders-0"));
        assert_eq!(fake.mysql(NS, "orders-0"), Some(FakeMysql::Writable));
    }

    #[tokio::test]
    async fn test_storage_class_cannot_change() {
        let fake = FakeApi::new();
        fake.insert_cluster(
            MySQLClusterBuilder::new("orders", NS)
                .with_storage("10Gi", Some("standard"))
                .build(),
        );
        converge(&fake, "orders").await;
        let writes = fake.writes();

        fake.update_cluster(NS, "orders", |spec| {
            spec.storage = StorageSpec {
                size: "10Gi".to_string(),
                storage_class: Some("fast".to_string()),
            }
        });
        let outcome = pass(&fake, "orders").await;
        assert_eq!(outcome.phase, Some(ClusterPhase::Failed));
        assert_eq!(outcome.executed, None);
        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert!(status.last_error.unwrap().contains("cannot be changed"));
        // Only the status patch was written
        assert_eq!(fake.writes(), writes + 1);
    }

    #[tokio::test]
    async fn test_rejected_statement_is_surfaced() {
        let fake = FakeApi::new();
        ready_cluster(&fake, 2);
        fake.reject_statements(NS, "orders-1", "Access denied for user 'repl'");

        let mut last = None;
        for _ in 0..MAX_PASSES {
            let outcome = pass(&fake, "orders").await;
            fake.materialize_pods(NS, "orders");
            if let Some((_, ActionOutcome::Failed(_))) = &outcome.executed {
                last = Some(outcome);
                break;
            }
        }

        let outcome = last.expect("statement was never attempted");
        assert_eq!(outcome.executed.unwrap().0, "ConfigureReplication");
        assert_ne!(outcome.phase, Some(ClusterPhase::Ready));
        let status = fake.cluster(NS, "orders").unwrap().status.unwrap();
        assert!(status.last_error.unwrap().contains("Access denied"));
        assert!(fake.event_reasons().contains(&"ActionFailed".to_string()));
    }
}

mod controller_tests {
    use super::*;

    fn context(fake: &Arc<FakeApi>) -> Arc<Context> {
        let api: Arc<dyn OperatorApi> = fake.clone();
        Arc::new(Context::with_api(api, OperatorConfig::default()))
    }

    #[tokio::test]
    async fn test_one_pass_per_cluster_at_a_time() {
        let fake = Arc::new(FakeApi::new());
        ready_cluster(&fake, 1);
        let ctx = context(&fake);
        let cluster = Arc::new(fake.cluster(NS, "orders").unwrap());

        let held = ctx
            .locks
            .try_acquire(&resource_key(CLUSTER_KIND, NS, "orders"))
            .unwrap();
        let handle = tokio::spawn(reconcile(cluster, ctx.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.calls(), 0);

        drop(held);
        handle.await.unwrap().unwrap();
        assert!(fake.calls() > 0);
    }

    #[tokio::test]
    async fn test_reconcile_records_metrics() {
        let fake = Arc::new(FakeApi::new());
        ready_cluster(&fake, 1);
        let health = Arc::new(HealthState::new());
        let api: Arc<dyn OperatorApi> = fake.clone();
        let ctx = Arc::new(
            Context::with_api(api, OperatorConfig::default())
                .with_health_state(Some(health.clone())),
        );
        let cluster = Arc::new(fake.cluster(NS, "orders").unwrap());

        reconcile(cluster, ctx).await.unwrap();
        let encoded = health.metrics.encode();
        assert!(encoded.contains("mysql_operator_reconciliations"));
        assert!(encoded.contains("orders"));
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_transient_errors() {
        let fake = Arc::new(FakeApi::new());
        let ctx = context(&fake);
        let cluster = Arc::new(create_test_cluster("orders", NS, 1));
        let key = resource_key(CLUSTER_KIND, NS, "orders");

        let transient = Error::TransientError("connection reset".to_string());
        let action = error_policy(cluster.clone(), &transient, ctx.clone());
        assert_ne!(action, Action::await_change());
        error_policy(cluster.clone(), &transient, ctx.clone());
        assert_eq!(ctx.retries.attempts(&key), 2);

        let terminal = Error::ValidationError("bad".to_string());
        assert_eq!(
            error_policy(cluster.clone(), &terminal, ctx.clone()),
            Action::await_change()
        );

        // A successful pass clears the failure count
        ready_cluster(&fake, 1);
        reconcile(cluster, ctx.clone()).await.unwrap();
        assert_eq!(ctx.retries.attempts(&key), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_marks_operator_unready() {
        let fake = Arc::new(FakeApi::new());
        let health = Arc::new(HealthState::new());
        health.set_ready(true).await;
        let api: Arc<dyn OperatorApi> = fake.clone();
        let ctx = Arc::new(
            Context::with_api(api, OperatorConfig::default())
                .with_health_state(Some(health.clone())),
        );
        let cluster = Arc::new(create_test_cluster("orders", NS, 1));

        let fatal = Error::FatalError("mysqlclusters.mysql.qwzhou.io is not installed".to_string());
        assert_eq!(error_policy(cluster, &fatal, ctx), Action::await_change());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!health.is_ready().await);
    }
}
