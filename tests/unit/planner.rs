//! Unit tests for action planning over complete cluster snapshots

use std::collections::BTreeMap;

use mysql_operator::controller::observed::VolumeSnapshot;
use mysql_operator::controller::planner::{Action, assess_health, host_of};
use mysql_operator::controller::{ClusterSnapshot, MemberSnapshot, ReplicationState, plan};
use mysql_operator::crd::{MemberRole, MySQLCluster};
use mysql_operator::resources::common::with_spec_hash;
use mysql_operator::resources::config_map::generate_config_map;
use mysql_operator::resources::pdb::generate_pdb;
use mysql_operator::resources::secret::generate_credentials_secret;
use mysql_operator::resources::service::{ServiceKind, generate_service};
use mysql_operator::resources::statefulset::generate_statefulset;

use crate::common::{MySQLClusterBuilder, create_test_cluster};

fn following(cluster: &MySQLCluster, ordinal: i32) -> ReplicationState {
    ReplicationState::Replicating {
        source_host: format!("{}-{}.{}.db.svc", cluster_name(cluster), ordinal, cluster_name(cluster)),
        io_running: true,
        sql_running: true,
        seconds_behind: Some(0),
        last_error: None,
    }
}

fn cluster_name(cluster: &MySQLCluster) -> String {
    cluster.metadata.name.clone().unwrap()
}

/// Snapshot of a cluster whose objects match `desired` and whose first
/// member is a writable primary followed by every other member
fn converged(desired: &MySQLCluster) -> ClusterSnapshot {
    let name = cluster_name(desired);
    let services: BTreeMap<_, _> = ServiceKind::ALL
        .iter()
        .map(|kind| {
            (
                kind.service_name(&name),
                with_spec_hash(generate_service(desired, *kind)),
            )
        })
        .collect();

    let members = (0..desired.spec.replicas)
        .map(|ordinal| MemberSnapshot {
            name: format!("{}-{}", name, ordinal),
            ordinal,
            scheduled: true,
            ready: true,
            role: Some(if ordinal == 0 {
                MemberRole::Primary
            } else {
                MemberRole::Replica
            }),
            replication: if ordinal == 0 {
                ReplicationState::Writable
            } else {
                following(desired, 0)
            },
        })
        .collect();

    let volumes = (0..desired.spec.replicas)
        .map(|ordinal| VolumeSnapshot {
            name: format!("data-{}-{}", name, ordinal),
            phase: Some("Bound".to_string()),
        })
        .collect();

    ClusterSnapshot {
        statefulset: Some(with_spec_hash(generate_statefulset(desired))),
        services,
        config_map: Some(with_spec_hash(generate_config_map(desired))),
        secret: Some(generate_credentials_secret(desired)),
        pdb: Some(with_spec_hash(generate_pdb(desired))),
        members,
        volumes,
    }
}

fn names(actions: &[Action]) -> Vec<&'static str> {
    actions.iter().map(Action::name).collect()
}

mod steady_state_tests {
    use super::*;

    #[test]
    fn test_converged_cluster_needs_nothing() {
        let cluster = create_test_cluster("orders", "db", 3);
        let snapshot = converged(&cluster);

        assert!(plan(&cluster, &snapshot).is_empty());
        let health = assess_health(&cluster, &snapshot);
        assert!(health.healthy, "{:?}", health.problems);
        assert!(health.replication_healthy);
        assert_eq!(health.ready_members, 3);
        assert_eq!(health.primary.as_deref(), Some("orders-0"));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        snapshot.members[2].replication = ReplicationState::Idle;
        snapshot.members[2].role = None;

        assert_eq!(plan(&cluster, &snapshot), plan(&cluster, &snapshot));
    }

    #[test]
    fn test_single_member_cluster() {
        let cluster = create_test_cluster("orders", "db", 1);
        let snapshot = converged(&cluster);
        assert!(plan(&cluster, &snapshot).is_empty());
        assert!(assess_health(&cluster, &snapshot).healthy);
    }
}

mod drift_tests {
    use super::*;

    #[test]
    fn test_config_change_rolls_config_map_then_statefulset() {
        let before = create_test_cluster("orders", "db", 3);
        let snapshot = converged(&before);
        let after = MySQLClusterBuilder::new("orders", "db")
            .with_replicas(3)
            .with_mysql_config("max_connections", "500")
            .build();

        let actions = plan(&after, &snapshot);
        assert_eq!(names(&actions), vec!["EnsureConfigMap", "EnsureStatefulSet"]);
        assert!(!actions.iter().any(Action::is_destructive));
    }

    #[test]
    fn test_label_change_touches_every_object() {
        let before = create_test_cluster("orders", "db", 2);
        let snapshot = converged(&before);
        let after = MySQLClusterBuilder::new("orders", "db")
            .with_replicas(2)
            .with_label("team", "payments")
            .build();

        let actions = plan(&after, &snapshot);
        let planned = names(&actions);
        assert!(planned.contains(&"EnsureService"));
        assert!(planned.contains(&"EnsurePodDisruptionBudget"));
        assert!(planned.contains(&"EnsureStatefulSet"));
        // Credentials are never regenerated
        assert!(!planned.contains(&"EnsureSecret"));
    }

    #[test]
    fn test_scale_up_is_not_destructive() {
        let before = create_test_cluster("orders", "db", 3);
        let snapshot = converged(&before);
        let after = create_test_cluster("orders", "db", 5);

        let actions = plan(&after, &snapshot);
        // minAvailable follows the member count
        assert_eq!(
            names(&actions),
            vec!["EnsurePodDisruptionBudget", "EnsureStatefulSet"]
        );
        let sts = actions
            .iter()
            .find(|a| a.name() == "EnsureStatefulSet")
            .unwrap();
        assert!(matches!(sts, Action::ApplyStatefulSet { scale_down: false, .. }));
        assert!(!sts.is_destructive());

        let health = assess_health(&after, &snapshot);
        assert!(!health.healthy);
    }

    #[test]
    fn test_scale_down_keeping_primary_is_destructive() {
        let before = create_test_cluster("orders", "db", 3);
        let snapshot = converged(&before);
        let after = create_test_cluster("orders", "db", 1);

        let actions = plan(&after, &snapshot);
        let sts = actions
            .iter()
            .find(|a| a.name() == "EnsureStatefulSet")
            .unwrap();
        assert!(matches!(sts, Action::ApplyStatefulSet { scale_down: true, .. }));
        assert!(sts.is_destructive());
        assert!(!names(&actions).contains(&"PromoteReplica"));
    }
}

mod topology_tests {
    use super::*;

    #[test]
    fn test_lost_primary_is_replaced_first() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        snapshot.members[0].ready = false;
        snapshot.members[0].replication = ReplicationState::Unknown;

        let actions = plan(&cluster, &snapshot);
        assert_eq!(
            actions,
            vec![Action::PromoteReplica {
                pod: "orders-1".to_string(),
                previous: Some("orders-0".to_string()),
            }]
        );
        assert!(actions[0].is_destructive());
    }

    #[test]
    fn test_fenced_old_primary_is_relabelled_and_repointed() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        // orders-1 took over; orders-0 came back read-only with a stale label
        snapshot.members[0].replication = ReplicationState::Idle;
        snapshot.members[1].role = Some(MemberRole::Primary);
        snapshot.members[1].replication = ReplicationState::Writable;
        snapshot.members[2].replication = following(&cluster, 1);

        let new_primary_host = host_of(&cluster, &snapshot.members[1]);
        let actions = plan(&cluster, &snapshot);
        assert_eq!(
            actions,
            vec![
                Action::LabelMember {
                    pod: "orders-0".to_string(),
                    role: MemberRole::Replica,
                },
                Action::ConfigureReplication {
                    pod: "orders-0".to_string(),
                    source_host: new_primary_host,
                },
            ]
        );
    }

    #[test]
    fn test_unknown_replica_state_is_left_alone() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        snapshot.members[2].replication = ReplicationState::Unknown;

        assert!(plan(&cluster, &snapshot).is_empty());
        let health = assess_health(&cluster, &snapshot);
        assert!(!health.healthy);
        assert!(!health.replication_healthy);
    }

    #[test]
    fn test_unready_member_blocks_health_but_not_plan() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        snapshot.members[2].ready = false;

        assert!(plan(&cluster, &snapshot).is_empty());
        let health = assess_health(&cluster, &snapshot);
        assert!(!health.healthy);
        assert!(health.summary().contains("2/3 members ready"), "{}", health.summary());
    }

    #[test]
    fn test_unscheduled_member_reported() {
        let cluster = create_test_cluster("orders", "db", 3);
        let mut snapshot = converged(&cluster);
        snapshot.members[2].scheduled = false;
        snapshot.members[2].ready = false;
        snapshot.members[2].replication = ReplicationState::Unknown;

        let health = assess_health(&cluster, &snapshot);
        assert!(!health.healthy);
        assert!(
            health.summary().contains("members not scheduled: orders-2"),
            "{}",
            health.summary()
        );
    }

    #[test]
    fn test_unbound_volume_reported() {
        let cluster = create_test_cluster("orders", "db", 2);
        let mut snapshot = converged(&cluster);
        snapshot.volumes[1].phase = Some("Pending".to_string());

        let health = assess_health(&cluster, &snapshot);
        assert!(!health.healthy);
        assert!(health.summary().contains("data-orders-1"));
    }
}
