pub mod api;
pub mod backup_reconciler;
pub mod backup_state_machine;
pub mod cluster_reconciler;
pub mod cluster_state_machine;
pub mod context;
pub mod error;
pub mod executor;
pub mod observed;
pub mod planner;
pub mod single_flight;
pub mod status;
pub mod validation;

pub use api::{EventRecord, EventSeverity, KubeOperatorApi, ManagedObject, OperatorApi};
pub use backup_reconciler::{BACKUP_KIND, backup_error_policy, reconcile_backup, run_backup_pass};
pub use backup_state_machine::{BackupEvent, BackupStateMachine};
pub use cluster_reconciler::{CLUSTER_KIND, PassOutcome, error_policy, reconcile, run_pass};
pub use cluster_state_machine::{ClusterEvent, ClusterStateMachine, TransitionContext};
pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorClass, Result, RetryTracker};
pub use executor::ActionOutcome;
pub use observed::{ClusterSnapshot, MemberSnapshot, ReplicationState};
pub use planner::{HealthReport, plan};
pub use single_flight::{KeyedLocks, resource_key};
pub use status::{ConditionBuilder, StatusWrite};
pub use validation::{MAX_REPLICAS, MIN_REPLICAS, validate_backup_spec, validate_cluster_spec};
