pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod leader;
pub mod resources;

pub use config::{ConfigError, LogFormat, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, Error, Result, backup_error_policy, error_policy, reconcile,
    reconcile_backup,
};
pub use crd::{MySQLBackup, MySQLCluster, registered_crds};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::api::ListParams;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Error for a custom resource the API server cannot list at startup
pub fn crd_unavailable(plural: &str, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => Error::FatalError(format!(
            "{}.{} is not installed, apply the output of crdgen first",
            plural,
            crd::API_GROUP
        )),
        _ => Error::FatalError(format!("cannot list {}.{}: {}", plural, crd::API_GROUP, e)),
    }
}

/// Confirm both custom resources are served before any controller starts
pub async fn ensure_crds_served(client: Client, namespace: Option<&str>) -> Result<()> {
    let first_page = ListParams::default().limit(1);
    let clusters: Api<MySQLCluster> = scoped_api(client.clone(), namespace);
    clusters
        .list_metadata(&first_page)
        .await
        .map_err(|e| crd_unavailable("mysqlclusters", e))?;
    let backups: Api<MySQLBackup> = scoped_api(client, namespace);
    backups
        .list_metadata(&first_page)
        .await
        .map_err(|e| crd_unavailable("mysqlbackups", e))?;
    Ok(())
}

fn log_controller_error(
    kind: &str,
    e: &kube::runtime::controller::Error<Error, kube::runtime::watcher::Error>,
) {
    // Triggers for just-deleted objects are expected
    let is_not_found = matches!(
        e,
        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
    );
    if is_not_found {
        tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
    } else {
        tracing::error!("{} reconciliation error: {:?}", kind, e);
    }
}

/// Run the MySQLCluster controller until SIGTERM or SIGINT.
///
/// Watches MySQLCluster resources in `config.watch_namespace` (cluster-wide
/// when unset) together with every object they own. In-flight passes finish
/// before the returned future completes.
pub async fn run_cluster_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: OperatorConfig,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for MySQLCluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let concurrency = config.reconcile_concurrency;
    let ctx = Arc::new(Context::new(client.clone(), health_state, config));

    let clusters: Api<MySQLCluster> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(secrets, watcher_config.clone())
        .owns(pdbs, watcher_config)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => tracing::debug!("Reconciled cluster: {}", obj.name),
                Err(e) => log_controller_error("MySQLCluster", &e),
            }
        })
        .await;

    tracing::info!("MySQLCluster controller stopped");
}

/// Run the MySQLBackup controller until SIGTERM or SIGINT.
///
/// Watches MySQLBackup resources, the Jobs they own and the child backups
/// spawned by schedules.
pub async fn run_backup_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: OperatorConfig,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for MySQLBackup resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let concurrency = config.reconcile_concurrency;
    let ctx = Arc::new(Context::new(client.clone(), health_state, config));

    let backups: Api<MySQLBackup> = scoped_api(client.clone(), namespace);
    let jobs: Api<Job> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(backups.clone(), watcher_config.clone())
        .owns(jobs, watcher_config.clone())
        .owns(backups, watcher_config)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_backup, backup_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => tracing::debug!("Reconciled backup: {}", obj.name),
                Err(e) => log_controller_error("MySQLBackup", &e),
            }
        })
        .await;

    tracing::info!("MySQLBackup controller stopped");
}
