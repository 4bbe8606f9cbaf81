use std::sync::Arc;
use std::time::Duration;

use kube::{Client, ResourceExt};
use tokio::signal;
use tracing::{error, info, warn};

use mysql_operator::health::{HealthState, run_health_server};
use mysql_operator::leader::{LeaseLock, LeaseLockParams};
use mysql_operator::{
    LogFormat, OperatorConfig, ensure_crds_served, registered_crds, run_backup_controller,
    run_cluster_controller,
};

/// Lease configuration
const LEASE_NAME: &str = "mysql-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("mysql_operator=info".parse()?)
        .add_directive("kube=info".parse()?);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn lease_lock(client: Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = OperatorConfig::from_env()?;
    init_tracing(config.log_format)?;

    info!("Starting mysql-operator");
    for crd in registered_crds() {
        info!(crd = %crd.name_any(), "Serving custom resource");
    }

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let holder_id = config.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_namespace = config.pod_namespace.clone();
    let config = OperatorConfig {
        pod_name: Some(holder_id.clone()),
        ..config
    };

    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes must answer while waiting for leadership
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lock = lease_lock(client.clone(), &lease_namespace, &holder_id);
    info!("Waiting to acquire leadership...");
    loop {
        tokio::select! {
            result = lock.try_acquire_or_renew() => match result {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    break;
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
            },
            _ = shutdown_signal() => {
                info!("Received shutdown signal before acquiring leadership");
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_renewal_handle = {
        let lock = lease_lock(client.clone(), &lease_namespace, &holder_id);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership! Shutting down...");
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    if let Err(e) = ensure_crds_served(client.clone(), config.watch_namespace.as_deref()).await {
        error!(error = %e, "Cannot start controllers");
        health_state.set_ready(false).await;
        lease_renewal_handle.abort();
        return Err(Box::new(e) as Box<dyn std::error::Error>);
    }
    health_state.set_ready(true).await;

    // Both controllers stop on SIGTERM/SIGINT after draining in-flight passes
    let mut cluster_handle = tokio::spawn(run_cluster_controller(
        client.clone(),
        Some(health_state.clone()),
        config.clone(),
    ));
    let mut backup_handle = tokio::spawn(run_backup_controller(
        client.clone(),
        Some(health_state.clone()),
        config,
    ));

    tokio::select! {
        result = &mut cluster_handle => {
            if let Err(e) = result {
                error!("Cluster controller task panicked: {}", e);
            }
        }
        result = &mut backup_handle => {
            if let Err(e) = result {
                error!("Backup controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Lease renewal only exits via process::exit() or panic
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;

            let drained = tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                async {
                    let _ = (&mut cluster_handle).await;
                    let _ = (&mut backup_handle).await;
                },
            )
            .await;
            if drained.is_err() {
                warn!(
                    "Controllers did not stop within {}s, exiting anyway",
                    SHUTDOWN_GRACE_PERIOD_SECS
                );
            }
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
