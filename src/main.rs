//! selective-deployment-controller - places workloads on nodes picked by
//! geographic selectors.
//!
//! This is the main entry point that:
//! - Parses configuration from flags and environment
//! - Initializes structured logging
//! - Runs leader election (when enabled)
//! - Starts the controller and the health server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use selective_deployment_controller::ControllerConfig;
use selective_deployment_controller::controller::error::Result as ControllerResult;
use selective_deployment_controller::health::{HealthState, run_health_server};
use selective_deployment_controller::run_controller;

/// Lease configuration
const LEASE_NAME: &str = "selective-deployment-controller-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Upper bound on waiting for workers to finish their current item
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("selective_deployment_controller=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting selective-deployment-controller");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes must answer while waiting for the lease
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    let lease_renewal_handle = if config.leader_election {
        Some(acquire_leadership(&client, &config).await)
    } else {
        warn!("Leader election disabled, do not run more than one replica");
        None
    };

    let token = CancellationToken::new();
    let mut controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        let config = config.clone();
        let token = token.clone();
        tokio::spawn(async move { run_controller(client, &config, Some(health_state), token).await })
    };

    tokio::select! {
        result = &mut controller_handle => {
            controller_exit(result)?;
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        // Lease renewal only returns by panicking
        Err(e) = async {
            match lease_renewal_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            token.cancel();

            match tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                &mut controller_handle,
            )
            .await
            {
                Ok(result) => {
                    controller_exit(result)?;
                    info!("Controller drained");
                }
                Err(_) => warn!("Grace period elapsed before workers finished"),
            }
        }
    }

    info!("Controller stopped");
    Ok(())
}

/// Turn the controller task's result into the process result, so that a
/// failed initial sync exits non-zero.
fn controller_exit(
    result: Result<ControllerResult<()>, JoinError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Controller failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Controller task panicked");
            Err(e.into())
        }
    }
}

fn lease_lock(client: &Client, config: &ControllerConfig) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        &config.pod_namespace,
        LeaseLockParams {
            holder_id: config.holder_id(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until the lease is held, then keep renewing it in the background.
///
/// Losing the lease terminates the process so that Kubernetes restarts it
/// into a fresh election.
#[allow(clippy::exit)]
async fn acquire_leadership(
    client: &Client,
    config: &ControllerConfig,
) -> tokio::task::JoinHandle<()> {
    info!(
        holder_id = %config.holder_id(),
        namespace = %config.pod_namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let lock = lease_lock(client, config);
    info!("Waiting to acquire leadership...");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying..."),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease. Shutting down...");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
