//! Command-line and environment configuration.

use std::time::Duration;

use clap::{ArgAction, Parser};

/// Kubernetes controller for SelectiveDeployment resources
#[derive(Parser, Debug, Clone)]
#[command(name = "selective-deployment-controller", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Identity used for leader election and events (defaults to the hostname)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Restrict watches to one namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Number of concurrent queue workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Port of the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Seconds to wait for the initial list of every watched kind
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 300)]
    pub cache_sync_timeout_secs: u64,

    /// Acquire a lease before starting the controller
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    pub leader_election: bool,
}

impl ControllerConfig {
    /// Worker count, at least one.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Leader election identity: the pod name, else the hostname.
    pub fn holder_id(&self) -> String {
        self.pod_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}
