//! Controller module for selective-deployment-controller.
//!
//! Contains the watch/cache layer, the work queue, the node and workload
//! monitors that feed it, the worker loop, and the reconciler the workers
//! dispatch to.

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod status;

// Event pipeline
pub mod informer;
pub mod node_monitor;
pub mod queue;
pub mod sd_watch;
pub mod worker;
pub mod workload_monitor;

// Reconciliation
pub mod handler;
pub mod ownership;
pub mod reconciler;
pub mod selection;
pub mod state_machine;
