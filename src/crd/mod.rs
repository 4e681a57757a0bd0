//! Custom Resource Definitions (CRDs) for selective-deployment-controller.
//!
//! - `SelectiveDeployment`: place workloads on nodes picked by geo selectors

mod selective_deployment;

pub use selective_deployment::*;
