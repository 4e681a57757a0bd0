//! Resource generation module.
//!
//! Turns the workload templates of a SelectiveDeployment into the objects
//! applied to the cluster.
//!
//! ## Workloads
//!
//! | Resource | Pod spec location |
//! |----------|-------------------|
//! | Deployment | `spec.template.spec` |
//! | DaemonSet | `spec.template.spec` |
//! | StatefulSet | `spec.template.spec` |
//! | Job | `spec.template.spec` |
//! | CronJob | `spec.jobTemplate.spec.template.spec` |

pub mod common;
pub mod workloads;

pub use common::{owner_reference, standard_labels};
pub use workloads::{Workload, WorkloadKind, generate_workload};
