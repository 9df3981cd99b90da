//! Controllers and pipeline runtime for the xops operation resources.
//!
//! Three controllers live here, each in the usual reconciler shape
//! (`reconcile` + `error_policy` + `run`):
//!
//! - [`operation`] - executes an [`Operation`](xops_api::Operation)'s
//!   function pipeline, one attempt per reconcile
//! - [`cron`] - creates operations on a schedule, with concurrency policies
//!   and bounded history
//! - [`watch`] - creates operations when watched resources change, deduped
//!   per `(uid, resourceVersion)` and guarded by a circuit breaker
//!
//! The controllers talk to the API server through the capability traits in
//! [`resource`], so their logic is testable without a cluster; the
//! [`resource::KubeResources`] implementation binds them to a real one.

pub mod cron;
pub mod metrics;
pub mod operation;
pub mod resource;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use metrics::ControllerMetrics;
pub use resource::{
    KubeResources, OperationOps, ResourceApplier, ResourceReader, FIELD_MANAGER,
};
pub use watch::operation_name;
