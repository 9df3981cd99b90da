//! Day-two operation pipelines for Kubernetes control planes.
//!
//! `xops` executes user-declared pipelines of pluggable functions against a
//! control plane, on three triggers: ad-hoc ([`Operation`]), cron schedule
//! ([`CronOperation`]), and resource change ([`WatchOperation`]).
//!
//! This facade re-exports the member crates:
//!
//! - [`api`] - the custom resource data model
//! - [`function`] - the function gRPC client, response cache, and pipeline
//!   inspector emitter (feature `function`)
//! - [`runtime`] - the three controllers (feature `runtime`, default)
//!
//! A minimal controller process looks like the `operations-controller` demo
//! binary in this workspace: build the function runner, wrap it in the
//! response cache, hand both to the controllers, and run them side by side.

pub use xops_api as api;

#[cfg(feature = "function")]
pub use xops_function as function;

#[cfg(feature = "runtime")]
pub use xops_runtime as runtime;

pub use xops_api::{CronOperation, Operation, WatchOperation};
