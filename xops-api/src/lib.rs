//! Core data model for operation pipelines.
//!
//! This crate defines the three custom resources the runtime reconciles:
//!
//! - [`Operation`] - a single execution of a function pipeline
//! - [`CronOperation`] - creates [`Operation`]s on a cron schedule
//! - [`WatchOperation`] - creates [`Operation`]s when watched resources change
//!
//! plus the shared pieces of their schemas: [`Condition`]s, applied resource
//! references, and pipeline step definitions. Everything here is plain data;
//! the controllers live in `xops-runtime`.

mod condition;
mod cron;
mod operation;
mod reference;
mod watch;

pub use condition::{
    get_condition, set_condition, Condition, ConditionStatus, TYPE_SUCCEEDED, TYPE_SYNCED,
};
pub use cron::{
    ConcurrencyPolicy, CronOperation, CronOperationSpec, CronOperationStatus, OperationTemplate,
    RunningOperationRef, TemplateMetadata, DEFAULT_FAILED_HISTORY_LIMIT,
    DEFAULT_SUCCESSFUL_HISTORY_LIMIT,
};
pub use operation::{
    CredentialsSource, FunctionCredentials, FunctionRef, FunctionRequirements, Operation,
    OperationMode, OperationSpec, OperationStatus, PipelineStep, PipelineStepStatus,
    RequiredResourceSelector, SecretReference, ValidationError, DEFAULT_RETRY_LIMIT,
    MAX_PIPELINE_STEPS,
};
pub use reference::AppliedResourceRef;
pub use watch::{WatchOperation, WatchOperationSpec, WatchOperationStatus, WatchedResource};

/// API group all xops resources belong to.
pub const API_GROUP: &str = "ops.crossplane.io";

/// API version all xops resources are currently served at.
pub const API_VERSION: &str = "v1alpha1";

/// Label a [`CronOperation`] stamps onto every [`Operation`] it creates.
pub const LABEL_CRON_OPERATION_NAME: &str = "cron-operation-name";

/// Label a [`WatchOperation`] stamps onto every [`Operation`] it creates.
pub const LABEL_WATCH_OPERATION_NAME: &str = "watch-operation-name";

/// Annotation under which a [`WatchOperation`] records the watched resource
/// that triggered an [`Operation`], as a JSON document.
///
/// The operation runner decodes this into the initial observed state of the
/// pipeline so functions can see what they were triggered by.
pub const ANNOTATION_WATCHED_RESOURCE: &str = "ops.crossplane.io/watched-resource";
