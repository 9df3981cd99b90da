//! Talking to operation functions.
//!
//! A function is a long-running gRPC server implementing `RunFunction`; this
//! crate owns everything between the operation runner and that wire:
//!
//! - [`runner`] - the [`FunctionRunner`](runner::FunctionRunner) trait, its
//!   gRPC implementation, and request tag computation
//! - [`cache`] - a content-addressed on-disk response cache that wraps any
//!   runner
//! - [`inspector`] - a best-effort sidecar sink for redacted request and
//!   response payloads
//! - [`proto`] - the wire types themselves
//!
//! The decorator layering is always `cache(grpc runner)`; the inspector sits
//! beside the runner rather than in front of it, because emits must never
//! fail a call.

pub mod cache;
pub mod convert;
pub mod inspector;
pub mod json;
pub mod metrics;
pub mod proto;
pub mod runner;

pub use cache::{FileBackedRunner, GcStats};
pub use inspector::{InspectorEmitter, DEFAULT_EMIT_TIMEOUT, REDACTED};
pub use metrics::CacheMetrics;
pub use runner::{
    request_tag, tag_request, FunctionLocator, FunctionRunner, GrpcFunctionRunner,
    StaticFunctionLocator,
};
