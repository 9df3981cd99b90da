//! The operation runner: reconciles [`Operation`]s by attempting their
//! pipelines.
//!
//! Each reconcile is one attempt. An attempt that fails consumes one unit of
//! the operation's retry budget; exhausting the budget marks the operation
//! `Succeeded=False`. Terminal operations are never re-executed.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Client, Resource as _, ResourceExt as _};
use thiserror::Error;
use tracing::{debug, info, warn};

use xops_api::{
    set_condition, Condition, Operation, OperationStatus, ANNOTATION_WATCHED_RESOURCE,
};
use xops_function::convert::json_to_struct;
use xops_function::proto::{Resource as ProtoResource, State};
use xops_function::{FunctionRunner, InspectorEmitter};

use crate::metrics::ControllerMetrics;
use crate::resource::{self, patch_status, ResourceApplier, ResourceReader};

mod pipeline;
pub use pipeline::CONTEXT_KEY_REQUIRED_RESOURCES;
use pipeline::{run_attempt, AttemptDeps, AttemptOutcome};

const CONTROLLER: &str = "operation";

/// Ways reconciling an operation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The API server could not be reached or refused a read.
    #[error("failed to talk to the API server")]
    Resource(#[from] resource::Error),
    /// The watched-resource annotation does not hold a JSON object.
    #[error("cannot decode the watched resource annotation: {0}")]
    MalformedTrigger(String),
    /// The operation's status could not be written.
    #[error("failed to update status")]
    UpdateStatus(#[source] kube::Error),
    /// The attempt failed; retried with backoff by the error policy.
    #[error("attempt failed: {0}")]
    AttemptFailed(String),
}

/// Everything the operation reconciler needs.
pub struct OperationContext {
    /// Client used for status writes and events.
    pub client: Client,
    /// Runs functions, usually through the response cache.
    pub functions: Arc<dyn FunctionRunner>,
    /// Reads requirement resources and credential secrets.
    pub reader: Arc<dyn ResourceReader>,
    /// Commits desired resources.
    pub applier: Arc<dyn ResourceApplier>,
    /// Optional sidecar sink for redacted payloads.
    pub inspector: Option<InspectorEmitter>,
    /// Shared controller metrics.
    pub metrics: ControllerMetrics,
}

/// Where an attempt left the operation.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// The pipeline ran to completion.
    Succeeded,
    /// The attempt failed but retries remain.
    Retry {
        /// Requirements-changed failures retry without backoff.
        immediate: bool,
        message: String,
    },
    /// The attempt failed and the retry budget is spent.
    Exhausted,
}

/// Fold an attempt's outcome into the operation's status.
fn next_status(op: &Operation, outcome: &AttemptOutcome) -> (OperationStatus, Disposition) {
    let mut status = op.status.clone().unwrap_or_default();
    status.pipeline = Some(outcome.steps.clone());
    let refs = status.applied_resource_refs.get_or_insert_with(Vec::new);
    for applied in &outcome.applied {
        applied.clone().insert_into(refs);
    }
    set_condition(&mut status.conditions, Condition::reconcile_success());

    let disposition = match &outcome.failure {
        None => {
            set_condition(&mut status.conditions, Condition::pipeline_success());
            Disposition::Succeeded
        }
        Some(failure) => {
            let failures = op.failures() + 1;
            status.failures = Some(failures);
            if failures > op.retry_limit() {
                set_condition(
                    &mut status.conditions,
                    Condition::pipeline_error(failure.message.clone()),
                );
                Disposition::Exhausted
            } else {
                set_condition(&mut status.conditions, Condition::pipeline_running());
                Disposition::Retry {
                    immediate: failure.requirements_changed,
                    message: failure.message.clone(),
                }
            }
        }
    };
    (status, disposition)
}

/// The pipeline's initial observed state: the watched resource that
/// triggered this operation, or empty for ad-hoc and cron operations.
fn observed_state(op: &Operation) -> Result<State, Error> {
    let Some(raw) = op.annotations().get(ANNOTATION_WATCHED_RESOURCE) else {
        return Ok(State::default());
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| Error::MalformedTrigger(e.to_string()))?;
    let body = json_to_struct(&value).map_err(|e| Error::MalformedTrigger(e.to_string()))?;
    Ok(State {
        composite: Some(ProtoResource {
            resource: Some(body),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Reconcile one operation: run one attempt and record where it left us.
pub async fn reconcile(op: Arc<Operation>, ctx: Arc<OperationContext>) -> Result<Action, Error> {
    let _timer = ctx.metrics.time_reconcile(CONTROLLER);
    let name = op.name_any();

    if op.is_terminal() {
        ctx.metrics.reconciled(CONTROLLER, "terminal");
        return Ok(Action::await_change());
    }

    if let Err(e) = op.spec.validate() {
        warn!(operation = %name, error = %e, "invalid operation; will not retry");
        let mut status = op.status.clone().unwrap_or_default();
        set_condition(&mut status.conditions, Condition::validation_error(e.to_string()));
        let api = Api::<Operation>::all(ctx.client.clone());
        patch_status(&api, &name, &status)
            .await
            .map_err(Error::UpdateStatus)?;
        publish_warning(&ctx, &op, "InvalidPipeline", &e.to_string()).await;
        ctx.metrics.reconciled(CONTROLLER, "invalid");
        return Ok(Action::await_change());
    }

    let observed = observed_state(&op)?;
    let deps = AttemptDeps {
        functions: ctx.functions.as_ref(),
        reader: ctx.reader.as_ref(),
        applier: ctx.applier.as_ref(),
        inspector: ctx.inspector.as_ref(),
    };
    let outcome = run_attempt(&op, observed, &deps).await?;
    let (status, disposition) = next_status(&op, &outcome);

    let api = Api::<Operation>::all(ctx.client.clone());
    patch_status(&api, &name, &status)
        .await
        .map_err(Error::UpdateStatus)?;

    match disposition {
        Disposition::Succeeded => {
            info!(operation = %name, "pipeline succeeded");
            ctx.metrics.reconciled(CONTROLLER, "succeeded");
            Ok(Action::await_change())
        }
        Disposition::Retry {
            immediate: true, ..
        } => {
            debug!(operation = %name, "requirements changed; retrying immediately");
            ctx.metrics.reconciled(CONTROLLER, "requirements_changed");
            Ok(Action::requeue(Duration::ZERO))
        }
        Disposition::Retry { message, .. } => {
            ctx.metrics.reconciled(CONTROLLER, "retry");
            Err(Error::AttemptFailed(message))
        }
        Disposition::Exhausted => {
            warn!(operation = %name, "pipeline failed and exhausted its retries");
            publish_warning(&ctx, &op, "PipelineFailed", "retry limit exhausted").await;
            ctx.metrics.reconciled(CONTROLLER, "failed");
            Ok(Action::await_change())
        }
    }
}

/// Requeue failed attempts with exponential backoff, capped at a minute.
pub fn error_policy(op: Arc<Operation>, error: &Error, _ctx: Arc<OperationContext>) -> Action {
    warn!(operation = %op.name_any(), error = %error, "reconcile failed");
    let exponent = op.failures().clamp(0, 6) as u32;
    Action::requeue(Duration::from_secs(1 << exponent))
}

/// Run the operation controller until its watch ends.
pub async fn run(ctx: Arc<OperationContext>) {
    let api = Api::<Operation>::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(operation = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile stream error"),
            }
        })
        .await;
}

async fn publish_warning(ctx: &OperationContext, op: &Operation, reason: &str, note: &str) {
    let recorder = Recorder::new(
        ctx.client.clone(),
        Reporter {
            controller: CONTROLLER.to_string(),
            instance: None,
        },
        op.object_ref(&()),
    );
    let event = Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        debug!(error = %e, "failed to publish event");
    }
}
