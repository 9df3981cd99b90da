//! The CronOperation controller: creates operations on a schedule.
//!
//! Each reconcile computes what came due since the last one, applies the
//! concurrency policy, creates at most one operation, trims history, and
//! requeues itself for the next tick. All the arithmetic lives in
//! [`schedule`] and in the pure [`plan`] function; the reconcile shell just
//! executes the plan against the API server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::{Client, Resource as _, ResourceExt as _};
use thiserror::Error;
use tracing::{debug, info, warn};

use xops_api::{
    set_condition, ConcurrencyPolicy, Condition, CronOperation, CronOperationStatus, Operation,
    RunningOperationRef, LABEL_CRON_OPERATION_NAME,
};

use crate::metrics::ControllerMetrics;
use crate::resource::{self, patch_status, OperationOps};

pub mod schedule;

const CONTROLLER: &str = "cronoperation";

/// Ways reconciling a CronOperation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The object has no name or uid yet.
    #[error("missing object metadata")]
    MissingMetadata,
    /// The schedule is unusable.
    #[error(transparent)]
    Schedule(#[from] schedule::Error),
    /// The API server could not be reached or refused a write.
    #[error("failed to talk to the API server")]
    Resource(#[from] resource::Error),
    /// The status could not be written.
    #[error("failed to update status")]
    UpdateStatus(#[source] kube::Error),
}

/// Everything the CronOperation reconciler needs.
pub struct CronContext {
    /// Client used for status writes and events.
    pub client: Client,
    /// CRUD over child operations.
    pub ops: Arc<dyn OperationOps>,
    /// Shared controller metrics.
    pub metrics: ControllerMetrics,
}

/// What one reconcile intends to do.
#[derive(Debug)]
pub(crate) struct Plan {
    /// The operation to create, if a run came due.
    pub create: Option<Operation>,
    /// Children to delete: Replace victims and history overflow.
    pub delete: Vec<String>,
    /// When to reconcile again; `None` if the schedule has no next tick.
    pub requeue_after: Option<Duration>,
    /// The status to record.
    pub status: CronOperationStatus,
}

/// Decide what to do for `co` at `now`, given its current children.
pub(crate) fn plan(
    co: &CronOperation,
    children: &[Operation],
    now: DateTime<Utc>,
) -> Result<Plan, Error> {
    let name = co.metadata.name.as_deref().ok_or(Error::MissingMetadata)?;
    let schedule = schedule::parse(&co.spec.schedule)?;
    let earliest = co
        .status
        .as_ref()
        .and_then(|s| s.last_schedule_time)
        .or_else(|| co.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or(now);
    let deadline = co
        .spec
        .starting_deadline_seconds
        .filter(|s| *s > 0)
        .map(|s| Duration::from_secs(s as u64));

    // A backlog too deep to scan is skipped wholesale; the schedule picks
    // back up from now.
    let (due, backlog) = match schedule::due_times(&schedule, earliest, now, deadline) {
        Ok(due) => (due, None),
        Err(e @ schedule::Error::TooManyDueTimes) => (schedule::Due::default(), Some(e)),
        Err(e) => return Err(e.into()),
    };
    if due.missed > 0 {
        debug!(cronoperation = name, missed = due.missed, "runs missed their starting deadline");
    }

    let running: Vec<String> = children
        .iter()
        .filter(|c| !c.is_terminal())
        .filter_map(|c| c.metadata.name.clone())
        .collect();

    let mut delete = Vec::new();
    let mut create = None;
    if let Some(scheduled) = due.scheduled {
        match co.concurrency_policy() {
            ConcurrencyPolicy::Forbid if !running.is_empty() => {
                debug!(cronoperation = name, "run due but children still running; skipping");
            }
            policy => {
                if policy == ConcurrencyPolicy::Replace {
                    delete.extend(running.iter().cloned());
                }
                create = Some(child_operation(co, name, scheduled)?);
            }
        }
    }
    delete.extend(history_victims(
        children,
        co.successful_history_limit(),
        co.failed_history_limit(),
    ));

    let mut status = co.status.clone().unwrap_or_default();
    match &backlog {
        Some(e) => {
            status.last_schedule_time = Some(now);
            set_condition(&mut status.conditions, Condition::reconcile_error(e.to_string()));
        }
        None => {
            if create.is_some() {
                status.last_schedule_time = due.scheduled;
            }
            set_condition(&mut status.conditions, Condition::reconcile_success());
        }
    }
    if let Some(last_success) = children
        .iter()
        .filter(|c| c.is_succeeded())
        .filter_map(|c| c.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .max()
    {
        status.last_successful_time = Some(last_success);
    }
    let mut refs: Vec<String> = if create.is_some()
        && co.concurrency_policy() == ConcurrencyPolicy::Replace
    {
        Vec::new()
    } else {
        running
    };
    if let Some(op) = &create {
        refs.extend(op.metadata.name.clone());
    }
    refs.sort();
    status.running_operation_refs = Some(
        refs.into_iter()
            .map(|name| RunningOperationRef { name })
            .collect(),
    );

    Ok(Plan {
        create,
        delete,
        requeue_after: schedule::next_after(&schedule, now).map(|(_, wait)| wait),
        status,
    })
}

/// The child to create for the run scheduled at `scheduled`.
fn child_operation(
    co: &CronOperation,
    name: &str,
    scheduled: DateTime<Utc>,
) -> Result<Operation, Error> {
    let owner = co.controller_owner_ref(&()).ok_or(Error::MissingMetadata)?;
    let template = &co.spec.operation_template;
    let mut labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(LABEL_CRON_OPERATION_NAME.to_string(), name.to_string());
    Ok(Operation {
        metadata: ObjectMeta {
            name: Some(format!("{name}-{}", scheduled.timestamp())),
            labels: Some(labels),
            annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    })
}

/// Terminal children beyond the history limits, oldest first.
fn history_victims(
    children: &[Operation],
    successful_limit: i32,
    failed_limit: i32,
) -> Vec<String> {
    let succeeded: Vec<&Operation> = children.iter().filter(|c| c.is_succeeded()).collect();
    let failed: Vec<&Operation> = children.iter().filter(|c| c.is_failed()).collect();

    let mut victims = Vec::new();
    for (keep, mut terminal) in [(successful_limit, succeeded), (failed_limit, failed)] {
        terminal.sort_by_key(|c| {
            std::cmp::Reverse(c.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        victims.extend(
            terminal
                .into_iter()
                .skip(keep.max(0) as usize)
                .filter_map(|c| c.metadata.name.clone()),
        );
    }
    victims
}

/// Reconcile one CronOperation.
pub async fn reconcile(co: Arc<CronOperation>, ctx: Arc<CronContext>) -> Result<Action, Error> {
    let _timer = ctx.metrics.time_reconcile(CONTROLLER);
    let name = co.metadata.name.clone().ok_or(Error::MissingMetadata)?;

    if co.metadata.deletion_timestamp.is_some() || co.suspended() {
        ctx.metrics.reconciled(CONTROLLER, "skipped");
        return Ok(Action::await_change());
    }

    let children = ctx
        .ops
        .list_operations(LABEL_CRON_OPERATION_NAME, &name)
        .await?;
    let plan = match plan(&co, &children, Utc::now()) {
        Ok(plan) => plan,
        Err(Error::Schedule(e)) => {
            // An unusable schedule cannot self-heal; report and wait for a
            // spec change.
            warn!(cronoperation = %name, error = %e, "unusable schedule");
            let mut status = co.status.clone().unwrap_or_default();
            set_condition(&mut status.conditions, Condition::reconcile_error(e.to_string()));
            let api = Api::<CronOperation>::all(ctx.client.clone());
            patch_status(&api, &name, &status)
                .await
                .map_err(Error::UpdateStatus)?;
            let recorder = Recorder::new(
                ctx.client.clone(),
                Reporter {
                    controller: CONTROLLER.to_string(),
                    instance: None,
                },
                co.object_ref(&()),
            );
            let event = Event {
                type_: EventType::Warning,
                reason: "InvalidSchedule".to_string(),
                note: Some(e.to_string()),
                action: "Schedule".to_string(),
                secondary: None,
            };
            if let Err(e) = recorder.publish(event).await {
                debug!(error = %e, "failed to publish event");
            }
            ctx.metrics.reconciled(CONTROLLER, "invalid_schedule");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    for victim in &plan.delete {
        ctx.ops.delete_operation(victim).await?;
    }
    if let Some(op) = &plan.create {
        ctx.ops.create_operation(op).await?;
        ctx.metrics.operation_created(CONTROLLER);
        info!(cronoperation = %name, operation = %op.name_any(), "created scheduled operation");
    }

    let api = Api::<CronOperation>::all(ctx.client.clone());
    patch_status(&api, &name, &plan.status)
        .await
        .map_err(Error::UpdateStatus)?;
    ctx.metrics.reconciled(CONTROLLER, "ok");

    match plan.requeue_after {
        Some(wait) => Ok(Action::requeue(wait)),
        None => Ok(Action::await_change()),
    }
}

/// Retry API failures after a short fixed delay; the controller's own
/// requeue keeps the schedule honest once reconciles succeed again.
pub fn error_policy(co: Arc<CronOperation>, error: &Error, _ctx: Arc<CronContext>) -> Action {
    warn!(cronoperation = %co.name_any(), error = %error, "reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

/// Run the CronOperation controller until its watch ends.
pub async fn run(ctx: Arc<CronContext>) {
    let api = Api::<CronOperation>::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(cronoperation = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile stream error"),
            }
        })
        .await;
}
