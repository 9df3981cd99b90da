//! The WatchOperation controller: creates operations when resources change.
//!
//! Reconciling a WatchOperation only manages a background watch task for the
//! watched kind; the task itself turns observed objects into operations. The
//! deterministic child name derived from `(uid, resourceVersion)` is the
//! dedup lock: however many times an object is observed, at most one
//! operation is created for each version of it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use kube::api::{Api, DynamicObject, ListParams, ObjectMeta};
use kube::discovery::{pinned_kind, Scope};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{watcher, WatchStreamExt as _};
use kube::{Client, Resource as _, ResourceExt};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use xops_api::{
    set_condition, Condition, Operation, RunningOperationRef, WatchOperation,
    WatchOperationStatus, ANNOTATION_WATCHED_RESOURCE, LABEL_WATCH_OPERATION_NAME,
};

use crate::metrics::ControllerMetrics;
use crate::resource::{self, parse_gvk, patch_status, OperationOps};

pub mod breaker;

use breaker::{BreakerConfig, CircuitBreaker, Outcome};

const CONTROLLER: &str = "watchoperation";

/// Ways reconciling a WatchOperation (or handling a watched object) can
/// fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The WatchOperation has no name or uid yet.
    #[error("missing object metadata")]
    MissingMetadata,
    /// A watched object has no uid or resourceVersion.
    #[error("watched object has no uid or resourceVersion")]
    MissingObjectIdentity,
    /// The watched object could not be serialized into the trigger
    /// annotation.
    #[error("cannot encode the watched resource")]
    EncodeWatched(#[source] serde_json::Error),
    /// The API server could not be reached or refused a write.
    #[error("failed to talk to the API server")]
    Resource(#[from] resource::Error),
    /// The status could not be written.
    #[error("failed to update status")]
    UpdateStatus(#[source] kube::Error),
}

/// Everything the WatchOperation controller needs.
pub struct WatchContext {
    /// Client used for the dynamic watches, status writes and discovery.
    pub client: Client,
    /// CRUD over child operations.
    pub ops: Arc<dyn OperationOps>,
    /// Shared controller metrics.
    pub metrics: ControllerMetrics,
    /// Tuning for the per-watch circuit breakers.
    pub breaker: BreakerConfig,
    engine: WatchEngine,
}

impl WatchContext {
    /// A context with an empty watch engine.
    pub fn new(
        client: Client,
        ops: Arc<dyn OperationOps>,
        metrics: ControllerMetrics,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            client,
            ops,
            metrics,
            breaker,
            engine: WatchEngine::default(),
        }
    }
}

/// The deterministic name of the operation triggered by one version of one
/// watched object.
pub fn operation_name(watch_name: &str, uid: &str, resource_version: &str) -> String {
    let digest = hex::encode(Sha256::digest(format!("{uid}-{resource_version}")));
    format!("{watch_name}-{}", &digest[..7])
}

/// Owns one background watch task per WatchOperation, keyed by uid.
#[derive(Default)]
struct WatchEngine {
    tasks: Mutex<HashMap<String, WatchTask>>,
}

struct WatchTask {
    fingerprint: String,
    handle: JoinHandle<()>,
}

impl WatchEngine {
    /// Make sure a live task with this fingerprint exists, respawning on
    /// spec change or task death.
    fn ensure<F>(&self, uid: String, fingerprint: String, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&uid) {
            if task.fingerprint == fingerprint && !task.handle.is_finished() {
                return;
            }
            task.handle.abort();
        }
        tasks.insert(
            uid,
            WatchTask {
                fingerprint,
                handle: spawn(),
            },
        );
    }

    fn stop(&self, uid: &str) {
        if let Some(task) = self.tasks.lock().remove(uid) {
            task.handle.abort();
        }
    }

    /// Abort tasks whose WatchOperation no longer exists.
    fn retain(&self, alive: &HashSet<String>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|uid, task| {
            if alive.contains(uid) {
                true
            } else {
                task.handle.abort();
                false
            }
        });
    }
}

/// Reconcile one WatchOperation: keep its watch task in the right state.
pub async fn reconcile(wo: Arc<WatchOperation>, ctx: Arc<WatchContext>) -> Result<Action, Error> {
    let _timer = ctx.metrics.time_reconcile(CONTROLLER);
    let name = wo.metadata.name.clone().ok_or(Error::MissingMetadata)?;
    let uid = wo.uid().ok_or(Error::MissingMetadata)?;

    if wo.metadata.deletion_timestamp.is_some() || wo.suspended() {
        ctx.engine.stop(&uid);
        ctx.metrics.reconciled(CONTROLLER, "skipped");
        return Ok(Action::await_change());
    }

    let fingerprint = format!("{:?}", wo.spec);
    let task_wo = wo.clone();
    let task_ctx = ctx.clone();
    ctx.engine.ensure(uid, fingerprint, move || {
        tokio::spawn(watch_task(task_wo, task_ctx))
    });

    let children = ctx
        .ops
        .list_operations(LABEL_WATCH_OPERATION_NAME, &name)
        .await?;
    let mut running: Vec<String> = children
        .iter()
        .filter(|c| !c.is_terminal())
        .filter_map(|c| c.metadata.name.clone())
        .collect();
    running.sort();

    let mut status = wo.status.clone().unwrap_or_default();
    set_condition(&mut status.conditions, Condition::reconcile_success());
    status.running_operation_refs = Some(
        running
            .into_iter()
            .map(|name| RunningOperationRef { name })
            .collect(),
    );
    let api = Api::<WatchOperation>::all(ctx.client.clone());
    patch_status(&api, &name, &status)
        .await
        .map_err(Error::UpdateStatus)?;
    ctx.metrics.reconciled(CONTROLLER, "ok");
    Ok(Action::await_change())
}

/// Retry reconcile failures after a short fixed delay.
pub fn error_policy(wo: Arc<WatchOperation>, error: &Error, _ctx: Arc<WatchContext>) -> Action {
    warn!(watchoperation = %wo.name_any(), error = %error, "reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

/// The background task watching one WatchOperation's target kind.
async fn watch_task(wo: Arc<WatchOperation>, ctx: Arc<WatchContext>) {
    let name = wo.name_any();
    let watch = &wo.spec.watch;

    let gvk = match parse_gvk(&watch.api_version, &watch.kind) {
        Ok(gvk) => gvk,
        Err(e) => {
            warn!(watchoperation = %name, error = %e, "unwatchable kind");
            return;
        }
    };
    let (ar, caps) = loop {
        match pinned_kind(&ctx.client, &gvk).await {
            Ok(discovered) => break discovered,
            Err(e) => {
                warn!(watchoperation = %name, error = %e, "failed to discover watched kind; retrying");
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    };
    let api: Api<DynamicObject> = match &watch.namespace {
        Some(ns) if caps.scope == Scope::Namespaced => {
            Api::namespaced_with(ctx.client.clone(), ns, &ar)
        }
        _ => Api::all_with(ctx.client.clone(), &ar),
    };
    let mut config = watcher::Config::default();
    if let Some(labels) = &watch.match_labels {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        config = config.labels(&selector);
    }

    info!(watchoperation = %name, kind = %watch.kind, "watching");
    let breaker = CircuitBreaker::new(ctx.breaker);
    // Live set of watched object uids: rebuilt from each re-list snapshot,
    // trimmed on deletes.
    let mut seen: HashSet<String> = HashSet::new();
    let mut pending: Option<HashSet<String>> = None;
    let mut reported: Option<usize> = None;
    let mut stream = watcher(api, config).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        let object = match event {
            Err(e) => {
                warn!(watchoperation = %name, error = %e, "watch stream error");
                continue;
            }
            Ok(watcher::Event::Init) => {
                pending = Some(HashSet::new());
                continue;
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(live) = pending.take() {
                    seen = live;
                }
                if reported != Some(seen.len()) {
                    reported = Some(seen.len());
                    report_watch_status(&ctx, &name, seen.len(), false).await;
                }
                continue;
            }
            Ok(watcher::Event::Delete(object)) => {
                if let Some(uid) = object.uid() {
                    seen.remove(&uid);
                }
                if reported != Some(seen.len()) {
                    reported = Some(seen.len());
                    report_watch_status(&ctx, &name, seen.len(), false).await;
                }
                continue;
            }
            Ok(watcher::Event::InitApply(object)) => {
                if let (Some(uid), Some(pending)) = (object.uid(), pending.as_mut()) {
                    pending.insert(uid);
                }
                object
            }
            Ok(watcher::Event::Apply(object)) => {
                if let Some(uid) = object.uid() {
                    seen.insert(uid);
                }
                object
            }
            Ok(_) => continue,
        };
        if watch.match_controller_ref.unwrap_or(false) && !controlled_by(&object, wo.uid()) {
            continue;
        }

        let (outcome, transition) = breaker.admit(Instant::now());
        if let Some(transition) = transition {
            ctx.metrics.breaker_transition(&name, transition);
        }
        ctx.metrics.breaker_outcome(&name, outcome);
        if outcome == Outcome::Dropped {
            continue;
        }

        match handle_object(&wo, &object, &ctx).await {
            Ok(created) => {
                if let Some(transition) = breaker.record_success(Instant::now()) {
                    ctx.metrics.breaker_transition(&name, transition);
                }
                if created || reported != Some(seen.len()) {
                    reported = Some(seen.len());
                    report_watch_status(&ctx, &name, seen.len(), created).await;
                }
            }
            Err(e) => {
                warn!(watchoperation = %name, error = %e, "failed to handle watched object");
                if let Some(transition) = breaker.record_failure(Instant::now()) {
                    ctx.metrics.breaker_transition(&name, transition);
                }
            }
        }
    }
    debug!(watchoperation = %name, "watch stream ended");
}

/// Create the operation for one observed object, unless its deterministic
/// name already exists.
async fn handle_object(
    wo: &WatchOperation,
    object: &DynamicObject,
    ctx: &WatchContext,
) -> Result<bool, Error> {
    let operation = operation_for(wo, object)?;
    let name = operation.name_any();
    if ctx.ops.get_operation(&name).await?.is_some() {
        return Ok(false);
    }
    ctx.ops.create_operation(&operation).await?;
    ctx.metrics.operation_created(CONTROLLER);
    info!(
        watchoperation = %wo.name_any(),
        operation = %name,
        "created operation for watched object"
    );
    Ok(true)
}

/// The operation one version of one watched object triggers.
pub(crate) fn operation_for(
    wo: &WatchOperation,
    object: &DynamicObject,
) -> Result<Operation, Error> {
    let wo_name = wo.metadata.name.as_deref().ok_or(Error::MissingMetadata)?;
    let uid = object.uid().ok_or(Error::MissingObjectIdentity)?;
    let resource_version = object
        .resource_version()
        .ok_or(Error::MissingObjectIdentity)?;
    let owner = wo.controller_owner_ref(&()).ok_or(Error::MissingMetadata)?;

    let template = &wo.spec.operation_template;
    let mut labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(LABEL_WATCH_OPERATION_NAME.to_string(), wo_name.to_string());
    let mut annotations: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    annotations.insert(
        ANNOTATION_WATCHED_RESOURCE.to_string(),
        serde_json::to_string(object).map_err(Error::EncodeWatched)?,
    );

    Ok(Operation {
        metadata: ObjectMeta {
            name: Some(operation_name(wo_name, &uid, &resource_version)),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    })
}

fn controlled_by(object: &DynamicObject, uid: Option<String>) -> bool {
    let Some(uid) = uid else { return false };
    object
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

async fn report_watch_status(ctx: &WatchContext, name: &str, watching: usize, created: bool) {
    let status = WatchOperationStatus {
        conditions: vec![],
        watching_resources: Some(watching as i64),
        last_schedule_time: created.then(chrono::Utc::now),
        running_operation_refs: None,
    };
    let api = Api::<WatchOperation>::all(ctx.client.clone());
    if let Err(e) = patch_status(&api, name, &status).await {
        warn!(watchoperation = %name, error = %e, "failed to update watch status");
    }
}

/// Run the WatchOperation controller until its watch ends.
///
/// A side loop prunes watch tasks whose WatchOperation was deleted without
/// a final reconcile.
pub async fn run(ctx: Arc<WatchContext>) {
    let api = Api::<WatchOperation>::all(ctx.client.clone());
    let pruner = {
        let ctx = ctx.clone();
        let api = api.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match api.list(&ListParams::default()).await {
                    Ok(list) => {
                        let alive: HashSet<String> =
                            list.items.iter().filter_map(ResourceExt::uid).collect();
                        ctx.engine.retain(&alive);
                    }
                    Err(e) => warn!(error = %e, "failed to list watch operations for pruning"),
                }
            }
        }
    };
    let controller = Controller::new(api, watcher::Config::default())
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(watchoperation = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile stream error"),
            }
        });
    tokio::select! {
        () = controller => {}
        () = pruner => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use xops_api::{
        FunctionRef, OperationMode, OperationSpec, OperationTemplate, WatchOperationSpec,
        WatchedResource,
    };

    fn watch_operation(name: &str) -> WatchOperation {
        let mut wo = WatchOperation::new(
            name,
            WatchOperationSpec {
                watch: WatchedResource {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    namespace: None,
                    match_labels: None,
                    match_controller_ref: None,
                },
                suspend: None,
                operation_template: OperationTemplate {
                    metadata: None,
                    spec: OperationSpec {
                        mode: OperationMode::Pipeline,
                        pipeline: vec![step()],
                        retry_limit: None,
                    },
                },
            },
        );
        wo.metadata.uid = Some("wo-uid".to_string());
        wo
    }

    fn step() -> xops_api::PipelineStep {
        xops_api::PipelineStep {
            step: "notify".to_string(),
            function_ref: FunctionRef {
                name: "fn-notify".to_string(),
            },
            input: None,
            credentials: vec![],
            requirements: None,
        }
    }

    fn pod(uid: &str, resource_version: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
        let mut pod = DynamicObject::new("p", &ar);
        pod.metadata.uid = Some(uid.to_string());
        pod.metadata.resource_version = Some(resource_version.to_string());
        pod
    }

    #[test]
    fn names_are_deterministic_and_version_scoped() {
        // sha256("test-uid-123") starts with a8c418a.
        assert_eq!(
            operation_name("watchp", "test-uid", "123"),
            "watchp-a8c418a"
        );
        assert_eq!(
            operation_name("watchp", "test-uid", "123"),
            operation_name("watchp", "test-uid", "123"),
        );
        assert_ne!(
            operation_name("watchp", "test-uid", "123"),
            operation_name("watchp", "test-uid", "124"),
        );
    }

    #[test]
    fn observed_objects_become_owned_annotated_operations() {
        let wo = watch_operation("watchp");
        let op = operation_for(&wo, &pod("test-uid", "123")).unwrap();

        assert_eq!(op.metadata.name.as_deref(), Some("watchp-a8c418a"));
        assert_eq!(
            op.metadata.labels.as_ref().unwrap()[LABEL_WATCH_OPERATION_NAME],
            "watchp"
        );
        let owner = &op.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.name, "watchp");
        assert_eq!(owner.controller, Some(true));

        let trigger: serde_json::Value = serde_json::from_str(
            &op.metadata.annotations.as_ref().unwrap()[ANNOTATION_WATCHED_RESOURCE],
        )
        .unwrap();
        assert_eq!(trigger["kind"], "Pod");
        assert_eq!(trigger["metadata"]["uid"], "test-uid");
    }

    #[test]
    fn objects_without_identity_are_rejected() {
        let wo = watch_operation("watchp");
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
        let bare = DynamicObject::new("p", &ar);
        assert!(matches!(
            operation_for(&wo, &bare),
            Err(Error::MissingObjectIdentity)
        ));
    }

    #[test]
    fn controller_ref_matching_checks_uid_and_controller_flag() {
        let mut pod = pod("u", "1");
        assert!(!controlled_by(&pod, Some("wo-uid".to_string())));
        pod.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "ops.crossplane.io/v1alpha1".to_string(),
                kind: "WatchOperation".to_string(),
                name: "watchp".to_string(),
                uid: "wo-uid".to_string(),
                controller: Some(true),
                block_owner_deletion: None,
            },
        ]);
        assert!(controlled_by(&pod, Some("wo-uid".to_string())));
        assert!(!controlled_by(&pod, Some("other".to_string())));
        assert!(!controlled_by(&pod, None));
    }
}
