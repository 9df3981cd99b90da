//! One attempt at running an operation's pipeline.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use prost_types::Struct;
use serde_json::json;
use tracing::{debug, warn};

use xops_api::{Operation, PipelineStep, PipelineStepStatus, RequiredResourceSelector};
use xops_function::convert::json_to_struct;
use xops_function::proto::{
    self, resource_selector, RunFunctionRequest, Severity, State, StepMeta,
};
use xops_function::{tag_request, FunctionRunner, InspectorEmitter};

use crate::resource::{Error as ResourceError, ResourceApplier, ResourceReader, FIELD_MANAGER};
use xops_api::AppliedResourceRef;

/// Context key under which each request enumerates the requirement names
/// supplied with it.
pub const CONTEXT_KEY_REQUIRED_RESOURCES: &str = "ops.crossplane.io/required-resource-names";

/// Everything an attempt needs besides the operation itself.
pub(crate) struct AttemptDeps<'a> {
    pub functions: &'a dyn FunctionRunner,
    pub reader: &'a dyn ResourceReader,
    pub applier: &'a dyn ResourceApplier,
    pub inspector: Option<&'a InspectorEmitter>,
}

/// What one attempt did.
pub(crate) struct AttemptOutcome {
    /// Per-step records, in pipeline order, as far as the attempt got.
    pub steps: Vec<PipelineStepStatus>,
    /// Resources applied by this attempt.
    pub applied: Vec<AppliedResourceRef>,
    /// Why the attempt failed, if it did.
    pub failure: Option<AttemptFailure>,
}

/// A failed attempt. All attempt failures are retried up to the operation's
/// retry limit; `requirements_changed` ones retry without backoff.
#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub message: String,
    pub requirements_changed: bool,
}

/// Run the pipeline once, then apply whatever it desired.
///
/// Errors are transient API failures; the reconcile loop retries those
/// without consuming the operation's retry budget. Everything the functions
/// themselves do wrong comes back as an [`AttemptFailure`].
pub(crate) async fn run_attempt(
    op: &Operation,
    observed: State,
    deps: &AttemptDeps<'_>,
) -> Result<AttemptOutcome, ResourceError> {
    let op_name = op.metadata.name.clone().unwrap_or_default();
    let persisted = persisted_requirements(op);

    let mut steps = Vec::with_capacity(op.spec.pipeline.len());
    let mut desired: Option<State> = None;
    let mut context: Option<Struct> = None;

    for step in &op.spec.pipeline {
        let selectors = step_selectors(step, persisted.get(&step.step));

        let mut required = BTreeMap::new();
        let mut supplied = BTreeMap::new();
        for selector in &selectors {
            let objects = deps.reader.fetch_required(selector).await?;
            required.insert(
                selector.requirement_name.clone(),
                proto::Resources {
                    items: objects.iter().filter_map(object_to_resource).collect(),
                },
            );
            supplied.insert(selector.requirement_name.clone(), selector_to_proto(selector));
        }

        let mut credentials = BTreeMap::new();
        for credential in &step.credentials {
            let Some(secret_ref) = &credential.secret_ref else {
                continue;
            };
            let data = deps
                .reader
                .read_secret(&secret_ref.namespace, &secret_ref.name)
                .await?;
            credentials.insert(
                credential.name.clone(),
                proto::Credentials {
                    source: Some(proto::credentials::Source::CredentialData(
                        proto::CredentialData { data },
                    )),
                },
            );
        }

        let input = match &step.input {
            Some(input) => match json_to_struct(input) {
                Ok(input) => Some(input),
                Err(e) => {
                    steps.push(step_status(step, None, persisted.get(&step.step).cloned()));
                    return Ok(AttemptOutcome {
                        steps,
                        applied: vec![],
                        failure: Some(AttemptFailure {
                            message: format!("pipeline step {:?} has an invalid input: {e}", step.step),
                            requirements_changed: false,
                        }),
                    });
                }
            },
            None => None,
        };

        let mut req = RunFunctionRequest {
            meta: None,
            observed: Some(observed.clone()),
            desired: desired.clone(),
            input,
            context: Some(with_requirement_names(context.clone(), &supplied)),
            credentials,
            required_resources: required,
        };
        tag_request(&mut req);

        let meta = StepMeta::now(&step.function_ref.name, &step.step, &op_name);
        if let Some(inspector) = deps.inspector {
            if let Err(e) = inspector.emit_request(meta.clone(), &req).await {
                debug!(step = %step.step, error = %e, "failed to emit request to inspector");
            }
        }

        let result = deps.functions.run_function(&step.function_ref.name, req).await;

        if let Some(inspector) = deps.inspector {
            if let Err(e) = inspector.emit_response(meta, result.as_ref()).await {
                debug!(step = %step.step, error = %e, "failed to emit response to inspector");
            }
        }

        let rsp = match result {
            Ok(rsp) => rsp,
            Err(e) => {
                steps.push(step_status(step, None, persisted.get(&step.step).cloned()));
                return Ok(AttemptOutcome {
                    steps,
                    applied: vec![],
                    failure: Some(AttemptFailure {
                        message: format!("pipeline step {:?} failed: {e}", step.step),
                        requirements_changed: false,
                    }),
                });
            }
        };

        desired = rsp.desired;
        context = merge_context(context, rsp.context);

        let returned = rsp
            .requirements
            .map(|r| r.resources)
            .unwrap_or_default();
        let requirements_changed = !returned.is_empty() && returned != supplied;
        let next_requirements = if requirements_changed {
            Some(
                returned
                    .iter()
                    .map(|(name, selector)| selector_from_proto(name, selector))
                    .collect(),
            )
        } else {
            persisted.get(&step.step).cloned()
        };

        let output = results_output(&rsp.results);
        let fatal = rsp
            .results
            .iter()
            .find(|r| r.severity() == Severity::Fatal)
            .map(|r| r.message.clone());
        steps.push(step_status(step, output, next_requirements));

        if let Some(message) = fatal {
            return Ok(AttemptOutcome {
                steps,
                applied: vec![],
                failure: Some(AttemptFailure {
                    message: format!("pipeline step {:?}: {message}", step.step),
                    requirements_changed: false,
                }),
            });
        }
        if requirements_changed {
            return Ok(AttemptOutcome {
                steps,
                applied: vec![],
                failure: Some(AttemptFailure {
                    message: format!(
                        "pipeline step {:?} requested resources it was not supplied; retrying",
                        step.step
                    ),
                    requirements_changed: true,
                }),
            });
        }
    }

    let mut applied = Vec::new();
    if let Some(state) = &desired {
        for (name, resource) in &state.resources {
            let Some(body) = &resource.resource else {
                warn!(resource = %name, "desired resource has no body; skipping");
                continue;
            };
            let manifest = xops_function::convert::struct_to_json(body);
            match deps.applier.apply(&manifest, FIELD_MANAGER).await {
                Ok(applied_ref) => applied_ref.insert_into(&mut applied),
                Err(e) => {
                    return Ok(AttemptOutcome {
                        steps,
                        applied,
                        failure: Some(AttemptFailure {
                            message: format!("failed to apply desired resource {name:?}: {e}"),
                            requirements_changed: false,
                        }),
                    });
                }
            }
        }
    }

    Ok(AttemptOutcome {
        steps,
        applied,
        failure: None,
    })
}

/// Extra requirements functions asked for on earlier attempts, by step.
fn persisted_requirements(op: &Operation) -> BTreeMap<String, Vec<RequiredResourceSelector>> {
    op.status
        .iter()
        .flat_map(|s| s.pipeline.iter().flatten())
        .filter_map(|s| s.requirements.clone().map(|r| (s.step.clone(), r)))
        .collect()
}

/// The selectors to resolve for a step: its spec'd ones plus any a function
/// asked for on an earlier attempt.
fn step_selectors(
    step: &PipelineStep,
    extra: Option<&Vec<RequiredResourceSelector>>,
) -> Vec<RequiredResourceSelector> {
    let mut selectors: Vec<RequiredResourceSelector> = step
        .requirements
        .iter()
        .flat_map(|r| r.required_resources.iter().cloned())
        .collect();
    for extra in extra.into_iter().flatten() {
        if !selectors
            .iter()
            .any(|s| s.requirement_name == extra.requirement_name)
        {
            selectors.push(extra.clone());
        }
    }
    selectors
}

fn step_status(
    step: &PipelineStep,
    output: Option<serde_json::Value>,
    requirements: Option<Vec<RequiredResourceSelector>>,
) -> PipelineStepStatus {
    PipelineStepStatus {
        step: step.step.clone(),
        output,
        requirements,
    }
}

fn results_output(results: &[proto::FunctionResult]) -> Option<serde_json::Value> {
    if results.is_empty() {
        return None;
    }
    let results: Vec<_> = results
        .iter()
        .map(|r| {
            json!({
                "severity": r.severity().as_str_name(),
                "message": r.message,
                "reason": r.reason,
            })
        })
        .collect();
    Some(json!({ "results": results }))
}

fn merge_context(base: Option<Struct>, update: Option<Struct>) -> Option<Struct> {
    match (base, update) {
        (base, None) => base,
        (None, update) => update,
        (Some(mut base), Some(update)) => {
            base.fields.extend(update.fields);
            Some(base)
        }
    }
}

/// The pipeline context plus the reserved key listing what was supplied.
fn with_requirement_names(
    context: Option<Struct>,
    supplied: &BTreeMap<String, proto::ResourceSelector>,
) -> Struct {
    let mut context = context.unwrap_or_default();
    context.fields.insert(
        CONTEXT_KEY_REQUIRED_RESOURCES.to_string(),
        prost_types::Value {
            kind: Some(prost_types::value::Kind::ListValue(
                prost_types::ListValue {
                    values: supplied
                        .keys()
                        .map(|name| prost_types::Value {
                            kind: Some(prost_types::value::Kind::StringValue(name.clone())),
                        })
                        .collect(),
                },
            )),
        },
    );
    context
}

fn object_to_resource(object: &DynamicObject) -> Option<proto::Resource> {
    let value = serde_json::to_value(object).ok()?;
    let body = json_to_struct(&value).ok()?;
    Some(proto::Resource {
        resource: Some(body),
        connection_details: BTreeMap::new(),
        ready: 0,
    })
}

fn selector_to_proto(selector: &RequiredResourceSelector) -> proto::ResourceSelector {
    proto::ResourceSelector {
        api_version: selector.api_version.clone(),
        kind: selector.kind.clone(),
        namespace: selector.namespace.clone(),
        r#match: match (&selector.name, &selector.match_labels) {
            (Some(name), _) => Some(resource_selector::Match::MatchName(name.clone())),
            (None, Some(labels)) => Some(resource_selector::Match::MatchLabels(
                proto::MatchLabels {
                    labels: labels.clone(),
                },
            )),
            (None, None) => None,
        },
    }
}

fn selector_from_proto(name: &str, selector: &proto::ResourceSelector) -> RequiredResourceSelector {
    let (by_name, by_labels) = match &selector.r#match {
        Some(resource_selector::Match::MatchName(name)) => (Some(name.clone()), None),
        Some(resource_selector::Match::MatchLabels(labels)) => {
            (None, Some(labels.labels.clone()))
        }
        None => (None, None),
    };
    RequiredResourceSelector {
        requirement_name: name.to_string(),
        api_version: selector.api_version.clone(),
        kind: selector.kind.clone(),
        name: by_name,
        match_labels: by_labels,
        namespace: selector.namespace.clone(),
    }
}
