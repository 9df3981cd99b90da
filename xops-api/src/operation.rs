//! The [`Operation`] custom resource: one execution of a function pipeline.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::{get_condition, Condition, ConditionStatus, TYPE_SUCCEEDED};
use crate::reference::AppliedResourceRef;

/// How many times a failed [`Operation`] is retried before it is marked
/// failed, unless the spec says otherwise.
pub const DEFAULT_RETRY_LIMIT: i64 = 5;

/// The most pipeline steps an [`Operation`] may have.
pub const MAX_PIPELINE_STEPS: usize = 99;

/// An Operation runs a pipeline of functions once, to completion or until its
/// retry limit is exhausted.
///
/// Operations are created ad-hoc by users, on a schedule by a
/// [`CronOperation`](crate::CronOperation), or in response to resource changes
/// by a [`WatchOperation`](crate::WatchOperation). Once an Operation reaches a
/// terminal state it is never executed again.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "ops.crossplane.io", version = "v1alpha1", kind = "Operation")]
#[kube(status = "OperationStatus", shortname = "op")]
#[kube(
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type=='Succeeded')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    /// Mode of operation; only `Pipeline` is defined.
    #[serde(default)]
    pub mode: OperationMode,
    /// The ordered pipeline of function steps to run.
    pub pipeline: Vec<PipelineStep>,
    /// How many times to retry a failed attempt. Defaults to
    /// [`DEFAULT_RETRY_LIMIT`]. Zero means a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<i64>,
}

/// Supported execution modes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationMode {
    /// Run an ordered pipeline of functions.
    #[default]
    Pipeline,
}

/// One function invocation within a pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// Name of the step, unique within the pipeline.
    pub step: String,
    /// The function this step invokes.
    pub function_ref: FunctionRef,
    /// Optional opaque input passed to the function verbatim. Must be an
    /// object with an apiVersion and kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Credentials to hydrate and pass to the function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<FunctionCredentials>,
    /// Resources the runtime must fetch before invoking the function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<FunctionRequirements>,
}

/// A reference to a named function.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    /// Name of the function.
    pub name: String,
}

/// A credential a pipeline step wants supplied to its function.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCredentials {
    /// Name under which the credential is surfaced to the function.
    pub name: String,
    /// Where the credential data comes from.
    pub source: CredentialsSource,
    /// The secret holding the data. Required when source is `Secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// Sources of credential data.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CredentialsSource {
    /// Attach nothing.
    #[default]
    None,
    /// Read data from a Kubernetes secret.
    Secret,
}

/// A namespaced reference to a Kubernetes secret.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Namespace of the secret.
    pub namespace: String,
    /// Name of the secret.
    pub name: String,
}

/// Resources that must be fetched before a step's function is invoked.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRequirements {
    /// Selectors for the resources to fetch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_resources: Vec<RequiredResourceSelector>,
}

/// Selects resources by name or by labels, never both.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequiredResourceSelector {
    /// Key under which the fetched resources are surfaced to the function.
    pub requirement_name: String,
    /// The apiVersion of the resources to fetch.
    pub api_version: String,
    /// The kind of the resources to fetch.
    pub kind: String,
    /// Select a single resource by name. Mutually exclusive with
    /// `matchLabels`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Select resources by label. Mutually exclusive with `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    /// Restrict the fetch to one namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status of an [`Operation`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Standard conditions; `Synced` and `Succeeded` are set by the runner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Number of failed attempts so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<i64>,
    /// Per-step records from the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineStepStatus>>,
    /// Resources this operation has applied, across all attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_resource_refs: Option<Vec<AppliedResourceRef>>,
}

/// Status of a single pipeline step.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepStatus {
    /// Name of the step.
    pub step: String,
    /// Whatever the step's function returned as results, as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Resources the step's function asked for beyond its spec'd
    /// requirements. Satisfied on the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<RequiredResourceSelector>>,
}

/// Ways an [`Operation`] spec can be invalid.
///
/// Validation failures are terminal; the operation is marked failed without
/// consuming retries.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The pipeline is empty or too long.
    #[error("pipeline must have between 1 and {MAX_PIPELINE_STEPS} steps, got {0}")]
    PipelineLength(usize),
    /// Two steps share a name.
    #[error("duplicate pipeline step name {0:?}")]
    DuplicateStepName(String),
    /// A required resource selector sets both or neither of name/matchLabels.
    #[error("step {step:?} requirement {requirement:?} must set exactly one of name or matchLabels")]
    AmbiguousSelector {
        /// The offending step.
        step: String,
        /// The offending requirement.
        requirement: String,
    },
    /// A secret-sourced credential does not say which secret.
    #[error("step {step:?} credential {credential:?} has source Secret but no secretRef")]
    MissingSecretRef {
        /// The offending step.
        step: String,
        /// The offending credential.
        credential: String,
    },
}

impl RequiredResourceSelector {
    /// Whether the selector picks exactly one of name/matchLabels.
    pub fn is_unambiguous(&self) -> bool {
        self.name.is_some() != self.match_labels.is_some()
    }
}

impl OperationSpec {
    /// Check the spec invariants that cannot be expressed in schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pipeline.is_empty() || self.pipeline.len() > MAX_PIPELINE_STEPS {
            return Err(ValidationError::PipelineLength(self.pipeline.len()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.pipeline {
            if !seen.insert(&step.step) {
                return Err(ValidationError::DuplicateStepName(step.step.clone()));
            }
            for selector in step
                .requirements
                .iter()
                .flat_map(|r| r.required_resources.iter())
            {
                if !selector.is_unambiguous() {
                    return Err(ValidationError::AmbiguousSelector {
                        step: step.step.clone(),
                        requirement: selector.requirement_name.clone(),
                    });
                }
            }
            for credential in &step.credentials {
                if credential.source == CredentialsSource::Secret && credential.secret_ref.is_none()
                {
                    return Err(ValidationError::MissingSecretRef {
                        step: step.step.clone(),
                        credential: credential.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Operation {
    /// The retry limit, defaulted.
    pub fn retry_limit(&self) -> i64 {
        self.spec.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT)
    }

    /// How many attempts have failed so far.
    pub fn failures(&self) -> i64 {
        self.status
            .as_ref()
            .and_then(|s| s.failures)
            .unwrap_or_default()
    }

    fn succeeded_status(&self) -> Option<ConditionStatus> {
        let conditions = &self.status.as_ref()?.conditions;
        Some(get_condition(conditions, TYPE_SUCCEEDED)?.status)
    }

    /// Whether the operation is done, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.succeeded_status(),
            Some(ConditionStatus::True | ConditionStatus::False)
        )
    }

    /// Whether the operation ran to completion.
    pub fn is_succeeded(&self) -> bool {
        self.succeeded_status() == Some(ConditionStatus::True)
    }

    /// Whether the operation failed terminally.
    pub fn is_failed(&self) -> bool {
        self.succeeded_status() == Some(ConditionStatus::False)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::condition::set_condition;

    fn step(name: &str) -> PipelineStep {
        PipelineStep {
            step: name.to_string(),
            function_ref: FunctionRef {
                name: "fn-a".to_string(),
            },
            input: None,
            credentials: vec![],
            requirements: None,
        }
    }

    fn spec(steps: Vec<PipelineStep>) -> OperationSpec {
        OperationSpec {
            mode: OperationMode::Pipeline,
            pipeline: steps,
            retry_limit: None,
        }
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(matches!(
            spec(vec![]).validate(),
            Err(ValidationError::PipelineLength(0))
        ));
    }

    #[test]
    fn oversized_pipeline_is_rejected() {
        let steps = (0..=MAX_PIPELINE_STEPS).map(|i| step(&format!("s{i}"))).collect();
        assert!(matches!(
            spec(steps).validate(),
            Err(ValidationError::PipelineLength(n)) if n == MAX_PIPELINE_STEPS + 1
        ));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let err = spec(vec![step("a"), step("b"), step("a")]).validate().unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateStepName(name) if name == "a"));
    }

    #[test]
    fn selector_must_pick_name_or_labels() {
        let mut s = step("a");
        s.requirements = Some(FunctionRequirements {
            required_resources: vec![RequiredResourceSelector {
                requirement_name: "db".to_string(),
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: Some("cm".to_string()),
                match_labels: Some([("app".to_string(), "db".to_string())].into()),
                namespace: None,
            }],
        });
        assert!(matches!(
            spec(vec![s]).validate(),
            Err(ValidationError::AmbiguousSelector { .. })
        ));
    }

    #[test]
    fn secret_credentials_need_a_ref() {
        let mut s = step("a");
        s.credentials = vec![FunctionCredentials {
            name: "db".to_string(),
            source: CredentialsSource::Secret,
            secret_ref: None,
        }];
        assert!(matches!(
            spec(vec![s]).validate(),
            Err(ValidationError::MissingSecretRef { .. })
        ));

        let mut s = step("a");
        s.credentials = vec![FunctionCredentials {
            name: "db".to_string(),
            source: CredentialsSource::None,
            secret_ref: None,
        }];
        assert!(spec(vec![s]).validate().is_ok());
    }

    #[test]
    fn terminality_follows_the_succeeded_condition() {
        let mut op = Operation::new("op", spec(vec![step("a")]));
        assert!(!op.is_terminal());

        let mut status = OperationStatus::default();
        set_condition(&mut status.conditions, Condition::pipeline_running());
        op.status = Some(status.clone());
        assert!(!op.is_terminal());

        set_condition(&mut status.conditions, Condition::pipeline_success());
        op.status = Some(status.clone());
        assert!(op.is_terminal() && op.is_succeeded() && !op.is_failed());

        set_condition(&mut status.conditions, Condition::pipeline_error("boom"));
        op.status = Some(status);
        assert!(op.is_terminal() && op.is_failed());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let json = serde_json::json!({
            "mode": "Pipeline",
            "pipeline": [{
                "step": "fetch",
                "functionRef": {"name": "fn-fetch"},
                "input": {"apiVersion": "fn.example.org/v1", "kind": "Input", "count": 3},
                "credentials": [{
                    "name": "db",
                    "source": "Secret",
                    "secretRef": {"namespace": "default", "name": "db-creds"}
                }],
                "requirements": {
                    "requiredResources": [{
                        "requirementName": "pods",
                        "apiVersion": "v1",
                        "kind": "Pod",
                        "matchLabels": {"app": "web"},
                        "namespace": "default"
                    }]
                }
            }],
            "retryLimit": 2
        });
        let spec: OperationSpec = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(spec.pipeline[0].step, "fetch");
        assert!(spec.validate().is_ok());
        assert_eq!(serde_json::to_value(&spec).unwrap(), json);
    }
}
