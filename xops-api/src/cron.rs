//! The [`CronOperation`] custom resource: schedule-driven operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::operation::OperationSpec;

/// How many successful child operations are retained by default.
pub const DEFAULT_SUCCESSFUL_HISTORY_LIMIT: i32 = 3;

/// How many failed child operations are retained by default.
pub const DEFAULT_FAILED_HISTORY_LIMIT: i32 = 1;

/// A CronOperation creates [`Operation`](crate::Operation)s on a cron
/// schedule.
///
/// Created operations carry a controller owner reference back to the
/// CronOperation and the [`LABEL_CRON_OPERATION_NAME`](crate::LABEL_CRON_OPERATION_NAME)
/// label, which is how the controller finds its children again.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "ops.crossplane.io", version = "v1alpha1", kind = "CronOperation")]
#[kube(status = "CronOperationStatus", shortname = "cronop")]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(
    printcolumn = r#"{"name":"Last Schedule","type":"date","jsonPath":".status.lastScheduleTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CronOperationSpec {
    /// A standard five field cron expression (minute, hour, day of month,
    /// month, day of week).
    pub schedule: String,
    /// How long after its scheduled time a missed run may still start. Zero
    /// or unset means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,
    /// What to do when a run comes due while a previous one is still
    /// running.
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    /// Stop creating operations without deleting the CronOperation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// How many successful operations to retain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_history_limit: Option<i32>,
    /// How many failed operations to retain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_history_limit: Option<i32>,
    /// Template for the operations this CronOperation creates.
    pub operation_template: OperationTemplate,
}

/// What to do when a scheduled run comes due while earlier runs are still
/// in flight.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Create the new operation regardless.
    #[default]
    Allow,
    /// Skip the new operation while any child is still running.
    Forbid,
    /// Delete running children, then create the new operation.
    Replace,
}

/// Template from which child operations are stamped out.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationTemplate {
    /// Labels and annotations to copy onto each child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    /// The spec each child is created with.
    pub spec: OperationSpec,
}

/// The subset of object metadata a template may set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels to set on each child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations to set on each child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Status of a [`CronOperation`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronOperationStatus {
    /// Standard conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// When an operation was last created for this schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    /// When a child operation last succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
    /// Child operations that were still running at the last reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_operation_refs: Option<Vec<RunningOperationRef>>,
}

/// A reference to a running child operation.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunningOperationRef {
    /// Name of the operation.
    pub name: String,
}

impl CronOperation {
    /// Whether the schedule is administratively paused.
    pub fn suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }

    /// The concurrency policy, defaulted.
    pub fn concurrency_policy(&self) -> ConcurrencyPolicy {
        self.spec.concurrency_policy
    }

    /// How many successful children to retain, defaulted.
    pub fn successful_history_limit(&self) -> i32 {
        self.spec
            .successful_history_limit
            .unwrap_or(DEFAULT_SUCCESSFUL_HISTORY_LIMIT)
    }

    /// How many failed children to retain, defaulted.
    pub fn failed_history_limit(&self) -> i32 {
        self.spec
            .failed_history_limit
            .unwrap_or(DEFAULT_FAILED_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operation::{FunctionRef, OperationMode, PipelineStep};

    #[test]
    fn defaults_apply() {
        let co = CronOperation::new(
            "nightly",
            CronOperationSpec {
                schedule: "0 3 * * *".to_string(),
                starting_deadline_seconds: None,
                concurrency_policy: ConcurrencyPolicy::default(),
                suspend: None,
                successful_history_limit: None,
                failed_history_limit: None,
                operation_template: OperationTemplate {
                    metadata: None,
                    spec: crate::OperationSpec {
                        mode: OperationMode::Pipeline,
                        pipeline: vec![PipelineStep {
                            step: "run".to_string(),
                            function_ref: FunctionRef {
                                name: "fn-run".to_string(),
                            },
                            input: None,
                            credentials: vec![],
                            requirements: None,
                        }],
                        retry_limit: None,
                    },
                },
            },
        );
        assert!(!co.suspended());
        assert_eq!(co.concurrency_policy(), ConcurrencyPolicy::Allow);
        assert_eq!(co.successful_history_limit(), 3);
        assert_eq!(co.failed_history_limit(), 1);
    }

    #[test]
    fn concurrency_policy_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_value(ConcurrencyPolicy::Forbid).unwrap(),
            serde_json::json!("Forbid")
        );
    }
}
