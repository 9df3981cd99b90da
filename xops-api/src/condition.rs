//! Status conditions shared by all xops resources.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `Synced` condition type: whether the controller most recently
/// succeeded at reconciling the resource.
pub const TYPE_SYNCED: &str = "Synced";

/// The `Succeeded` condition type: whether an [`Operation`](crate::Operation)
/// pipeline ran to completion.
pub const TYPE_SUCCEEDED: &str = "Succeeded";

/// Condition statuses follow the Kubernetes convention of a string ternary.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The condition is not yet known to hold or not.
    Unknown,
}

/// A single entry in a resource's `status.conditions`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, unique within the conditions of a resource.
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds.
    pub status: ConditionStatus,
    /// A machine readable, PascalCase word explaining the status.
    pub reason: String,
    /// An optional human readable elaboration of the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last changed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    fn new(type_: &str, status: ConditionStatus, reason: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Attach a human readable message to the condition.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The resource reconciled cleanly.
    pub fn reconcile_success() -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::True, "ReconcileSuccess")
    }

    /// The controller could not reconcile the resource.
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::False, "ReconcileError").with_message(message)
    }

    /// The operation's pipeline is still being attempted.
    pub fn pipeline_running() -> Self {
        Self::new(TYPE_SUCCEEDED, ConditionStatus::Unknown, "PipelineRunning")
    }

    /// The operation's pipeline ran to completion.
    pub fn pipeline_success() -> Self {
        Self::new(TYPE_SUCCEEDED, ConditionStatus::True, "PipelineSuccess")
    }

    /// The operation's pipeline failed and exhausted its retry limit.
    pub fn pipeline_error(message: impl Into<String>) -> Self {
        Self::new(TYPE_SUCCEEDED, ConditionStatus::False, "PipelineError").with_message(message)
    }

    /// The resource's spec failed validation and will not be retried.
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(TYPE_SUCCEEDED, ConditionStatus::False, "ValidationError").with_message(message)
    }
}

/// Upsert `next` into `conditions`, keyed by condition type.
///
/// The previous `lastTransitionTime` is preserved when the status did not
/// actually flip, so transition times reflect status changes rather than
/// reconcile frequency.
pub fn set_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time;
            }
            *existing = next;
        }
        None => conditions.push(next),
    }
}

/// Find a condition by type.
pub fn get_condition<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
