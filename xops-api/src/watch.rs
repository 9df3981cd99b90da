//! The [`WatchOperation`] custom resource: change-driven operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::cron::{OperationTemplate, RunningOperationRef};

/// A WatchOperation creates [`Operation`](crate::Operation)s whenever a
/// watched resource changes.
///
/// Each observed `(uid, resourceVersion)` pair of the watched kind triggers
/// at most one operation; the child's deterministic name is the dedup lock.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "ops.crossplane.io", version = "v1alpha1", kind = "WatchOperation")]
#[kube(status = "WatchOperationStatus", shortname = "watchop")]
#[kube(printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.watch.kind"}"#)]
#[kube(
    printcolumn = r#"{"name":"Watching","type":"integer","jsonPath":".status.watchingResources"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WatchOperationSpec {
    /// Which resources to watch.
    pub watch: WatchedResource,
    /// Stop creating operations without deleting the WatchOperation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Template for the operations this WatchOperation creates.
    pub operation_template: OperationTemplate,
}

/// Selects the resources a [`WatchOperation`] watches.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchedResource {
    /// The apiVersion of the watched resources.
    pub api_version: String,
    /// The kind of the watched resources.
    pub kind: String,
    /// Restrict the watch to one namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Restrict the watch to resources with these labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    /// Only react to resources controlled by this WatchOperation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_controller_ref: Option<bool>,
}

/// Status of a [`WatchOperation`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchOperationStatus {
    /// Standard conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// How many distinct resources the watch currently knows about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watching_resources: Option<i64>,
    /// When an operation was last created by this watch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    /// Child operations that were still running at the last reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_operation_refs: Option<Vec<RunningOperationRef>>,
}

impl WatchOperation {
    /// Whether the watch is administratively paused.
    pub fn suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn watch_spec_deserializes() {
        let wo: WatchOperationSpec = serde_json::from_value(serde_json::json!({
            "watch": {
                "apiVersion": "v1",
                "kind": "Pod",
                "namespace": "default",
                "matchLabels": {"app": "web"}
            },
            "operationTemplate": {
                "spec": {
                    "pipeline": [{
                        "step": "notify",
                        "functionRef": {"name": "fn-notify"}
                    }]
                }
            }
        }))
        .unwrap();
        assert_eq!(wo.watch.kind, "Pod");
        assert_eq!(wo.watch.namespace.as_deref(), Some("default"));
        assert!(wo.operation_template.spec.validate().is_ok());
    }
}
