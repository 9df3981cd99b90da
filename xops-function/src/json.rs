//! Protobuf JSON encoding of the function protocol messages.
//!
//! The inspector ships request/response payloads as JSON so a sidecar can be
//! written in any language without the proto definitions. Default fields are
//! omitted and bytes are base64, per the protobuf JSON mapping.

use base64::Engine as _;
use chrono::DateTime;
use serde_json::{json, Map, Value};

use crate::convert::struct_to_json;
use crate::proto::{
    credentials, resource_selector, Credentials, FunctionResult, Ready, Requirements, Resource,
    ResourceSelector, Resources, RunFunctionRequest, RunFunctionResponse, State,
};

/// Encode a request as protobuf JSON.
pub fn request_to_json(req: &RunFunctionRequest) -> Value {
    let mut doc = Map::new();
    if let Some(meta) = &req.meta {
        doc.insert("meta".into(), json!({"tag": meta.tag}));
    }
    if let Some(observed) = &req.observed {
        doc.insert("observed".into(), state_to_json(observed));
    }
    if let Some(desired) = &req.desired {
        doc.insert("desired".into(), state_to_json(desired));
    }
    if let Some(input) = &req.input {
        doc.insert("input".into(), struct_to_json(input));
    }
    if let Some(context) = &req.context {
        doc.insert("context".into(), struct_to_json(context));
    }
    if !req.credentials.is_empty() {
        let creds: Map<_, _> = req
            .credentials
            .iter()
            .map(|(name, c)| (name.clone(), credentials_to_json(c)))
            .collect();
        doc.insert("credentials".into(), Value::Object(creds));
    }
    if !req.required_resources.is_empty() {
        let required: Map<_, _> = req
            .required_resources
            .iter()
            .map(|(name, r)| (name.clone(), resources_to_json(r)))
            .collect();
        doc.insert("requiredResources".into(), Value::Object(required));
    }
    Value::Object(doc)
}

/// Encode a response as protobuf JSON.
pub fn response_to_json(rsp: &RunFunctionResponse) -> Value {
    let mut doc = Map::new();
    if let Some(meta) = &rsp.meta {
        let mut m = Map::new();
        if !meta.tag.is_empty() {
            m.insert("tag".into(), json!(meta.tag));
        }
        if let Some(ttl) = &meta.ttl {
            m.insert("ttl".into(), duration_to_json(ttl));
        }
        doc.insert("meta".into(), Value::Object(m));
    }
    if let Some(desired) = &rsp.desired {
        doc.insert("desired".into(), state_to_json(desired));
    }
    if !rsp.results.is_empty() {
        doc.insert(
            "results".into(),
            Value::Array(rsp.results.iter().map(result_to_json).collect()),
        );
    }
    if let Some(context) = &rsp.context {
        doc.insert("context".into(), struct_to_json(context));
    }
    if let Some(requirements) = &rsp.requirements {
        doc.insert("requirements".into(), requirements_to_json(requirements));
    }
    Value::Object(doc)
}

fn state_to_json(state: &State) -> Value {
    let mut doc = Map::new();
    if let Some(composite) = &state.composite {
        doc.insert("composite".into(), resource_to_json(composite));
    }
    if !state.resources.is_empty() {
        let resources: Map<_, _> = state
            .resources
            .iter()
            .map(|(name, r)| (name.clone(), resource_to_json(r)))
            .collect();
        doc.insert("resources".into(), Value::Object(resources));
    }
    Value::Object(doc)
}

fn resource_to_json(resource: &Resource) -> Value {
    let mut doc = Map::new();
    if let Some(body) = &resource.resource {
        doc.insert("resource".into(), struct_to_json(body));
    }
    if !resource.connection_details.is_empty() {
        let details: Map<_, _> = resource
            .connection_details
            .iter()
            .map(|(k, v)| (k.clone(), json!(base64(v))))
            .collect();
        doc.insert("connectionDetails".into(), Value::Object(details));
    }
    if resource.ready != Ready::Unspecified as i32 {
        let ready = Ready::try_from(resource.ready).unwrap_or(Ready::Unspecified);
        doc.insert("ready".into(), json!(ready.as_str_name()));
    }
    Value::Object(doc)
}

fn credentials_to_json(creds: &Credentials) -> Value {
    match &creds.source {
        Some(credentials::Source::CredentialData(data)) => {
            let data: Map<_, _> = data
                .data
                .iter()
                .map(|(k, v)| (k.clone(), json!(base64(v))))
                .collect();
            json!({"credentialData": {"data": data}})
        }
        None => json!({}),
    }
}

fn resources_to_json(resources: &Resources) -> Value {
    json!({"items": resources.items.iter().map(resource_to_json).collect::<Vec<_>>()})
}

fn requirements_to_json(requirements: &Requirements) -> Value {
    let resources: Map<_, _> = requirements
        .resources
        .iter()
        .map(|(name, s)| (name.clone(), selector_to_json(s)))
        .collect();
    json!({"resources": resources})
}

fn selector_to_json(selector: &ResourceSelector) -> Value {
    let mut doc = Map::new();
    doc.insert("apiVersion".into(), json!(selector.api_version));
    doc.insert("kind".into(), json!(selector.kind));
    match &selector.r#match {
        Some(resource_selector::Match::MatchName(name)) => {
            doc.insert("matchName".into(), json!(name));
        }
        Some(resource_selector::Match::MatchLabels(labels)) => {
            doc.insert("matchLabels".into(), json!({"labels": labels.labels}));
        }
        None => {}
    }
    if let Some(namespace) = &selector.namespace {
        doc.insert("namespace".into(), json!(namespace));
    }
    Value::Object(doc)
}

fn result_to_json(result: &FunctionResult) -> Value {
    let mut doc = Map::new();
    doc.insert("severity".into(), json!(result.severity().as_str_name()));
    if !result.message.is_empty() {
        doc.insert("message".into(), json!(result.message));
    }
    if !result.reason.is_empty() {
        doc.insert("reason".into(), json!(result.reason));
    }
    Value::Object(doc)
}

fn duration_to_json(d: &prost_types::Duration) -> Value {
    if d.nanos == 0 {
        return json!(format!("{}s", d.seconds));
    }
    let fraction = format!("{:09}", d.nanos.unsigned_abs());
    json!(format!("{}.{}s", d.seconds, fraction.trim_end_matches('0')))
}

/// RFC 3339 rendering of a protobuf timestamp, used for `wallTime` fields.
pub fn timestamp_to_json(t: &prost_types::Timestamp) -> Value {
    match DateTime::from_timestamp(t.seconds, t.nanos.unsigned_abs()) {
        Some(dt) => json!(dt.to_rfc3339()),
        None => Value::Null,
    }
}

fn base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::{CredentialData, RequestMeta};

    #[test]
    fn default_fields_are_omitted() {
        let req = RunFunctionRequest::default();
        assert_eq!(request_to_json(&req), json!({}));
    }

    #[test]
    fn credentials_encode_as_base64() {
        let req = RunFunctionRequest {
            meta: Some(RequestMeta { tag: "abc".into() }),
            credentials: [(
                "db".to_string(),
                Credentials {
                    source: Some(credentials::Source::CredentialData(CredentialData {
                        data: [("password".to_string(), b"hunter2".to_vec())].into(),
                    })),
                },
            )]
            .into(),
            ..Default::default()
        };
        let doc = request_to_json(&req);
        assert_eq!(doc["meta"]["tag"], "abc");
        assert_eq!(
            doc["credentials"]["db"]["credentialData"]["data"]["password"],
            base64(b"hunter2")
        );
    }

    #[test]
    fn durations_render_in_seconds() {
        assert_eq!(
            duration_to_json(&prost_types::Duration {
                seconds: 1800,
                nanos: 0
            }),
            json!("1800s")
        );
        assert_eq!(
            duration_to_json(&prost_types::Duration {
                seconds: 1,
                nanos: 500_000_000
            }),
            json!("1.5s")
        );
    }
}
