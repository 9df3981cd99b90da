//! Lossless-enough conversion between JSON values and protobuf structs.
//!
//! Protobuf `Struct` only has one number type (f64), so large integers
//! degrade the way they would in any protobuf JSON round trip.

use std::collections::BTreeMap;

use prost_types::{value::Kind, ListValue, Struct, Value};
use thiserror::Error;

/// Ways a JSON document can fail to become a protobuf struct.
#[derive(Debug, Error)]
pub enum Error {
    /// Struct fields must be objects at the top level.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Convert a JSON object into a protobuf struct.
pub fn json_to_struct(json: &serde_json::Value) -> Result<Struct, Error> {
    match json {
        serde_json::Value::Object(fields) => Ok(Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        }),
        other => Err(Error::NotAnObject(json_type_name(other))),
    }
}

/// Convert a protobuf struct into a JSON object.
pub fn struct_to_json(s: &Struct) -> serde_json::Value {
    serde_json::Value::Object(
        s.fields
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}

/// Convert any JSON value into a protobuf value.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    let kind = match json {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(f64::MAX)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(fields) => Kind::StructValue(Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect::<BTreeMap<_, _>>(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Convert any protobuf value into a JSON value.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number_to_json(*n),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => struct_to_json(s),
    }
}

/// Render integral floats as JSON integers, the way protobuf JSON does.
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        return serde_json::Value::Number((n as i64).into());
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_round_trip() {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "labels": {"app": "web"}},
            "data": {"replicas": 3, "enabled": true, "ratio": 0.5, "note": null},
            "list": [1, "two", {"three": 3}]
        });
        let s = json_to_struct(&doc).unwrap();
        assert_eq!(struct_to_json(&s), doc);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(json_to_struct(&json!([1, 2])).is_err());
        assert!(json_to_struct(&json!("nope")).is_err());
    }

    #[test]
    fn integral_floats_become_integers() {
        let v = Value {
            kind: Some(Kind::NumberValue(42.0)),
        };
        assert_eq!(value_to_json(&v), json!(42));
    }
}
