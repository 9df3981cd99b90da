//! References to resources an operation committed to the API server.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identity of a resource applied by an operation pipeline.
///
/// Two refs are the same resource iff all four fields match; the status list
/// is kept sorted and deduplicated under that equality via
/// [`AppliedResourceRef::insert_into`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResourceRef {
    /// The apiVersion of the applied resource.
    pub api_version: String,
    /// The kind of the applied resource.
    pub kind: String,
    /// The namespace of the applied resource, if namespaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The name of the applied resource.
    pub name: String,
}

impl AppliedResourceRef {
    /// Insert this ref into a sorted set of refs, keeping set semantics.
    pub fn insert_into(self, refs: &mut Vec<AppliedResourceRef>) {
        if let Err(at) = refs.binary_search(&self) {
            refs.insert(at, self);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn r(kind: &str, ns: Option<&str>, name: &str) -> AppliedResourceRef {
        AppliedResourceRef {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            namespace: ns.map(String::from),
            name: name.to_string(),
        }
    }

    #[test]
    fn insert_is_idempotent_and_sorted() {
        let mut refs = vec![];
        r("ConfigMap", Some("default"), "b").insert_into(&mut refs);
        r("ConfigMap", Some("default"), "a").insert_into(&mut refs);
        r("ConfigMap", Some("default"), "b").insert_into(&mut refs);
        r("Namespace", None, "a").insert_into(&mut refs);
        assert_eq!(refs.len(), 3);
        let mut sorted = refs.clone();
        sorted.sort();
        assert_eq!(refs, sorted);
    }

    #[test]
    fn namespace_distinguishes_refs() {
        let mut refs = vec![];
        r("ConfigMap", Some("default"), "a").insert_into(&mut refs);
        r("ConfigMap", Some("other"), "a").insert_into(&mut refs);
        r("ConfigMap", None, "a").insert_into(&mut refs);
        assert_eq!(refs.len(), 3);
    }
}
