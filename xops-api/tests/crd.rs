use kube::CustomResourceExt as _;
use serde_json::json;
use xops_api::{CronOperation, Operation, WatchOperation};

#[test]
fn crds_are_cluster_scoped_in_the_ops_group() {
    for crd in [Operation::crd(), CronOperation::crd(), WatchOperation::crd()] {
        assert_eq!(crd.spec.group, "ops.crossplane.io");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.versions.len(), 1);
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }
}

#[test]
fn crd_names_follow_the_kinds() {
    assert_eq!(Operation::crd().spec.names.plural, "operations");
    assert_eq!(CronOperation::crd().spec.names.plural, "cronoperations");
    assert_eq!(WatchOperation::crd().spec.names.plural, "watchoperations");
    assert_eq!(
        Operation::crd().spec.names.short_names,
        Some(vec!["op".to_string()])
    );
}

#[test]
fn a_full_manifest_deserializes() {
    let op: Operation = serde_json::from_value(json!({
        "apiVersion": "ops.crossplane.io/v1alpha1",
        "kind": "Operation",
        "metadata": {"name": "one-off"},
        "spec": {
            "pipeline": [{
                "step": "run",
                "functionRef": {"name": "fn-run"}
            }]
        }
    }))
    .unwrap();
    assert_eq!(op.spec.pipeline.len(), 1);
    assert!(op.spec.validate().is_ok());
    assert!(!op.is_terminal());
}
