//! Patch builders for lost-update-safe writes
//!
//! Writes that project controller state onto shared objects are merge patches
//! preconditioned on uid + resourceVersion; a failed precondition surfaces as
//! a 409 and the next resync observes the new state.

use kube::core::ObjectMeta;
use serde_json::{json, Value};

/// Build a merge patch that updates `spec` fields, preconditioned on the
/// object's uid and resourceVersion.
pub fn preconditioned_spec_patch(meta: &ObjectMeta, spec: Value) -> Value {
    json!({
        "metadata": {
            "uid": meta.uid,
            "resourceVersion": meta.resource_version,
        },
        "spec": spec,
    })
}

/// Build a merge patch replacing the object's finalizer list.
///
/// An empty list is written explicitly so the field is cleared rather than
/// left untouched by the merge.
pub fn finalizers_patch(finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
        }
    })
}

/// Build a finalizer-list patch preconditioned on uid + resourceVersion,
/// for removals where racing with a concurrent write must fail the patch.
pub fn preconditioned_finalizers_patch(meta: &ObjectMeta, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "uid": meta.uid,
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    })
}

/// Build a merge patch for status conditions
pub fn status_conditions_patch(
    conditions: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition],
) -> Value {
    json!({
        "status": {
            "conditions": conditions,
        }
    })
}

/// Remove one finalizer from a list, returning the new list if it changed
pub fn without_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        finalizers
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect(),
    )
}
