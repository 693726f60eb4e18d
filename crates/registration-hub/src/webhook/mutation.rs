//! Mutating admission for clusters and clustersets
//!
//! Taint timeAdded is server-owned: new or changed taints get stamped with
//! the admission time, and clients attempting to set or alter the timestamp
//! are rejected. Clusterset selectors are defaulted and forced to the set's
//! own exclusive label.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, error};

use registration_common::crd::{
    ManagedCluster, ManagedClusterSet, SELECTOR_TYPE_EXCLUSIVE_LABEL,
};
use registration_common::CLUSTER_SET_LABEL;

use super::{deny_with_code, WebhookState};

/// Handle mutating admission reviews
pub async fn mutate_handler(
    State(_state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate(&request);
    Json(response.into_review())
}

fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if request.operation != Operation::Create && request.operation != Operation::Update {
        return response;
    }
    if request.resource.group != "cluster.open-cluster-management.io" {
        return response;
    }

    match request.resource.resource.as_str() {
        "managedclusters" => mutate_cluster(request, response),
        "managedclustersets" => mutate_clusterset(request, response),
        _ => response,
    }
}

fn decode<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

fn with_patch_ops(response: AdmissionResponse, ops: Vec<Value>) -> AdmissionResponse {
    if ops.is_empty() {
        return response;
    }
    let patch: json_patch::Patch = match serde_json::from_value(Value::Array(ops)) {
        Ok(patch) => patch,
        Err(e) => return deny_with_code(response, 500, e.to_string()),
    };
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => AdmissionResponse::invalid(e.to_string()),
    }
}

fn mutate_cluster(
    request: &AdmissionRequest<DynamicObject>,
    response: AdmissionResponse,
) -> AdmissionResponse {
    let cluster: ManagedCluster = match request.object.as_ref().map(decode) {
        Some(Ok(cluster)) => cluster,
        Some(Err(e)) => return deny_with_code(response, 400, e.to_string()),
        None => return response,
    };
    let old_cluster: Option<ManagedCluster> = match request.old_object.as_ref().map(decode) {
        Some(Ok(old)) => Some(old),
        Some(Err(e)) => return deny_with_code(response, 500, e.to_string()),
        None => None,
    };

    match taint_time_added_patches(&cluster, old_cluster.as_ref()) {
        Ok(ops) => with_patch_ops(response, ops),
        Err(invalid_keys) => deny_with_code(
            response,
            400,
            format!(
                "It is not allowed to set TimeAdded of Taint \"{}\".",
                invalid_keys.join(",")
            ),
        ),
    }
}

/// Compute the timeAdded patches for a cluster write.
///
/// Err carries the keys of taints whose timeAdded the client tried to set or
/// alter. All stamped taints in one request share a single timestamp.
pub fn taint_time_added_patches(
    cluster: &ManagedCluster,
    old_cluster: Option<&ManagedCluster>,
) -> Result<Vec<Value>, Vec<String>> {
    if cluster.spec.taints.is_empty() {
        return Ok(vec![]);
    }

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut invalid_keys = vec![];
    let mut ops = vec![];

    for (index, taint) in cluster.spec.taints.iter().enumerate() {
        let original = old_cluster.and_then(|old| old.find_taint_by_key(&taint.key));
        match original {
            None => {
                // new taint: the timestamp is stamped here, never by the client
                if taint.time_added.is_some() {
                    invalid_keys.push(taint.key.clone());
                    continue;
                }
                ops.push(time_added_patch(index, &now));
            }
            Some(original) if original.value == taint.value && original.effect == taint.effect => {
                if original.time_added != taint.time_added {
                    invalid_keys.push(taint.key.clone());
                }
            }
            Some(_) => {
                // value/effect changed: this is a new (value, effect) tuple
                if taint.time_added.is_some() {
                    invalid_keys.push(taint.key.clone());
                    continue;
                }
                ops.push(time_added_patch(index, &now));
            }
        }
    }

    if invalid_keys.is_empty() {
        Ok(ops)
    } else {
        Err(invalid_keys)
    }
}

fn time_added_patch(index: usize, now: &str) -> Value {
    json!({
        "op": "replace",
        "path": format!("/spec/taints/{index}/timeAdded"),
        "value": now,
    })
}

fn mutate_clusterset(
    request: &AdmissionRequest<DynamicObject>,
    response: AdmissionResponse,
) -> AdmissionResponse {
    let cluster_set: ManagedClusterSet = match request.object.as_ref().map(decode) {
        Some(Ok(set)) => set,
        Some(Err(e)) => return deny_with_code(response, 400, e.to_string()),
        None => return response,
    };

    match clusterset_selector_patches(&cluster_set) {
        Ok(ops) => {
            debug!(clusterset = %cluster_set.name_any(), patches = ops.len(), "defaulted clusterset selector");
            with_patch_ops(response, ops)
        }
        // user-supplied non-matching key/value is rejected with 500,
        // preserved behavior
        Err(message) => deny_with_code(response, 500, message),
    }
}

/// Compute the selector-defaulting patches for a clusterset write.
pub fn clusterset_selector_patches(cluster_set: &ManagedClusterSet) -> Result<Vec<Value>, String> {
    let name = cluster_set.name_any();
    let selector = &cluster_set.spec.cluster_selector;

    if let Some(label) = &selector.exclusive_label {
        if !label.key.is_empty() && label.key != CLUSTER_SET_LABEL {
            return Err(format!(
                "The spec.clusterSelector.exclusiveLabel.key must be \"{CLUSTER_SET_LABEL}\"."
            ));
        }
        if !label.value.is_empty() && label.value != name {
            return Err(format!(
                "The spec.clusterSelector.exclusiveLabel.value must be \"{name}\"."
            ));
        }
    }

    let mut desired = cluster_set.clone();
    if desired.spec.cluster_selector.selector_type.is_empty() {
        desired.spec.cluster_selector.selector_type = SELECTOR_TYPE_EXCLUSIVE_LABEL.to_string();
    }
    desired.spec.cluster_selector.exclusive_label =
        Some(registration_common::crd::ExclusiveLabel {
            key: CLUSTER_SET_LABEL.to_string(),
            value: name,
        });

    let original = serde_json::to_value(cluster_set).map_err(|e| e.to_string())?;
    let updated = serde_json::to_value(&desired).map_err(|e| e.to_string())?;
    let diff = json_patch::diff(&original, &updated);
    serde_json::to_value(&diff)
        .map_err(|e| e.to_string())
        .map(|value| match value {
            Value::Array(ops) => ops,
            _ => vec![],
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;
    use registration_common::crd::{
        ClusterSelector, ExclusiveLabel, ManagedClusterSetSpec, ManagedClusterSpec, Taint,
        TaintEffect,
    };

    fn cluster_with_taints(taints: Vec<Taint>) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("cluster1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                taints,
                ..Default::default()
            },
            status: None,
        }
    }

    fn taint(key: &str, value: &str, effect: TaintEffect, time_added: Option<Time>) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
            time_added,
        }
    }

    #[test]
    fn new_taints_are_stamped_with_one_timestamp() {
        let cluster = cluster_with_taints(vec![
            taint("a", "b", TaintEffect::NoSelect, None),
            taint("c", "d", TaintEffect::PreferNoSelect, None),
        ]);
        let ops = taint_time_added_patches(&cluster, None).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["op"], "replace");
        assert_eq!(ops[0]["path"], "/spec/taints/0/timeAdded");
        assert_eq!(ops[1]["path"], "/spec/taints/1/timeAdded");
        // both patches carry the same RFC3339 UTC timestamp
        assert_eq!(ops[0]["value"], ops[1]["value"]);
        let stamp = ops[0]["value"].as_str().unwrap();
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn client_set_time_added_on_new_taint_is_rejected() {
        let cluster = cluster_with_taints(vec![taint(
            "a",
            "b",
            TaintEffect::NoSelect,
            Some(Time(Utc::now())),
        )]);
        let err = taint_time_added_patches(&cluster, None).unwrap_err();
        assert_eq!(err, vec!["a".to_string()]);
    }

    #[test]
    fn unchanged_taint_keeps_its_timestamp() {
        let stamped = Some(Time(Utc::now()));
        let old = cluster_with_taints(vec![taint("a", "b", TaintEffect::NoSelect, stamped.clone())]);
        let new = cluster_with_taints(vec![taint("a", "b", TaintEffect::NoSelect, stamped)]);
        // no patch: two admission calls on the same taint list are a no-op
        let ops = taint_time_added_patches(&new, Some(&old)).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn unchanged_taint_with_altered_timestamp_is_rejected() {
        let old = cluster_with_taints(vec![taint(
            "a",
            "b",
            TaintEffect::NoSelect,
            Some(Time(Utc::now() - chrono::Duration::hours(1))),
        )]);
        let new = cluster_with_taints(vec![taint(
            "a",
            "b",
            TaintEffect::NoSelect,
            Some(Time(Utc::now())),
        )]);
        assert!(taint_time_added_patches(&new, Some(&old)).is_err());
    }

    #[test]
    fn changed_effect_requires_unset_timestamp_and_restamps() {
        let old = cluster_with_taints(vec![taint(
            "a",
            "b",
            TaintEffect::NoSelect,
            Some(Time(Utc::now())),
        )]);
        let new = cluster_with_taints(vec![taint("a", "b", TaintEffect::PreferNoSelect, None)]);
        let ops = taint_time_added_patches(&new, Some(&old)).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["path"], "/spec/taints/0/timeAdded");
    }

    #[test]
    fn rejection_message_lists_all_offending_keys() {
        let now = Some(Time(Utc::now()));
        let cluster = cluster_with_taints(vec![
            taint("k1", "v", TaintEffect::NoSelect, now.clone()),
            taint("k2", "v", TaintEffect::NoSelect, now),
        ]);
        let keys = taint_time_added_patches(&cluster, None).unwrap_err();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
    }

    fn clusterset(selector: ClusterSelector) -> ManagedClusterSet {
        ManagedClusterSet {
            metadata: ObjectMeta {
                name: Some("set1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSetSpec {
                cluster_selector: selector,
            },
            status: None,
        }
    }

    #[test]
    fn empty_selector_is_defaulted() {
        let ops = clusterset_selector_patches(&clusterset(ClusterSelector::default())).unwrap();
        assert!(!ops.is_empty());
        let patched = serde_json::to_string(&ops).unwrap();
        assert!(patched.contains("ExclusiveLabel"));
        assert!(patched.contains("cluster.open-cluster-management.io/clusterset"));
        assert!(patched.contains("set1"));
    }

    #[test]
    fn wrong_exclusive_label_key_is_rejected() {
        let selector = ClusterSelector {
            selector_type: String::new(),
            exclusive_label: Some(ExclusiveLabel {
                key: "other.io/set".to_string(),
                value: String::new(),
            }),
        };
        let err = clusterset_selector_patches(&clusterset(selector)).unwrap_err();
        assert!(err.contains("exclusiveLabel.key"));
    }

    #[test]
    fn wrong_exclusive_label_value_is_rejected() {
        let selector = ClusterSelector {
            selector_type: String::new(),
            exclusive_label: Some(ExclusiveLabel {
                key: CLUSTER_SET_LABEL.to_string(),
                value: "other-set".to_string(),
            }),
        };
        let err = clusterset_selector_patches(&clusterset(selector)).unwrap_err();
        assert!(err.contains("\"set1\""));
    }

    #[test]
    fn fully_specified_selector_produces_no_patch() {
        let selector = ClusterSelector {
            selector_type: SELECTOR_TYPE_EXCLUSIVE_LABEL.to_string(),
            exclusive_label: Some(ExclusiveLabel {
                key: CLUSTER_SET_LABEL.to_string(),
                value: "set1".to_string(),
            }),
        };
        let ops = clusterset_selector_patches(&clusterset(selector)).unwrap();
        assert!(ops.is_empty());
    }
}
