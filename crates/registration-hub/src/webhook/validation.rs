//! Validating admission for cluster writes
//!
//! Rejects malformed client-config URLs, gates acceptance flips behind the
//! accept subresource permission, and gates protected label changes behind
//! clusterset join / label permissions.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::error;

use registration_common::crd::ManagedCluster;
use registration_common::helpers::diff_labels;
use registration_common::{CLUSTER_SET_LABEL, REGISTRATION_API_GROUP};

use super::{deny_with_code, WebhookState};
use crate::authorizer::{Authorizer, ReviewAttributes, ReviewUser};

/// Label prefixes whose changes require a permission check
const PROTECTED_LABEL_PREFIXES: &[&str] = &[
    "cluster.open-cluster-management.io/",
    "info.open-cluster-management.io/",
];

/// Handle validating admission reviews
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = validate(&request, state.authorizer.as_ref()).await;
    Json(response.into_review())
}

fn review_user(request: &AdmissionRequest<DynamicObject>) -> ReviewUser {
    ReviewUser {
        username: request.user_info.username.clone().unwrap_or_default(),
        uid: request.user_info.uid.clone(),
        groups: request.user_info.groups.clone().unwrap_or_default(),
        extra: request.user_info.extra.clone().unwrap_or_default(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

async fn validate(
    request: &AdmissionRequest<DynamicObject>,
    authorizer: &dyn Authorizer,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if request.resource.group != "cluster.open-cluster-management.io"
        || request.resource.resource != "managedclusters"
    {
        return response;
    }
    if request.operation != Operation::Create && request.operation != Operation::Update {
        return response;
    }

    let cluster: ManagedCluster = match request.object.as_ref().map(decode) {
        Some(Ok(cluster)) => cluster,
        Some(Err(e)) => return deny_with_code(response, 400, e.to_string()),
        None => return response,
    };

    if let Err(e) = cluster.spec.validate() {
        return deny_with_code(response, 400, e.to_string());
    }

    let old_cluster: Option<ManagedCluster> = match request.old_object.as_ref().map(decode) {
        Some(Ok(old)) => Some(old),
        Some(Err(e)) => return deny_with_code(response, 400, e.to_string()),
        None => None,
    };

    let user = review_user(request);

    let accept_changed = match &old_cluster {
        Some(old) => old.spec.hub_accepts_client != cluster.spec.hub_accepts_client,
        None => cluster.spec.hub_accepts_client,
    };
    if accept_changed {
        match allow_accept_change(authorizer, &user, &cluster.name_any()).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                return deny_with_code(
                    response,
                    403,
                    format!(
                        "user {:?} cannot update the HubAcceptsClient field",
                        user.username
                    ),
                );
            }
        }
    }

    let old_labels = old_cluster
        .as_ref()
        .and_then(|c| c.metadata.labels.clone())
        .unwrap_or_default();
    let new_labels = cluster.metadata.labels.clone().unwrap_or_default();

    if let Err(message) = allow_label_changes(authorizer, &user, &old_labels, &new_labels).await {
        return deny_with_code(response, 403, message);
    }

    response
}

async fn allow_accept_change(
    authorizer: &dyn Authorizer,
    user: &ReviewUser,
    cluster_name: &str,
) -> registration_common::Result<bool> {
    authorizer
        .allowed(
            user,
            &ReviewAttributes {
                group: REGISTRATION_API_GROUP.to_string(),
                resource: "managedclusters".to_string(),
                subresource: "accept".to_string(),
                verb: "update".to_string(),
                name: cluster_name.to_string(),
            },
        )
        .await
}

/// Check every added or removed protected label against the authorizer.
///
/// For the clusterset label the join permission on the named set is checked
/// first; any label falls back to the per-binding label permission
/// (`<key>:<value>`), then the wildcard (`<key>:*`). First allow wins.
async fn allow_label_changes(
    authorizer: &dyn Authorizer,
    user: &ReviewUser,
    old_labels: &BTreeMap<String, String>,
    new_labels: &BTreeMap<String, String>,
) -> Result<(), String> {
    let (deleted, added) = diff_labels(old_labels, new_labels);

    let mut changed: Vec<(String, String)> = vec![];
    for labels in [deleted, added] {
        for (key, value) in labels {
            if PROTECTED_LABEL_PREFIXES.iter().any(|p| key.starts_with(p)) {
                changed.push((key, value));
            }
        }
    }

    for (key, value) in changed {
        if key == CLUSTER_SET_LABEL {
            let allowed = authorizer
                .allowed(
                    user,
                    &ReviewAttributes {
                        group: "cluster.open-cluster-management.io".to_string(),
                        resource: "managedclustersets".to_string(),
                        subresource: "join".to_string(),
                        verb: "create".to_string(),
                        name: value.clone(),
                    },
                )
                .await
                .unwrap_or(false);
            if allowed {
                continue;
            }
        }

        let exact = authorizer
            .allowed(
                user,
                &ReviewAttributes {
                    group: "cluster.open-cluster-management.io".to_string(),
                    resource: "managedclusters".to_string(),
                    subresource: "label".to_string(),
                    verb: "create".to_string(),
                    name: format!("{key}:{value}"),
                },
            )
            .await
            .unwrap_or(false);
        if exact {
            continue;
        }

        let wildcard = authorizer
            .allowed(
                user,
                &ReviewAttributes {
                    group: "cluster.open-cluster-management.io".to_string(),
                    resource: "managedclusters".to_string(),
                    subresource: "label".to_string(),
                    verb: "create".to_string(),
                    name: format!("{key}:*"),
                },
            )
            .await
            .unwrap_or(false);
        if wildcard {
            continue;
        }

        return Err(format!(
            "user {:?} cannot add/remove the label {}:{} to/from ManagedCluster",
            user.username, key, value
        ));
    }

    Ok(())
}
