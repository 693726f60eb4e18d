//! Taint controller
//!
//! Pure projection of the Available condition onto spec.taints:
//!
//! | Available          | taints                      |
//! |--------------------|-----------------------------|
//! | missing or Unknown | unreachable/NoSelect        |
//! | False              | unavailable/NoSelect        |
//! | True               | neither                     |
//!
//! The patch replaces the taints array and is preconditioned on
//! uid + resourceVersion; timeAdded stamping belongs to the admission
//! mutator, so taints are written here without timestamps.

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use registration_common::conditions::{find_condition, FALSE, TRUE};
use registration_common::crd::{
    add_taint, remove_taint, ManagedCluster, Taint, TaintEffect, CONDITION_AVAILABLE,
    TAINT_UNAVAILABLE, TAINT_UNREACHABLE,
};
use registration_common::patch::preconditioned_spec_patch;
use registration_common::{Error, Result};

use crate::backoff::{ErrorBackoff, RESYNC_INTERVAL};

/// Context shared by taint reconciliations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Per-cluster retry backoff
    pub backoff: ErrorBackoff,
}

fn unreachable_taint() -> Taint {
    Taint {
        key: TAINT_UNREACHABLE.to_string(),
        value: String::new(),
        effect: TaintEffect::NoSelect,
        time_added: None,
    }
}

fn unavailable_taint() -> Taint {
    Taint {
        key: TAINT_UNAVAILABLE.to_string(),
        value: String::new(),
        effect: TaintEffect::NoSelect,
        time_added: None,
    }
}

/// Compute the taint list the cluster should carry. Returns None when the
/// stored taints already satisfy the truth table.
pub fn desired_taints(cluster: &ManagedCluster) -> Option<Vec<Taint>> {
    let mut taints = cluster.spec.taints.clone();
    let available = cluster
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_AVAILABLE));

    let updated = match available.map(|c| c.status.as_str()) {
        None | Some("Unknown") => {
            let removed = remove_taint(&mut taints, &unavailable_taint());
            add_taint(&mut taints, &unreachable_taint()) || removed
        }
        Some(s) if s == FALSE => {
            let removed = remove_taint(&mut taints, &unreachable_taint());
            add_taint(&mut taints, &unavailable_taint()) || removed
        }
        Some(s) if s == TRUE => {
            let removed = remove_taint(&mut taints, &unavailable_taint());
            remove_taint(&mut taints, &unreachable_taint()) || removed
        }
        Some(_) => false,
    };

    updated.then_some(taints)
}

/// Reconcile one ManagedCluster's taints
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let Some(taints) = desired_taints(&cluster) else {
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    };

    // an empty taint list is patched as null so the field is cleared
    let taints_value = if taints.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::to_value(&taints).map_err(|e| Error::serialization(e.to_string()))?
    };

    let api: Api<ManagedCluster> = Api::all(ctx.client.clone());
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(preconditioned_spec_patch(
            &cluster.metadata,
            json!({ "taints": taints_value }),
        )),
    )
    .await
    .map_err(|source| Error::Kube { source })?;

    info!(cluster = %name, taints = ?taints.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(),
        "projected availability onto taints");
    ctx.backoff.reset(&name);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per cluster. A failed
/// uid/resourceVersion precondition lands here too and retries against the
/// newer object.
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "taint reconciliation failed");
    Action::requeue(ctx.backoff.next_delay(&cluster.name_any()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
    use kube::core::ObjectMeta;
    use registration_common::conditions::{new_condition, UNKNOWN};
    use registration_common::crd::{ManagedClusterSpec, ManagedClusterStatus};

    fn cluster_with(available: Option<&str>, taints: Vec<Taint>) -> ManagedCluster {
        let conditions: Vec<Condition> = available
            .map(|status| vec![new_condition(CONDITION_AVAILABLE, status, "r", "m")])
            .unwrap_or_default();
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("cluster1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                taints,
                ..Default::default()
            },
            status: Some(ManagedClusterStatus {
                conditions,
                ..Default::default()
            }),
        }
    }

    fn keys(taints: &[Taint]) -> Vec<&str> {
        taints.iter().map(|t| t.key.as_str()).collect()
    }

    #[test]
    fn missing_condition_gets_unreachable() {
        let taints = desired_taints(&cluster_with(None, vec![])).unwrap();
        assert_eq!(keys(&taints), vec![TAINT_UNREACHABLE]);
    }

    #[test]
    fn unknown_swaps_unavailable_for_unreachable() {
        let taints =
            desired_taints(&cluster_with(Some(UNKNOWN), vec![unavailable_taint()])).unwrap();
        assert_eq!(keys(&taints), vec![TAINT_UNREACHABLE]);
    }

    #[test]
    fn false_swaps_unreachable_for_unavailable() {
        let taints = desired_taints(&cluster_with(Some(FALSE), vec![unreachable_taint()])).unwrap();
        assert_eq!(keys(&taints), vec![TAINT_UNAVAILABLE]);
    }

    #[test]
    fn true_clears_both() {
        let taints = desired_taints(&cluster_with(
            Some(TRUE),
            vec![unreachable_taint(), unavailable_taint()],
        ))
        .unwrap();
        assert!(taints.is_empty());
    }

    #[test]
    fn user_taints_survive_projection() {
        let user = Taint {
            key: "user/maintenance".to_string(),
            value: "true".to_string(),
            effect: TaintEffect::PreferNoSelect,
            time_added: None,
        };
        let taints = desired_taints(&cluster_with(Some(FALSE), vec![user.clone()])).unwrap();
        assert!(taints.iter().any(|t| t.key == user.key));
        assert!(taints.iter().any(|t| t.key == TAINT_UNAVAILABLE));
    }

    #[test]
    fn stable_state_produces_no_patch() {
        // truth table already satisfied: no write (invariant: taints are a
        // pure function of Available)
        assert!(desired_taints(&cluster_with(Some(TRUE), vec![])).is_none());
        assert!(desired_taints(&cluster_with(Some(FALSE), vec![unavailable_taint()])).is_none());
        assert!(desired_taints(&cluster_with(None, vec![unreachable_taint()])).is_none());
    }
}
