//! Addon feature discovery
//!
//! Projects each addon's Available condition onto the owning cluster as a
//! `feature.open-cluster-management.io/addon-<name>` label so external
//! schedulers can select clusters by addon health. Labels for removed addons
//! are deleted.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use registration_common::conditions::{find_condition, FALSE, TRUE};
use registration_common::crd::{
    ManagedCluster, ManagedClusterAddOn, ADDON_CONDITION_AVAILABLE, ADDON_STATUS_AVAILABLE,
    ADDON_STATUS_UNHEALTHY, ADDON_STATUS_UNREACHABLE,
};
use registration_common::{Error, Result, ADDON_FEATURE_LABEL_PREFIX};

use crate::backoff::{ErrorBackoff, RESYNC_INTERVAL};

/// Context shared by discovery reconciliations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Per-cluster retry backoff
    pub backoff: ErrorBackoff,
}

fn addon_health_value(addon: &ManagedClusterAddOn) -> &'static str {
    let condition = addon
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, ADDON_CONDITION_AVAILABLE));
    match condition.map(|c| c.status.as_str()) {
        Some(s) if s == TRUE => ADDON_STATUS_AVAILABLE,
        Some(s) if s == FALSE => ADDON_STATUS_UNHEALTHY,
        _ => ADDON_STATUS_UNREACHABLE,
    }
}

/// Compute the label mutations needed on a cluster: Some(value) to set,
/// None to delete. Empty map means the labels are already correct.
pub fn desired_label_patch(
    cluster_labels: &BTreeMap<String, String>,
    addons: &[ManagedClusterAddOn],
) -> BTreeMap<String, Option<String>> {
    let mut desired: BTreeMap<String, String> = BTreeMap::new();
    for addon in addons {
        if addon.metadata.deletion_timestamp.is_some() {
            continue;
        }
        desired.insert(
            format!("{ADDON_FEATURE_LABEL_PREFIX}{}", addon.name_any()),
            addon_health_value(addon).to_string(),
        );
    }

    let mut patch: BTreeMap<String, Option<String>> = BTreeMap::new();
    for (key, value) in &desired {
        if cluster_labels.get(key) != Some(value) {
            patch.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in cluster_labels.keys() {
        if key.starts_with(ADDON_FEATURE_LABEL_PREFIX) && !desired.contains_key(key) {
            patch.insert(key.clone(), None);
        }
    }
    patch
}

/// Reconcile one ManagedCluster's addon feature labels
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let addons: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), &name);
    let addon_list = addons
        .list(&ListParams::default())
        .await
        .map_err(|source| Error::Kube { source })?;

    let labels = cluster.labels().clone();
    let patch = desired_label_patch(&labels, &addon_list.items);
    if patch.is_empty() {
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let api: Api<ManagedCluster> = Api::all(ctx.client.clone());
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "labels": patch } })),
    )
    .await
    .map_err(|source| Error::Kube { source })?;

    info!(cluster = %name, "updated addon feature labels");
    ctx.backoff.reset(&name);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per cluster
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "addon discovery failed");
    Action::requeue(ctx.backoff.next_delay(&cluster.name_any()))
}
