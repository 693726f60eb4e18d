//! Acceptance controller
//!
//! Watches ManagedClusters and reacts to the hub admin's acceptance decision:
//! accepted clusters get their namespace + RBAC materialized, the HubAccepted
//! condition set, and the cleanup finalizer installed. A cluster denied after
//! having been accepted loses its RBAC (not its namespace) and flips
//! HubAccepted to False.

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use registration_common::conditions::{
    is_condition_true, new_condition, set_condition, FALSE, TRUE,
};
use registration_common::crd::{ManagedCluster, CONDITION_HUB_ACCEPTED};
use registration_common::patch::{finalizers_patch, status_conditions_patch};
use registration_common::{Error, Result, CLUSTER_FINALIZER, CLUSTER_SET_LABEL};

use crate::backoff::{ErrorBackoff, RESYNC_INTERVAL};
use crate::rbac;

/// Cluster set unlabelled clusters are placed into when the
/// DefaultClusterSet gate is on
pub const DEFAULT_CLUSTER_SET: &str = "default";

/// Context shared by acceptance reconciliations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Whether unlabelled clusters join the default cluster set
    pub default_cluster_set: bool,
    /// Per-cluster retry backoff
    pub backoff: ErrorBackoff,
}

/// Reconcile one ManagedCluster's acceptance state
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        // cleanup is the deletion controller's job
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let api: Api<ManagedCluster> = Api::all(ctx.client.clone());

    if ctx.default_cluster_set && !cluster.labels().contains_key(CLUSTER_SET_LABEL) {
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({
                "metadata": { "labels": { (CLUSTER_SET_LABEL): DEFAULT_CLUSTER_SET } }
            })),
        )
        .await
        .map_err(|source| Error::Kube { source })?;
        info!(cluster = %name, "added cluster to the default cluster set");
    }

    let conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    if !cluster.spec.hub_accepts_client {
        // never-accepted clusters wait for the admin; nothing to undo
        if !is_condition_true(&conditions, CONDITION_HUB_ACCEPTED) {
            ctx.backoff.reset(&name);
            return Ok(Action::requeue(RESYNC_INTERVAL));
        }

        info!(cluster = %name, "cluster denied by hub admin, removing materialized RBAC");
        rbac::remove_cluster_resources(&ctx.client, &name).await?;

        write_condition(
            &api,
            &name,
            conditions,
            new_condition(
                CONDITION_HUB_ACCEPTED,
                FALSE,
                "HubClusterAdminDenied",
                "Denied by hub cluster admin",
            ),
        )
        .await?;
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    // accepted: materialize namespace + RBAC
    let accepted_condition = match rbac::apply_cluster_resources(&ctx.client, &name).await {
        Ok(()) => new_condition(
            CONDITION_HUB_ACCEPTED,
            TRUE,
            "HubClusterAdminAccepted",
            "Accepted by hub cluster admin",
        ),
        Err(e) => {
            warn!(cluster = %name, error = %e, "failed to materialize cluster resources");
            new_condition(CONDITION_HUB_ACCEPTED, FALSE, "Error", e.to_string())
        }
    };
    let failed = accepted_condition.status == FALSE;

    ensure_finalizer(&api, &cluster).await?;
    write_condition(&api, &name, conditions, accepted_condition).await?;

    if failed {
        // materialization failed but the condition write succeeded; retry
        // with the same growing delay as a hard error
        return Ok(Action::requeue(ctx.backoff.next_delay(&name)));
    }
    ctx.backoff.reset(&name);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per cluster
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "acceptance reconciliation failed");
    Action::requeue(ctx.backoff.next_delay(&cluster.name_any()))
}

async fn ensure_finalizer(api: &Api<ManagedCluster>, cluster: &ManagedCluster) -> Result<()> {
    let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
        return Ok(());
    }
    finalizers.push(CLUSTER_FINALIZER.to_string());
    api.patch(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(finalizers_patch(&finalizers)),
    )
    .await
    .map_err(|source| Error::Kube { source })?;
    Ok(())
}

async fn write_condition(
    api: &Api<ManagedCluster>,
    name: &str,
    mut conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
    desired: k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition,
) -> Result<()> {
    if !set_condition(&mut conditions, desired) {
        return Ok(());
    }
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(status_conditions_patch(&conditions)),
    )
    .await
    .map_err(|source| Error::Kube { source })?;
    info!(cluster = %name, "updated HubAccepted condition");
    Ok(())
}
