//! Deletion controller
//!
//! Once a ManagedCluster is tombstoned, dependents are drained in a fixed
//! order before the cleanup finalizer is released: caller-declared critical
//! resources first (monitored only, never deleted here), then addons, then
//! manifestworks without the delete-by-other label, then the cluster
//! namespace, then the materialized RBAC. Any phase reporting remaining items
//! writes ContentDeleteSuccess=False and reschedules.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{info, warn};

use registration_common::conditions::{new_condition, set_condition, FALSE};
use registration_common::crd::{ManagedCluster, ManagedClusterAddOn, ManifestWork, CONDITION_DELETE_SUCCESS};
use registration_common::patch::{
    preconditioned_finalizers_patch, status_conditions_patch, without_finalizer,
};
use registration_common::{Error, Result, CLUSTER_FINALIZER, DELETE_BY_OTHER_LABEL};

use crate::backoff::{ErrorBackoff, RESYNC_INTERVAL};
use crate::rbac;

/// Backoff while waiting for dependents to drain
const DRAIN_ESTIMATE: Duration = Duration::from_secs(3);

const REASON_RESOURCE_REMAINING: &str = "ResourceRemaining";
const REASON_FINALIZER_REMAINING: &str = "FinalizerRemaining";

/// Context shared by deletion reconciliations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Caller-declared resource types that must drain before anything is
    /// deleted; the controller only watches these, something else cleans them.
    pub pre_delete_monitors: Vec<ApiResource>,
    /// Per-cluster retry backoff
    pub backoff: ErrorBackoff,
}

/// What a cleanup phase observed about one resource type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Remaining {
    /// Human-readable resource description (plural.group)
    pub resource: String,
    /// Number of instances still present
    pub count: usize,
    /// Finalizer name → number of instances still carrying it
    pub finalizers: BTreeMap<String, usize>,
}

impl Remaining {
    fn empty() -> Self {
        Self::default()
    }

    fn is_drained(&self) -> bool {
        self.count == 0
    }

    /// Condition describing this leftover, or None when drained.
    ///
    /// Finalizer counts are summarized sorted by name so repeated syncs
    /// produce byte-identical messages and the condition write dedupes.
    pub fn blocking_condition(
        &self,
        cluster_name: &str,
    ) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition> {
        if self.is_drained() {
            return None;
        }
        if !self.finalizers.is_empty() {
            let mut by_finalizer: Vec<String> = self
                .finalizers
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(name, count)| format!("{name} in {count} resource instances"))
                .collect();
            by_finalizer.sort();
            return Some(new_condition(
                CONDITION_DELETE_SUCCESS,
                FALSE,
                REASON_FINALIZER_REMAINING,
                format!(
                    "resource {} for cluster {} has finalizers remaining: {}",
                    self.resource,
                    cluster_name,
                    by_finalizer.join(", ")
                ),
            ));
        }
        Some(new_condition(
            CONDITION_DELETE_SUCCESS,
            FALSE,
            REASON_RESOURCE_REMAINING,
            format!(
                "resource {} for cluster {} has {} resource remaining",
                self.resource, cluster_name, self.count
            ),
        ))
    }
}

/// Reconcile one ManagedCluster's deletion
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_none() {
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }
    let finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let remaining = cleanup(&ctx, &name).await?;
    ctx.backoff.reset(&name);
    if let Some(condition) = remaining.blocking_condition(&name) {
        info!(cluster = %name, resource = %remaining.resource, count = remaining.count,
            "cluster dependents still draining");
        write_delete_condition(&ctx.client, &cluster, condition).await?;
        return Ok(Action::requeue(DRAIN_ESTIMATE));
    }

    release_finalizer(&ctx.client, &cluster).await?;
    info!(cluster = %name, "cluster cleanup complete, finalizer released");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per cluster
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "deletion reconciliation failed");
    Action::requeue(ctx.backoff.next_delay(&cluster.name_any()))
}

/// Run the ordered cleanup, stopping at the first phase with leftovers
async fn cleanup(ctx: &Context, cluster_name: &str) -> Result<Remaining> {
    // phase 1: critical resources drain before anything is deleted
    for monitored in &ctx.pre_delete_monitors {
        let api: Api<DynamicObject> =
            Api::namespaced_with(ctx.client.clone(), cluster_name, monitored);
        let remaining = monitor_dynamic(&api, monitored).await?;
        if !remaining.is_drained() {
            return Ok(remaining);
        }
    }

    // phase 2: addons, foreground so their agents finish first
    let addons: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), cluster_name);
    let remaining = drain::<ManagedClusterAddOn>(
        &addons,
        "managedclusteraddons.addon.open-cluster-management.io",
        &ListParams::default(),
    )
    .await?;
    if !remaining.is_drained() {
        return Ok(remaining);
    }

    // phase 3: manifestworks, except those another owner deletes
    let works: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), cluster_name);
    let opt_out = ListParams::default().labels(&format!("!{DELETE_BY_OTHER_LABEL}"));
    let remaining = drain::<ManifestWork>(
        &works,
        "manifestworks.work.open-cluster-management.io",
        &opt_out,
    )
    .await?;
    if !remaining.is_drained() {
        return Ok(remaining);
    }

    // phase 4: confirm no works remain at all, opted-out ones included
    let remaining = monitor::<ManifestWork>(
        &works,
        "manifestworks.work.open-cluster-management.io",
        &ListParams::default(),
    )
    .await?;
    if !remaining.is_drained() {
        return Ok(remaining);
    }

    // phase 5: the cluster namespace, unless opted out
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    match namespaces.get_opt(cluster_name).await.map_err(|source| Error::Kube { source })? {
        Some(ns) => {
            let opted_out = ns
                .metadata
                .labels
                .as_ref()
                .map(|l| l.contains_key(DELETE_BY_OTHER_LABEL))
                .unwrap_or(false);
            if !opted_out {
                if ns.metadata.deletion_timestamp.is_none() {
                    namespaces
                        .delete(cluster_name, &DeleteParams::default())
                        .await
                        .map_err(|source| Error::Kube { source })?;
                }
                return Ok(Remaining {
                    resource: "namespaces".to_string(),
                    count: 1,
                    finalizers: BTreeMap::new(),
                });
            }
        }
        None => {}
    }

    // phase 6: materialized RBAC
    rbac::remove_cluster_resources(&ctx.client, cluster_name).await?;
    Ok(Remaining::empty())
}

fn summarize<I>(resource: &str, items: I) -> Remaining
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut count = 0;
    let mut finalizers: BTreeMap<String, usize> = BTreeMap::new();
    for item_finalizers in items {
        count += 1;
        for finalizer in item_finalizers {
            *finalizers.entry(finalizer).or_default() += 1;
        }
    }
    Remaining {
        resource: resource.to_string(),
        count,
        finalizers,
    }
}

async fn monitor<K>(api: &Api<K>, resource: &str, lp: &ListParams) -> Result<Remaining>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    let list = api.list_metadata(lp).await.map_err(|source| Error::Kube { source })?;
    Ok(summarize(
        resource,
        list.items
            .into_iter()
            .map(|item| item.metadata.finalizers.unwrap_or_default()),
    ))
}

async fn monitor_dynamic(api: &Api<DynamicObject>, resource: &ApiResource) -> Result<Remaining> {
    let list = api
        .list_metadata(&ListParams::default())
        .await
        .map_err(|source| Error::Kube { source })?;
    Ok(summarize(
        &format!("{}.{}", resource.plural, resource.group),
        list.items
            .into_iter()
            .map(|item| item.metadata.finalizers.unwrap_or_default()),
    ))
}

/// List-then-delete a resource collection; reports what was present before
/// the delete so the caller reschedules until the drain is observed empty.
async fn drain<K>(api: &Api<K>, resource: &str, lp: &ListParams) -> Result<Remaining>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    let remaining = monitor(api, resource, lp).await?;
    if remaining.is_drained() {
        return Ok(remaining);
    }

    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    api.delete_collection(&dp, lp)
        .await
        .map_err(|source| Error::Kube { source })?;
    Ok(remaining)
}

async fn write_delete_condition(
    client: &Client,
    cluster: &ManagedCluster,
    condition: k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition,
) -> Result<()> {
    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    if !set_condition(&mut conditions, condition) {
        return Ok(());
    }
    let api: Api<ManagedCluster> = Api::all(client.clone());
    api.patch_status(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(status_conditions_patch(&conditions)),
    )
    .await
    .map_err(|source| Error::Kube { source })?;
    Ok(())
}

async fn release_finalizer(client: &Client, cluster: &ManagedCluster) -> Result<()> {
    let finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    let Some(remaining) = without_finalizer(&finalizers, CLUSTER_FINALIZER) else {
        return Ok(());
    };
    let api: Api<ManagedCluster> = Api::all(client.clone());
    api.patch(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(preconditioned_finalizers_patch(&cluster.metadata, &remaining)),
    )
    .await
    .map_err(|source| Error::Kube { source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drained_resources_produce_no_condition() {
        let remaining = summarize("manifestworks.work.open-cluster-management.io", vec![]);
        assert!(remaining.is_drained());
        assert!(remaining.blocking_condition("cluster1").is_none());
    }

    #[test]
    fn leftover_resources_report_resource_remaining() {
        let remaining = summarize(
            "manifestworks.work.open-cluster-management.io",
            vec![vec![], vec![]],
        );
        let condition = remaining.blocking_condition("cluster1").unwrap();
        assert_eq!(condition.type_, CONDITION_DELETE_SUCCESS);
        assert_eq!(condition.status, FALSE);
        assert_eq!(condition.reason, REASON_RESOURCE_REMAINING);
        assert!(condition.message.contains("has 2 resource remaining"));
        assert!(condition.message.contains("cluster1"));
    }

    #[test]
    fn leftover_finalizers_win_over_plain_counts() {
        let remaining = summarize(
            "managedclusteraddons.addon.open-cluster-management.io",
            vec![
                vec!["b.io/cleanup".to_string()],
                vec!["a.io/cleanup".to_string(), "b.io/cleanup".to_string()],
            ],
        );
        let condition = remaining.blocking_condition("cluster1").unwrap();
        assert_eq!(condition.reason, REASON_FINALIZER_REMAINING);
        // stable-sorted summary: a.io before b.io
        assert!(condition.message.contains(
            "a.io/cleanup in 1 resource instances, b.io/cleanup in 2 resource instances"
        ));
    }

    #[test]
    fn finalizer_summary_is_stable_across_orderings() {
        let a = summarize(
            "r",
            vec![vec!["x".to_string()], vec!["y".to_string()]],
        );
        let b = summarize(
            "r",
            vec![vec!["y".to_string()], vec!["x".to_string()]],
        );
        assert_eq!(
            a.blocking_condition("c").unwrap().message,
            b.blocking_condition("c").unwrap().message
        );
    }
}
