//! Spoke join controller
//!
//! Creates the ManagedCluster on the hub, publishes the spoke's client
//! configs (external URLs + CA bundle), reports version, capacity and
//! claims, and sets the Joined condition once the hub has accepted the
//! cluster.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use registration_common::conditions::{
    is_condition_true, new_condition, set_condition, TRUE,
};
use registration_common::crd::{
    ClientConfig, ClusterClaim, ManagedCluster, ManagedClusterClaim, ManagedClusterSpec,
    ManagedClusterVersion, CONDITION_HUB_ACCEPTED, CONDITION_JOINED,
};
use registration_common::{Error, Result};

use crate::capacity;

/// Claim names always reported, regardless of the custom-claim bound
const RESERVED_CLAIM_NAMES: &[&str] = &["id.k8s.io"];

/// Spoke-side join controller
pub struct JoinController {
    /// Client bound to the hub
    pub hub_client: Client,
    /// Client bound to the managed cluster
    pub spoke_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// External apiserver URLs published in clientConfigs
    pub external_server_urls: Vec<String>,
    /// CA bundle published alongside the URLs
    pub spoke_ca_bundle: Option<Vec<u8>>,
    /// Whether ClusterClaims are collected
    pub claims_enabled: bool,
    /// Bound on custom claims reported in status
    pub max_custom_cluster_claims: usize,
    /// How often the spoke re-evaluates its own state
    pub healthcheck_period: Duration,
}

impl JoinController {
    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.healthcheck_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster = %self.cluster_name, "join controller stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(cluster = %self.cluster_name, error = %e, "join sync failed");
                    }
                }
            }
        }
    }

    /// Reconcile the hub-side cluster object against local state
    pub async fn sync(&self) -> Result<()> {
        let api: Api<ManagedCluster> = Api::all(self.hub_client.clone());

        let desired_configs = desired_client_configs(
            &self.external_server_urls,
            self.spoke_ca_bundle.as_deref(),
        );

        let cluster = match api
            .get_opt(&self.cluster_name)
            .await
            .map_err(|source| Error::Kube { source })?
        {
            Some(cluster) => cluster,
            None => {
                let cluster = ManagedCluster {
                    metadata: ObjectMeta {
                        name: Some(self.cluster_name.clone()),
                        ..Default::default()
                    },
                    spec: ManagedClusterSpec {
                        managed_cluster_client_configs: desired_configs.clone(),
                        ..Default::default()
                    },
                    status: None,
                };
                let created = api
                    .create(&PostParams::default(), &cluster)
                    .await
                    .map_err(|source| Error::Kube { source })?;
                info!(cluster = %self.cluster_name, "created managed cluster on hub");
                created
            }
        };

        // publish any client configs the hub does not know yet
        if let Some(merged) =
            merge_client_configs(&cluster.spec.managed_cluster_client_configs, &desired_configs)
        {
            api.patch(
                &self.cluster_name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "managedClusterClientConfigs": merged } })),
            )
            .await
            .map_err(|source| Error::Kube { source })?;
        }

        self.sync_status(&api, &cluster).await
    }

    async fn sync_status(&self, api: &Api<ManagedCluster>, cluster: &ManagedCluster) -> Result<()> {
        let version = self
            .spoke_client
            .apiserver_version()
            .await
            .map_err(|source| Error::Kube { source })?;

        let nodes: Api<Node> = Api::all(self.spoke_client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::Kube { source })?;
        let (capacity, allocatable) = capacity::aggregate(&node_list.items);

        let claims = if self.claims_enabled {
            let claim_api: Api<ClusterClaim> = Api::all(self.spoke_client.clone());
            let claim_list = claim_api
                .list(&ListParams::default())
                .await
                .map_err(|source| Error::Kube { source })?;
            select_claims(&claim_list.items, self.max_custom_cluster_claims)
        } else {
            vec![]
        };

        let mut conditions = cluster
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();

        // Joined flips once per join, after the hub accepts
        let mut changed = false;
        if is_condition_true(&conditions, CONDITION_HUB_ACCEPTED)
            && !is_condition_true(&conditions, CONDITION_JOINED)
        {
            changed |= set_condition(
                &mut conditions,
                new_condition(
                    CONDITION_JOINED,
                    TRUE,
                    "ManagedClusterJoined",
                    "Managed cluster joined",
                ),
            );
        }

        let current = cluster.status.clone().unwrap_or_default();
        let status_changed = current.version.as_ref().map(|v| v.kubernetes.as_str())
            != Some(version.git_version.as_str())
            || current.capacity != capacity
            || current.allocatable != allocatable
            || current.cluster_claims != claims;

        if !changed && !status_changed {
            return Ok(());
        }

        api.patch_status(
            &self.cluster_name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "status": {
                    "version": ManagedClusterVersion { kubernetes: version.git_version.clone() },
                    "capacity": capacity,
                    "allocatable": allocatable,
                    "clusterClaims": claims,
                    "conditions": conditions,
                }
            })),
        )
        .await
        .map_err(|source| Error::Kube { source })?;
        info!(cluster = %self.cluster_name, version = %version.git_version, "updated cluster status on hub");
        Ok(())
    }
}

/// Build the client configs the spoke publishes
pub fn desired_client_configs(urls: &[String], ca_bundle: Option<&[u8]>) -> Vec<ClientConfig> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    urls.iter()
        .map(|url| ClientConfig {
            url: url.clone(),
            ca_bundle: ca_bundle.map(|ca| STANDARD.encode(ca)),
        })
        .collect()
}

/// Merge desired configs into the stored ones, keyed by URL.
/// Returns None when nothing needs to change.
pub fn merge_client_configs(
    existing: &[ClientConfig],
    desired: &[ClientConfig],
) -> Option<Vec<ClientConfig>> {
    let mut merged = existing.to_vec();
    let mut changed = false;
    for config in desired {
        if !merged.iter().any(|c| c.url == config.url) {
            merged.push(config.clone());
            changed = true;
        }
    }
    changed.then_some(merged)
}

/// Mirror spoke ClusterClaims into status claims.
///
/// Reserved claims always pass; custom claims are sorted by name and
/// truncated at `max_custom`, so the reported set is deterministic.
pub fn select_claims(claims: &[ClusterClaim], max_custom: usize) -> Vec<ManagedClusterClaim> {
    let mut reserved = vec![];
    let mut custom = vec![];
    for claim in claims {
        let name = match &claim.metadata.name {
            Some(name) => name.clone(),
            None => continue,
        };
        let reported = ManagedClusterClaim {
            name: name.clone(),
            value: claim.spec.value.clone(),
        };
        if RESERVED_CLAIM_NAMES.contains(&name.as_str()) {
            reserved.push(reported);
        } else {
            custom.push(reported);
        }
    }

    custom.sort_by(|a, b| a.name.cmp(&b.name));
    if custom.len() > max_custom {
        warn!(
            total = custom.len(),
            max = max_custom,
            "custom cluster claims exceed the configured bound, truncating"
        );
        custom.truncate(max_custom);
    }

    reserved.sort_by(|a, b| a.name.cmp(&b.name));
    reserved.extend(custom);
    reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use registration_common::crd::ClusterClaimSpec;

    fn claim(name: &str, value: &str) -> ClusterClaim {
        ClusterClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClusterClaimSpec {
                value: value.to_string(),
            },
        }
    }

    #[test]
    fn client_configs_carry_ca_bundle() {
        let configs = desired_client_configs(
            &["https://detached:6443".to_string()],
            Some(b"ca-data"),
        );
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].url, "https://detached:6443");
        assert_eq!(configs[0].ca_bundle.as_deref(), Some("Y2EtZGF0YQ=="));
    }

    #[test]
    fn merge_adds_only_unknown_urls() {
        let existing = desired_client_configs(&["https://a:6443".to_string()], None);
        let desired = desired_client_configs(
            &["https://a:6443".to_string(), "https://b:6443".to_string()],
            None,
        );
        let merged = merge_client_configs(&existing, &desired).unwrap();
        assert_eq!(merged.len(), 2);

        // a second merge is a no-op
        assert!(merge_client_configs(&merged, &desired).is_none());
    }

    #[test]
    fn custom_claims_are_sorted_and_truncated() {
        let claims = vec![
            claim("zeta.example.com", "3"),
            claim("alpha.example.com", "1"),
            claim("mid.example.com", "2"),
        ];
        let selected = select_claims(&claims, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "alpha.example.com");
        assert_eq!(selected[1].name, "mid.example.com");
    }

    #[test]
    fn reserved_claims_bypass_the_bound() {
        let claims = vec![
            claim("id.k8s.io", "cluster-uuid"),
            claim("a.example.com", "1"),
            claim("b.example.com", "2"),
        ];
        let selected = select_claims(&claims, 1);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name, "id.k8s.io");
        assert_eq!(selected[1].name, "a.example.com");
    }

    #[test]
    fn claims_without_names_are_skipped() {
        let mut unnamed = claim("x", "1");
        unnamed.metadata.name = None;
        assert!(select_claims(&[unnamed], 10).is_empty());
    }
}
