//! Lease publisher
//!
//! Periodically renews the cluster lease in the cluster's hub namespace and,
//! per addon with lease-based health checking, the addon lease in its install
//! namespace. Leases are recreated if missing; clocks are only assumed
//! monotonic per writer.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use registration_common::crd::{HealthCheckMode, ManagedClusterAddOn};
use registration_common::{Error, Result, DEFAULT_LEASE_DURATION_SECONDS};

/// Spoke-side lease publisher
pub struct LeasePublisher {
    /// Client bound to the hub
    pub hub_client: Client,
    /// Client for leases on the managed cluster
    pub managed_client: Client,
    /// Client for leases on the management cluster (hosted addons)
    pub management_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// Lease duration published on the cluster lease
    pub lease_duration_seconds: i32,
    /// Whether addon leases are maintained too
    pub addons_enabled: bool,
}

impl LeasePublisher {
    /// Run until cancelled, renewing once per lease duration
    pub async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.lease_duration_seconds.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster = %self.cluster_name, "lease publisher stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.renew_cluster_lease().await {
                        warn!(cluster = %self.cluster_name, error = %e, "cluster lease renewal failed");
                    }
                    if self.addons_enabled {
                        if let Err(e) = self.renew_addon_leases().await {
                            warn!(cluster = %self.cluster_name, error = %e, "addon lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    async fn renew_cluster_lease(&self) -> Result<()> {
        let leases: Api<Lease> = Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        renew_lease(
            &leases,
            &self.cluster_name,
            Some(self.lease_duration_seconds),
        )
        .await
    }

    async fn renew_addon_leases(&self) -> Result<()> {
        let addons: Api<ManagedClusterAddOn> =
            Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        let addon_list = addons
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::Kube { source })?;

        for addon in &addon_list.items {
            let lease_based = addon
                .status
                .as_ref()
                .map(|s| s.health_check.mode == HealthCheckMode::Lease)
                .unwrap_or(true);
            if !lease_based || addon.metadata.deletion_timestamp.is_some() {
                continue;
            }

            let client = if addon.runs_outside_managed_cluster() {
                &self.management_client
            } else {
                &self.managed_client
            };
            let name = match &addon.metadata.name {
                Some(name) => name,
                None => continue,
            };
            let leases: Api<Lease> = Api::namespaced(client.clone(), addon.install_namespace());
            if let Err(e) = renew_lease(&leases, name, None).await {
                warn!(addon = %name, error = %e, "addon lease renewal failed");
            }
        }
        Ok(())
    }
}

/// Renew a lease, creating it when missing
pub async fn renew_lease(
    leases: &Api<Lease>,
    name: &str,
    lease_duration_seconds: Option<i32>,
) -> Result<()> {
    let now = MicroTime(Utc::now());
    match leases
        .get_opt(name)
        .await
        .map_err(|source| Error::Kube { source })?
    {
        Some(_) => {
            leases
                .patch(
                    name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({ "spec": { "renewTime": now } })),
                )
                .await
                .map_err(|source| Error::Kube { source })?;
        }
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    renew_time: Some(now),
                    lease_duration_seconds: Some(
                        lease_duration_seconds.unwrap_or(DEFAULT_LEASE_DURATION_SECONDS),
                    ),
                    ..Default::default()
                }),
            };
            leases
                .create(&PostParams::default(), &lease)
                .await
                .map_err(|source| Error::Kube { source })?;
        }
    }
    Ok(())
}
