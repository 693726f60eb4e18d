//! Addon lease evaluation
//!
//! One controller per addon compares the addon's lease against wall clock
//! and writes the addon's Available condition on the hub. Addons whose lease
//! moved planes still have old agents renewing the hub-side lease, so a
//! missing primary lease falls back to the hub copy before Unknown is
//! declared.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use registration_common::conditions::{new_condition, set_condition, FALSE, TRUE, UNKNOWN};
use registration_common::crd::{
    HealthCheckMode, ManagedClusterAddOn, ADDON_CONDITION_AVAILABLE,
};
use registration_common::helpers::is_lease_fresh;
use registration_common::patch::status_conditions_patch;
use registration_common::{Error, Result, DEFAULT_LEASE_DURATION_SECONDS};

use super::ADDON_SYNC_INTERVAL;

/// Decide the Available condition for an addon from its observed leases.
pub fn evaluate_addon_lease(
    addon_name: &str,
    primary: Option<&Lease>,
    hub_fallback: Option<&Lease>,
    now: DateTime<Utc>,
) -> Condition {
    let lease = primary.or(hub_fallback);
    match lease {
        Some(lease) => {
            if is_lease_fresh(lease, DEFAULT_LEASE_DURATION_SECONDS, now) {
                new_condition(
                    ADDON_CONDITION_AVAILABLE,
                    TRUE,
                    "ManagedClusterAddOnLeaseUpdated",
                    format!("{addon_name} add-on is available."),
                )
            } else {
                new_condition(
                    ADDON_CONDITION_AVAILABLE,
                    FALSE,
                    "ManagedClusterAddOnLeaseUpdateStopped",
                    format!("{addon_name} add-on is not available."),
                )
            }
        }
        None => new_condition(
            ADDON_CONDITION_AVAILABLE,
            UNKNOWN,
            "ManagedClusterAddOnLeaseNotFound",
            format!("The status of {addon_name} add-on is unknown."),
        ),
    }
}

/// Lease evaluation controller for one addon
pub struct AddonLeaseController {
    /// Hub client, for reading the addon and writing its status
    pub hub_client: Client,
    /// Client for the plane holding the addon lease
    pub lease_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// Addon under evaluation
    pub addon_name: String,
}

impl AddonLeaseController {
    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(ADDON_SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(addon = %self.addon_name, "addon lease controller stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(addon = %self.addon_name, error = %e, "addon lease sync failed");
                    }
                }
            }
        }
    }

    async fn sync(&self) -> Result<()> {
        let addons: Api<ManagedClusterAddOn> =
            Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        let Some(addon) = addons
            .get_opt(&self.addon_name)
            .await
            .map_err(|source| Error::Kube { source })?
        else {
            // addon is gone; the supervisor will cancel this controller
            return Ok(());
        };

        // customized health checking belongs to the addon's own manager
        if addon
            .status
            .as_ref()
            .map(|s| s.health_check.mode == HealthCheckMode::Customized)
            .unwrap_or(false)
        {
            return Ok(());
        }

        let leases: Api<Lease> =
            Api::namespaced(self.lease_client.clone(), addon.install_namespace());
        let primary = leases
            .get_opt(&self.addon_name)
            .await
            .map_err(|source| Error::Kube { source })?;

        // transitional fallback: addons used to renew their leases on the hub
        let hub_fallback = if primary.is_none() {
            let hub_leases: Api<Lease> =
                Api::namespaced(self.hub_client.clone(), &self.cluster_name);
            hub_leases
                .get_opt(&self.addon_name)
                .await
                .map_err(|source| Error::Kube { source })?
        } else {
            None
        };

        let desired = evaluate_addon_lease(
            &self.addon_name,
            primary.as_ref(),
            hub_fallback.as_ref(),
            Utc::now(),
        );

        let mut conditions = addon
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        if !set_condition(&mut conditions, desired) {
            return Ok(());
        }

        addons
            .patch_status(
                &self.addon_name,
                &PatchParams::default(),
                &Patch::Merge(status_conditions_patch(&conditions)),
            )
            .await
            .map_err(|source| Error::Kube { source })?;
        info!(addon = %self.addon_name, "updated addon availability");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use k8s_openapi::api::coordination::v1::LeaseSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;

    fn lease_renewed_secs_ago(secs: i64, now: DateTime<Utc>) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                renew_time: Some(MicroTime(now - Duration::seconds(secs))),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_primary_lease_is_available() {
        let now = Utc::now();
        let lease = lease_renewed_secs_ago(30, now);
        let condition = evaluate_addon_lease("helloworld", Some(&lease), None, now);
        assert_eq!(condition.status, TRUE);
        assert_eq!(condition.reason, "ManagedClusterAddOnLeaseUpdated");
        assert!(condition.message.contains("helloworld"));
    }

    #[test]
    fn stale_primary_lease_is_unavailable() {
        let now = Utc::now();
        let lease = lease_renewed_secs_ago(301, now);
        let condition = evaluate_addon_lease("helloworld", Some(&lease), None, now);
        assert_eq!(condition.status, FALSE);
        assert_eq!(condition.reason, "ManagedClusterAddOnLeaseUpdateStopped");
    }

    #[test]
    fn missing_primary_falls_back_to_hub_lease() {
        let now = Utc::now();
        let hub_lease = lease_renewed_secs_ago(30, now);
        let condition = evaluate_addon_lease("helloworld", None, Some(&hub_lease), now);
        assert_eq!(condition.status, TRUE);

        let stale_hub = lease_renewed_secs_ago(500, now);
        let condition = evaluate_addon_lease("helloworld", None, Some(&stale_hub), now);
        assert_eq!(condition.status, FALSE);
    }

    #[test]
    fn no_lease_anywhere_is_unknown() {
        let condition = evaluate_addon_lease("helloworld", None, None, Utc::now());
        assert_eq!(condition.status, UNKNOWN);
        assert_eq!(condition.reason, "ManagedClusterAddOnLeaseNotFound");
    }

    #[test]
    fn fresh_primary_ignores_stale_hub_copy() {
        let now = Utc::now();
        let primary = lease_renewed_secs_ago(10, now);
        let stale_hub = lease_renewed_secs_ago(10_000, now);
        let condition = evaluate_addon_lease("helloworld", Some(&primary), Some(&stale_hub), now);
        assert_eq!(condition.status, TRUE);
    }
}
