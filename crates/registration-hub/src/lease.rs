//! Cluster lease evaluator
//!
//! Compares each accepted cluster's lease against wall clock and projects the
//! result into the ManagedClusterConditionAvailable condition. Grace is
//! 5 × leaseDurationSeconds, so brief publisher hiccups and clock skew do not
//! flap availability.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use registration_common::conditions::{
    find_condition, is_condition_true, new_condition, set_condition, FALSE, TRUE, UNKNOWN,
};
use registration_common::crd::{ManagedCluster, CONDITION_AVAILABLE, CONDITION_HUB_ACCEPTED};
use registration_common::helpers::is_lease_fresh;
use registration_common::patch::status_conditions_patch;
use registration_common::{Error, Result};

use crate::backoff::ErrorBackoff;

/// How often every cluster is re-evaluated even without store events
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(60);

/// Context shared by lease evaluations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Per-cluster retry backoff
    pub backoff: ErrorBackoff,
}

/// Decide the Available condition for a cluster given its observed lease.
///
/// Returns None when no condition should be written: the cluster has never
/// reported and has no Available condition to correct.
pub fn evaluate(
    cluster: &ManagedCluster,
    lease: Option<&Lease>,
    now: DateTime<Utc>,
) -> Option<Condition> {
    let has_available = cluster
        .status
        .as_ref()
        .map(|s| find_condition(&s.conditions, CONDITION_AVAILABLE).is_some())
        .unwrap_or(false);

    match lease {
        None => {
            if has_available {
                return None;
            }
            Some(new_condition(
                CONDITION_AVAILABLE,
                UNKNOWN,
                "ManagedClusterLeaseNotFound",
                format!(
                    "The status of managed cluster {} is unknown, its lease is not found",
                    cluster.name_any()
                ),
            ))
        }
        Some(lease) => {
            if is_lease_fresh(lease, cluster.spec.lease_duration_seconds, now) {
                Some(new_condition(
                    CONDITION_AVAILABLE,
                    TRUE,
                    "ManagedClusterAvailable",
                    format!("Managed cluster {} is available", cluster.name_any()),
                ))
            } else {
                Some(new_condition(
                    CONDITION_AVAILABLE,
                    FALSE,
                    "ManagedClusterLeaseUpdateStopped",
                    format!(
                        "Registration agent stopped updating its lease within {} seconds",
                        5 * cluster.spec.lease_duration_seconds
                    ),
                ))
            }
        }
    }
}

/// Reconcile one ManagedCluster's availability
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(EVALUATION_INTERVAL));
    }

    // unaccepted clusters publish no lease yet
    let conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    if !is_condition_true(conditions, CONDITION_HUB_ACCEPTED) {
        return Ok(Action::requeue(EVALUATION_INTERVAL));
    }

    // the cluster lease lives in the cluster's namespace under its own name
    let leases: Api<Lease> = Api::namespaced(ctx.client.clone(), &name);
    let lease = leases
        .get_opt(&name)
        .await
        .map_err(|source| Error::Kube { source })?;

    if let Some(desired) = evaluate(&cluster, lease.as_ref(), Utc::now()) {
        let mut conditions = cluster
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        // skip the write when status and reason are unchanged
        if set_condition(&mut conditions, desired) {
            let api: Api<ManagedCluster> = Api::all(ctx.client.clone());
            api.patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(status_conditions_patch(&conditions)),
            )
            .await
            .map_err(|source| Error::Kube { source })?;
            info!(cluster = %name, "updated cluster availability");
        }
    }

    ctx.backoff.reset(&name);
    Ok(Action::requeue(EVALUATION_INTERVAL))
}

/// Error policy: exponential backoff per cluster
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "lease evaluation failed");
    Action::requeue(ctx.backoff.next_delay(&cluster.name_any()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::coordination::v1::LeaseSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
    use kube::core::ObjectMeta;
    use registration_common::crd::{ManagedClusterSpec, ManagedClusterStatus};

    fn cluster(conditions: Vec<Condition>) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("cluster1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                hub_accepts_client: true,
                lease_duration_seconds: 60,
                ..Default::default()
            },
            status: Some(ManagedClusterStatus {
                conditions,
                ..Default::default()
            }),
        }
    }

    fn lease_renewed_secs_ago(secs: i64, now: DateTime<Utc>) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                renew_time: Some(MicroTime(now - ChronoDuration::seconds(secs))),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn missing_lease_without_condition_is_unknown() {
        let now = Utc::now();
        let condition = evaluate(&cluster(vec![]), None, now).unwrap();
        assert_eq!(condition.status, UNKNOWN);
        assert_eq!(condition.reason, "ManagedClusterLeaseNotFound");
    }

    #[test]
    fn missing_lease_with_existing_condition_is_left_alone() {
        let now = Utc::now();
        let existing = new_condition(CONDITION_AVAILABLE, TRUE, "ManagedClusterAvailable", "ok");
        assert!(evaluate(&cluster(vec![existing]), None, now).is_none());
    }

    #[test]
    fn fresh_lease_is_available() {
        let now = Utc::now();
        let lease = lease_renewed_secs_ago(120, now);
        let condition = evaluate(&cluster(vec![]), Some(&lease), now).unwrap();
        assert_eq!(condition.status, TRUE);
        assert_eq!(condition.reason, "ManagedClusterAvailable");
    }

    #[test]
    fn stale_lease_is_unavailable() {
        let now = Utc::now();
        // grace is 5 × 60 s
        let lease = lease_renewed_secs_ago(301, now);
        let condition = evaluate(&cluster(vec![]), Some(&lease), now).unwrap();
        assert_eq!(condition.status, FALSE);
        assert_eq!(condition.reason, "ManagedClusterLeaseUpdateStopped");
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let now = Utc::now();
        let lease = lease_renewed_secs_ago(10, now);
        let first = evaluate(&cluster(vec![]), Some(&lease), now).unwrap();

        let mut conditions = vec![first.clone()];
        let second = evaluate(&cluster(conditions.clone()), Some(&lease), now).unwrap();
        // same status+reason: set_condition reports no write needed
        assert!(!set_condition(&mut conditions, second));
    }
}
