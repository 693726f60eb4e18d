//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is the hub-side enrollment record for a spoke cluster.
//! The joining spoke creates it and owns the spec; the hub owns acceptance,
//! taint timestamps, and the RBAC materialized for accepted clusters.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::helpers::is_valid_https_url;
use crate::{Error, DEFAULT_LEASE_DURATION_SECONDS};

/// Condition type set by the hub when the cluster admin accepts the spoke
pub const CONDITION_HUB_ACCEPTED: &str = "HubAccepted";

/// Condition type set by the spoke once it has joined the hub
pub const CONDITION_JOINED: &str = "ManagedClusterJoined";

/// Condition type reflecting lease-based liveness
pub const CONDITION_AVAILABLE: &str = "ManagedClusterConditionAvailable";

/// Condition type reporting cleanup progress during deletion
pub const CONDITION_DELETE_SUCCESS: &str = "ContentDeleteSuccess";

/// Taint key applied when the cluster's availability is unknown
pub const TAINT_UNREACHABLE: &str = "cluster.open-cluster-management.io/unreachable";

/// Taint key applied when the cluster is known to be unavailable
pub const TAINT_UNAVAILABLE: &str = "cluster.open-cluster-management.io/unavailable";

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mcl",
    status = "ManagedClusterStatus",
    printcolumn = r#"{"name":"Hub Accepted","type":"boolean","jsonPath":".spec.hubAcceptsClient"}"#,
    printcolumn = r#"{"name":"Joined","type":"string","jsonPath":".status.conditions[?(@.type==\"ManagedClusterJoined\")].status"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"ManagedClusterConditionAvailable\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Whether the hub admin has accepted this spoke cluster
    #[serde(default)]
    pub hub_accepts_client: bool,

    /// How long the cluster lease stays valid after a renewal, in seconds
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: i32,

    /// Client endpoints through which the spoke's apiserver can be reached
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_cluster_client_configs: Vec<ClientConfig>,

    /// Scheduling-visible taints projected from availability
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

fn default_lease_duration() -> i32 {
    DEFAULT_LEASE_DURATION_SECONDS
}

impl Default for ManagedClusterSpec {
    fn default() -> Self {
        Self {
            hub_accepts_client: false,
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            managed_cluster_client_configs: vec![],
            taints: vec![],
        }
    }
}

/// An apiserver endpoint of the managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// URL of the apiserver; must be https
    pub url: String,

    /// Base64-encoded CA bundle for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Effect a taint has on scheduling decisions
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TaintEffect {
    /// The cluster is not selectable
    NoSelect,
    /// Selection is discouraged but allowed
    PreferNoSelect,
    /// Existing placements stay; new ones avoid the cluster
    NoSelectIfNew,
}

/// A scheduling taint on a managed cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key
    pub key: String,

    /// Taint value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    /// Effect on scheduling
    pub effect: TaintEffect,

    /// When the taint was added; stamped by the admission mutator, never by clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<Time>,
}

impl Taint {
    /// Two taints match when key, value and effect are equal (timeAdded excluded)
    pub fn matches(&self, other: &Taint) -> bool {
        self.key == other.key && self.value == other.value && self.effect == other.effect
    }
}

/// A bounded key/value fact reported by the spoke
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterClaim {
    /// Claim name
    pub name: String,
    /// Claim value
    pub value: String,
}

/// Kubernetes version of the managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterVersion {
    /// GitVersion of the spoke apiserver
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes: String,
}

/// Status for a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Conditions describing acceptance, join and availability
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Total node capacity of the managed cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,

    /// Allocatable resources of the managed cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, Quantity>,

    /// Version of the managed cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ManagedClusterVersion>,

    /// Claims reported by the spoke, bounded by the agent's claim limit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_claims: Vec<ManagedClusterClaim>,
}

impl ManagedClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.lease_duration_seconds <= 0 {
            return Err(Error::validation("leaseDurationSeconds must be positive"));
        }
        for config in &self.managed_cluster_client_configs {
            if !is_valid_https_url(&config.url) {
                return Err(Error::validation(format!(
                    "url {:?} is invalid in client configs",
                    config.url
                )));
            }
        }
        Ok(())
    }
}

impl ManagedCluster {
    /// Find a taint by key in the cluster spec
    pub fn find_taint_by_key(&self, key: &str) -> Option<&Taint> {
        self.spec.taints.iter().find(|t| t.key == key)
    }
}

/// Add a taint unless a matching one (key+value+effect) is already present.
/// Returns true if the set changed.
pub fn add_taint(taints: &mut Vec<Taint>, taint: &Taint) -> bool {
    if taints.iter().any(|t| t.matches(taint)) {
        return false;
    }
    // replace a same-key taint with different value/effect rather than duplicating
    taints.retain(|t| t.key != taint.key);
    taints.push(taint.clone());
    true
}

/// Remove every taint matching key+value+effect. Returns true if the set changed.
pub fn remove_taint(taints: &mut Vec<Taint>, taint: &Taint) -> bool {
    let before = taints.len();
    taints.retain(|t| !t.matches(taint));
    taints.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: &str, effect: TaintEffect) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
            time_added: None,
        }
    }

    #[test]
    fn spec_defaults_lease_duration() {
        let spec: ManagedClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.lease_duration_seconds, 60);
        assert!(!spec.hub_accepts_client);
    }

    #[test]
    fn validate_rejects_non_https_client_config() {
        let spec = ManagedClusterSpec {
            managed_cluster_client_configs: vec![ClientConfig {
                url: "http://insecure.example.com".to_string(),
                ca_bundle: None,
            }],
            lease_duration_seconds: 60,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_accepts_https_client_config() {
        let spec = ManagedClusterSpec {
            managed_cluster_client_configs: vec![ClientConfig {
                url: "https://detached:6443".to_string(),
                ca_bundle: Some("Y2E=".to_string()),
            }],
            lease_duration_seconds: 60,
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn taint_matching_ignores_time_added() {
        let mut a = taint("k", "v", TaintEffect::NoSelect);
        let b = taint("k", "v", TaintEffect::NoSelect);
        a.time_added = Some(Time(chrono::Utc::now()));
        assert!(a.matches(&b));

        let c = taint("k", "v", TaintEffect::PreferNoSelect);
        assert!(!a.matches(&c));
    }

    #[test]
    fn add_taint_is_idempotent() {
        let mut taints = vec![];
        let t = taint(TAINT_UNREACHABLE, "", TaintEffect::NoSelect);
        assert!(add_taint(&mut taints, &t));
        assert!(!add_taint(&mut taints, &t));
        assert_eq!(taints.len(), 1);
    }

    #[test]
    fn add_taint_replaces_same_key_different_effect() {
        let mut taints = vec![taint("k", "v", TaintEffect::NoSelect)];
        assert!(add_taint(&mut taints, &taint("k", "v", TaintEffect::NoSelectIfNew)));
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].effect, TaintEffect::NoSelectIfNew);
    }

    #[test]
    fn remove_taint_only_drops_matches() {
        let mut taints = vec![
            taint(TAINT_UNREACHABLE, "", TaintEffect::NoSelect),
            taint("user-taint", "x", TaintEffect::PreferNoSelect),
        ];
        assert!(remove_taint(
            &mut taints,
            &taint(TAINT_UNREACHABLE, "", TaintEffect::NoSelect)
        ));
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "user-taint");
        assert!(!remove_taint(
            &mut taints,
            &taint(TAINT_UNREACHABLE, "", TaintEffect::NoSelect)
        ));
    }

    #[test]
    fn taint_effect_wire_format() {
        let t = taint("k", "v", TaintEffect::NoSelectIfNew);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["effect"], "NoSelectIfNew");
        // timeAdded is omitted until admission stamps it
        assert!(json.get("timeAdded").is_none());
    }
}
