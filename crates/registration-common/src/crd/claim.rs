//! ClusterClaim Custom Resource Definition
//!
//! Claims are facts a spoke cluster exposes about itself. The registration
//! agent mirrors them into the ManagedCluster status on the hub.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a ClusterClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterClaim",
    plural = "clusterclaims"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClaimSpec {
    /// Claim value, at most 1024 characters
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}
