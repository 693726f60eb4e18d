//! ManagedClusterSet Custom Resource Definition
//!
//! A cluster set groups managed clusters through an exclusive label. The
//! admission mutator forces the selector to the set's own name so that a
//! cluster can belong to at most one set.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only selector type currently supported
pub const SELECTOR_TYPE_EXCLUSIVE_LABEL: &str = "ExclusiveLabel";

/// Specification for a ManagedClusterSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1beta1",
    kind = "ManagedClusterSet",
    plural = "managedclustersets",
    shortname = "mclset",
    status = "ManagedClusterSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSetSpec {
    /// How member clusters are selected
    #[serde(default)]
    pub cluster_selector: ClusterSelector,
}

/// Selector choosing the member clusters of a set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelector {
    /// Selector kind; defaulted to ExclusiveLabel by admission
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector_type: String,

    /// The exclusive membership label; forced to the set name by admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_label: Option<ExclusiveLabel>,
}

/// Label key/value binding a cluster to exactly one set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExclusiveLabel {
    /// Label key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Label value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Status for a ManagedClusterSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSetStatus {
    /// Conditions of the cluster set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}
