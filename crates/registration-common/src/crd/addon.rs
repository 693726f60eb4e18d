//! ManagedClusterAddOn Custom Resource Definition
//!
//! One object per (cluster, addon), living in the cluster's hub namespace.
//! The addon declares how its agents register (signer + subject) and how its
//! health is checked (lease or customized).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ADDON_HOSTED_MODE_ANNOTATION, DEFAULT_ADDON_INSTALL_NAMESPACE};

/// Condition type reflecting addon liveness
pub const ADDON_CONDITION_AVAILABLE: &str = "Available";

/// Addon health-check label values projected onto the cluster
pub const ADDON_STATUS_AVAILABLE: &str = "available";
/// The addon lease went stale
pub const ADDON_STATUS_UNHEALTHY: &str = "unhealthy";
/// The addon's availability is unknown
pub const ADDON_STATUS_UNREACHABLE: &str = "unreachable";

/// Specification for a ManagedClusterAddOn
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    plural = "managedclusteraddons",
    shortname = "mca",
    status = "ManagedClusterAddOnStatus",
    namespaced,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    /// Namespace on the managed cluster where the addon agent is installed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_namespace: String,
}

/// A client-certificate registration declared by the addon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AddOnRegistration {
    /// Signer the addon's CSRs are submitted under, passed through verbatim
    pub signer_name: String,

    /// Subject requested for the addon agent identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<AddOnSubject>,
}

/// X.509 subject requested by an addon registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AddOnSubject {
    /// Common name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Organizations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Organizational units
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization_units: Vec<String>,
}

/// How addon availability is determined
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HealthCheckMode {
    /// The registration agent evaluates the addon lease
    #[default]
    Lease,
    /// The addon's own manager owns the Available condition
    Customized,
}

/// Health-check configuration reported in addon status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddOnHealthCheck {
    /// Mode of the health check
    #[serde(default)]
    pub mode: HealthCheckMode,
}

/// Status for a ManagedClusterAddOn
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    /// Conditions: Available plus one per registration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Client-certificate registrations declared by the addon
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registrations: Vec<AddOnRegistration>,

    /// Health-check configuration
    #[serde(default)]
    pub health_check: AddOnHealthCheck,
}

impl ManagedClusterAddOn {
    /// The namespace where the addon agent is installed, defaulted when unset
    pub fn install_namespace(&self) -> &str {
        if self.spec.install_namespace.is_empty() {
            DEFAULT_ADDON_INSTALL_NAMESPACE
        } else {
            &self.spec.install_namespace
        }
    }

    /// Whether the addon agent runs outside the managed cluster (hosted mode)
    pub fn runs_outside_managed_cluster(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ADDON_HOSTED_MODE_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn addon(install_namespace: &str) -> ManagedClusterAddOn {
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("helloworld".to_string()),
                namespace: Some("cluster1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec {
                install_namespace: install_namespace.to_string(),
            },
            status: None,
        }
    }

    #[test]
    fn install_namespace_defaults_when_empty() {
        assert_eq!(addon("").install_namespace(), "open-cluster-management-agent-addon");
        assert_eq!(addon("custom-ns").install_namespace(), "custom-ns");
    }

    #[test]
    fn hosted_mode_requires_true_annotation() {
        let mut a = addon("");
        assert!(!a.runs_outside_managed_cluster());

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(ADDON_HOSTED_MODE_ANNOTATION.to_string(), "false".to_string());
        a.metadata.annotations = Some(annotations.clone());
        assert!(!a.runs_outside_managed_cluster());

        annotations.insert(ADDON_HOSTED_MODE_ANNOTATION.to_string(), "true".to_string());
        a.metadata.annotations = Some(annotations);
        assert!(a.runs_outside_managed_cluster());
    }

    #[test]
    fn health_check_mode_defaults_to_lease() {
        let status: ManagedClusterAddOnStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.health_check.mode, HealthCheckMode::Lease);
    }
}
