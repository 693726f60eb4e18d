//! Identity subjects for cluster and addon client certificates

use registration_common::{MANAGED_CLUSTERS_GROUP, SUBJECT_PREFIX};

/// The X.509 subject requested in a client certificate CSR
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    /// Common name; doubles as the Kubernetes user name
    pub common_name: String,
    /// Organizations; double as Kubernetes groups
    pub organizations: Vec<String>,
    /// Organizational units
    pub organization_units: Vec<String>,
}

impl Subject {
    /// The identity of a managed cluster's registration agent.
    ///
    /// O carries the per-cluster group `open-cluster-management:<cluster>`
    /// plus the legacy group shared by all managed clusters; CN binds the
    /// individual agent: `open-cluster-management:<cluster>:<agent>`.
    pub fn for_cluster(cluster_name: &str, agent_name: &str) -> Self {
        Self {
            common_name: format!("{SUBJECT_PREFIX}{cluster_name}:{agent_name}"),
            organizations: vec![
                format!("{SUBJECT_PREFIX}{cluster_name}"),
                MANAGED_CLUSTERS_GROUP.to_string(),
            ],
            organization_units: vec![],
        }
    }

    /// The per-cluster organization expected on a renewal CSR
    pub fn cluster_organization(cluster_name: &str) -> String {
        format!("{SUBJECT_PREFIX}{cluster_name}")
    }

    /// The DNS SAN claimed by an addon agent certificate
    pub fn addon_dns_name(addon_name: &str) -> String {
        format!("{addon_name}.addon.open-cluster-management.io")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_subject_layout() {
        let subject = Subject::for_cluster("cluster1", "agent-abc123");
        assert_eq!(subject.common_name, "open-cluster-management:cluster1:agent-abc123");
        assert_eq!(
            subject.organizations,
            vec![
                "open-cluster-management:cluster1".to_string(),
                "open-cluster-management:managedclusters".to_string(),
            ]
        );
        assert!(subject.organization_units.is_empty());
    }

    #[test]
    fn common_name_is_prefixed_by_cluster_organization() {
        let subject = Subject::for_cluster("cluster1", "agent-abc123");
        assert!(subject
            .common_name
            .starts_with(&Subject::cluster_organization("cluster1")));
    }

    #[test]
    fn addon_dns_name_format() {
        assert_eq!(
            Subject::addon_dns_name("helloworld"),
            "helloworld.addon.open-cluster-management.io"
        );
    }
}
