//! Common types for the registration control plane: CRDs, errors, and helpers

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod features;
pub mod helpers;
pub mod patch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Signer for cluster client certificates
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Label carrying the managed cluster name on CSRs and other hub resources
pub const CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";

/// Label carrying the addon name on CSRs issued for addon registrations
pub const ADDON_NAME_LABEL: &str = "open-cluster-management.io/addon-name";

/// Label binding a managed cluster to a cluster set
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// Resources carrying this label are not cleaned up by the registration
/// deletion controller; some other owner is responsible for them.
pub const DELETE_BY_OTHER_LABEL: &str = "cluster.open-cluster-management.io/delete-by-other";

/// Label prefix reflecting per-addon health on the managed cluster object
pub const ADDON_FEATURE_LABEL_PREFIX: &str = "feature.open-cluster-management.io/addon-";

/// Finalizer blocking managed cluster deletion until dependents are cleaned up
pub const CLUSTER_FINALIZER: &str = "cluster.open-cluster-management.io/api-resource-cleanup";

/// API group used in SubjectAccessReviews for registration permissions
pub const REGISTRATION_API_GROUP: &str = "register.open-cluster-management.io";

/// Organization prefix for identities issued to managed clusters
pub const SUBJECT_PREFIX: &str = "open-cluster-management:";

/// Legacy organization shared by all managed cluster identities
pub const MANAGED_CLUSTERS_GROUP: &str = "open-cluster-management:managedclusters";

/// Default lease duration for managed clusters, in seconds
pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 60;

/// A lease is considered expired this many durations after its last renewal
pub const LEASE_GRACE_MULTIPLIER: i32 = 5;

/// Default namespace for addon agents on the managed cluster
pub const DEFAULT_ADDON_INSTALL_NAMESPACE: &str = "open-cluster-management-agent-addon";

/// Annotation marking an addon agent as running outside the managed cluster
pub const ADDON_HOSTED_MODE_ANNOTATION: &str = "addon.open-cluster-management.io/hosted-mode";

/// Annotation placed on addon install namespaces created by the agent
pub const ADDON_NAMESPACE_ANNOTATION: &str = "addon.open-cluster-management.io/namespace";
