//! Custom resource definitions for the registration control plane

mod addon;
mod claim;
mod cluster;
mod clusterset;
mod manifestwork;

pub use addon::{
    AddOnHealthCheck, AddOnRegistration, AddOnSubject, HealthCheckMode, ManagedClusterAddOn,
    ManagedClusterAddOnSpec, ManagedClusterAddOnStatus, ADDON_CONDITION_AVAILABLE,
    ADDON_STATUS_AVAILABLE, ADDON_STATUS_UNHEALTHY, ADDON_STATUS_UNREACHABLE,
};
pub use claim::{ClusterClaim, ClusterClaimSpec};
pub use cluster::{
    add_taint, remove_taint, ClientConfig, ManagedCluster, ManagedClusterClaim,
    ManagedClusterSpec, ManagedClusterStatus, ManagedClusterVersion, Taint, TaintEffect,
    CONDITION_AVAILABLE, CONDITION_DELETE_SUCCESS, CONDITION_HUB_ACCEPTED, CONDITION_JOINED,
    TAINT_UNAVAILABLE, TAINT_UNREACHABLE,
};
pub use clusterset::{
    ClusterSelector, ExclusiveLabel, ManagedClusterSet, ManagedClusterSetSpec,
    ManagedClusterSetStatus, SELECTOR_TYPE_EXCLUSIVE_LABEL,
};
pub use manifestwork::{ManifestWork, ManifestWorkSpec, ManifestWorkStatus};
