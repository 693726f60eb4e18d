//! Addon lease supervisor
//!
//! Keeps one lease-evaluation controller per addon, pointed at the plane
//! where the addon actually renews its lease. A location change
//! (managed ↔ management) cancels the current controller before starting its
//! replacement against the new lease source.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use registration_common::crd::ManagedClusterAddOn;
use registration_common::Result;

use super::{AddonControllerManager, AddonLeaseController};

/// Where an addon renews its lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseLocation {
    /// The cluster this agent represents
    ManagedCluster,
    /// The cluster this agent runs on (hosted addons)
    ManagementCluster,
}

fn lease_location(addon: &ManagedClusterAddOn) -> LeaseLocation {
    if addon.runs_outside_managed_cluster() {
        LeaseLocation::ManagementCluster
    } else {
        LeaseLocation::ManagedCluster
    }
}

struct SupervisedController {
    location: LeaseLocation,
    cancel: CancellationToken,
}

/// Supervises per-addon lease evaluation controllers
pub struct AddonLeaseSupervisor {
    /// Hub client for addon reads and status writes
    pub hub_client: Client,
    /// Lease source for addons on the managed cluster
    pub managed_client: Client,
    /// Lease source for hosted addons
    pub management_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,

    controllers: HashMap<String, SupervisedController>,
}

impl AddonLeaseSupervisor {
    /// Create an empty supervisor
    pub fn new(
        hub_client: Client,
        managed_client: Client,
        management_client: Client,
        cluster_name: String,
    ) -> Self {
        Self {
            hub_client,
            managed_client,
            management_client,
            cluster_name,
            controllers: HashMap::new(),
        }
    }

    fn start_controller(&self, addon_name: &str, location: LeaseLocation) -> CancellationToken {
        let lease_client = match location {
            LeaseLocation::ManagedCluster => self.managed_client.clone(),
            LeaseLocation::ManagementCluster => self.management_client.clone(),
        };
        let controller = AddonLeaseController {
            hub_client: self.hub_client.clone(),
            lease_client,
            cluster_name: self.cluster_name.clone(),
            addon_name: addon_name.to_string(),
        };
        let cancel = CancellationToken::new();
        tokio::spawn(controller.run(cancel.clone()));
        cancel
    }
}

#[async_trait]
impl AddonControllerManager for AddonLeaseSupervisor {
    async fn run_controllers(&mut self, addon: &ManagedClusterAddOn) -> Result<()> {
        let Some(addon_name) = addon.metadata.name.clone() else {
            return Ok(());
        };
        if addon.metadata.deletion_timestamp.is_some() {
            return self.stop_controllers(&addon_name).await;
        }

        let location = lease_location(addon);
        if let Some(current) = self.controllers.get(&addon_name) {
            if current.location == location {
                return Ok(());
            }
            // location changed: replace the controller against the new source
            info!(addon = %addon_name, ?location, "addon lease source moved, restarting evaluation");
            self.stop_controllers(&addon_name).await?;
        }

        let cancel = self.start_controller(&addon_name, location);
        self.controllers
            .insert(addon_name, SupervisedController { location, cancel });
        Ok(())
    }

    async fn stop_controllers(&mut self, addon_name: &str) -> Result<()> {
        if let Some(controller) = self.controllers.remove(addon_name) {
            controller.cancel.cancel();
        }
        Ok(())
    }

    fn known_addons(&self) -> Vec<String> {
        self.controllers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use registration_common::crd::ManagedClusterAddOnSpec;
    use registration_common::ADDON_HOSTED_MODE_ANNOTATION;

    fn addon(hosted: bool) -> ManagedClusterAddOn {
        let annotations = hosted.then(|| {
            [(ADDON_HOSTED_MODE_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect()
        });
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("helloworld".to_string()),
                namespace: Some("cluster1".to_string()),
                annotations,
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec::default(),
            status: None,
        }
    }

    #[test]
    fn location_follows_hosted_annotation() {
        assert_eq!(lease_location(&addon(false)), LeaseLocation::ManagedCluster);
        assert_eq!(lease_location(&addon(true)), LeaseLocation::ManagementCluster);
    }
}
