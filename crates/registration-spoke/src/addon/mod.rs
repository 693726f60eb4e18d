//! Addon lifecycle management on the spoke
//!
//! One management loop watches the cluster's ManagedClusterAddOns on the hub
//! and drives a set of per-addon managers: client-certificate registration,
//! lease supervision, and install-namespace upkeep. Each manager owns its
//! child tasks and cancels them deterministically when the addon's
//! configuration churns or the addon disappears.

mod lease;
mod namespace;
mod registration;
mod supervisor;

pub use lease::{evaluate_addon_lease, AddonLeaseController};
pub use namespace::AddonNamespaceManager;
pub use registration::{registration_configs, AddonRegistrationManager, RegistrationConfig};
pub use supervisor::AddonLeaseSupervisor;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use registration_common::crd::ManagedClusterAddOn;
use registration_common::{Error, Result};

/// Sync cadence of the addon management loop and its children
pub const ADDON_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Runs or stops one or more controllers per addon
#[async_trait]
pub trait AddonControllerManager: Send {
    /// Start or restart this manager's controllers for the addon
    async fn run_controllers(&mut self, addon: &ManagedClusterAddOn) -> Result<()>;
    /// Stop every controller started for the addon
    async fn stop_controllers(&mut self, addon_name: &str) -> Result<()>;
    /// Addons this manager currently tracks
    fn known_addons(&self) -> Vec<String>;
}

/// Dispatches addon changes to all registered managers
pub struct AddonManagementController {
    /// Hub client; addons live in the cluster namespace there
    pub hub_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// The supervised managers
    pub managers: Vec<Box<dyn AddonControllerManager>>,
}

impl AddonManagementController {
    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(ADDON_SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster = %self.cluster_name, "addon management controller stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(cluster = %self.cluster_name, error = %e, "addon management sync failed");
                    }
                }
            }
        }
    }

    async fn sync(&mut self) -> Result<()> {
        let addons: Api<ManagedClusterAddOn> =
            Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        let addon_list = addons
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::Kube { source })?;

        let mut present: BTreeSet<String> = BTreeSet::new();
        for addon in &addon_list.items {
            let Some(name) = addon.metadata.name.clone() else {
                continue;
            };
            present.insert(name.clone());
            for manager in &mut self.managers {
                if let Err(e) = manager.run_controllers(addon).await {
                    warn!(addon = %name, error = %e, "addon manager sync failed");
                }
            }
        }

        // stop controllers for addons that are gone
        let known: BTreeSet<String> = self
            .managers
            .iter()
            .flat_map(|m| m.known_addons())
            .collect();
        for name in known.difference(&present) {
            for manager in &mut self.managers {
                if let Err(e) = manager.stop_controllers(name).await {
                    warn!(addon = %name, error = %e, "failed to stop addon controllers");
                }
            }
        }
        Ok(())
    }
}
