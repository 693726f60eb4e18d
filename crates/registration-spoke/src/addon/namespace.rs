//! Addon install namespace upkeep
//!
//! Ensures each addon's install namespace exists on the managed cluster and
//! carries the addon-namespace annotation. When an addon goes away its
//! namespace is removed, unless another live addon still installs into it.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::info;

use registration_common::crd::ManagedClusterAddOn;
use registration_common::{Error, Result, ADDON_NAMESPACE_ANNOTATION};

use super::AddonControllerManager;

/// Keeps addon install namespaces present and annotated
pub struct AddonNamespaceManager {
    /// Hub client, used to check for other addons sharing a namespace
    pub hub_client: Client,
    /// Managed cluster client owning the namespaces
    pub managed_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,

    // last observed install namespace per addon, for cleanup after deletion
    install_namespaces: HashMap<String, String>,
}

impl AddonNamespaceManager {
    /// Create an empty manager
    pub fn new(hub_client: Client, managed_client: Client, cluster_name: String) -> Self {
        Self {
            hub_client,
            managed_client,
            cluster_name,
            install_namespaces: HashMap::new(),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.managed_client.clone());
        let desired = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                annotations: Some(
                    [(ADDON_NAMESPACE_ANNOTATION.to_string(), "true".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces
            .patch(
                namespace,
                &PatchParams::apply("registration-agent").force(),
                &Patch::Apply(&desired),
            )
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(())
    }

    /// Whether another live addon installs into the same namespace
    async fn namespace_shared(&self, addon_name: &str, namespace: &str) -> Result<bool> {
        let addons: Api<ManagedClusterAddOn> =
            Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        let addon_list = addons
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(addon_list.items.iter().any(|a| {
            a.metadata.name.as_deref() != Some(addon_name)
                && a.metadata.deletion_timestamp.is_none()
                && a.install_namespace() == namespace
        }))
    }

    async fn remove_namespace(&self, addon_name: &str, namespace: &str) -> Result<()> {
        if self.namespace_shared(addon_name, namespace).await? {
            return Ok(());
        }
        let namespaces: Api<Namespace> = Api::all(self.managed_client.clone());
        match namespaces.delete(namespace, &Default::default()).await {
            Ok(_) => {
                info!(namespace = %namespace, "removed addon install namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(source) => Err(Error::Kube { source }),
        }
    }
}

#[async_trait]
impl AddonControllerManager for AddonNamespaceManager {
    async fn run_controllers(&mut self, addon: &ManagedClusterAddOn) -> Result<()> {
        let Some(addon_name) = addon.metadata.name.clone() else {
            return Ok(());
        };
        // hosted addons install on the management cluster; their namespaces
        // are not owned here
        if addon.runs_outside_managed_cluster() {
            return Ok(());
        }
        let namespace = addon.install_namespace().to_string();

        if addon.metadata.deletion_timestamp.is_some() {
            self.remove_namespace(&addon_name, &namespace).await?;
            self.install_namespaces.remove(&addon_name);
            return Ok(());
        }

        self.ensure_namespace(&namespace).await?;
        self.install_namespaces.insert(addon_name, namespace);
        Ok(())
    }

    async fn stop_controllers(&mut self, addon_name: &str) -> Result<()> {
        if let Some(namespace) = self.install_namespaces.remove(addon_name) {
            self.remove_namespace(addon_name, &namespace).await?;
        }
        Ok(())
    }

    fn known_addons(&self) -> Vec<String> {
        self.install_namespaces.keys().cloned().collect()
    }
}
