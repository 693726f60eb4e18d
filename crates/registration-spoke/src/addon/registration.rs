//! Per-addon client certificate registration
//!
//! Each addon declares registrations (signer + subject) in its status; every
//! registration gets an isolated certificate rotator keyed by a content hash
//! of its config. Hash churn stops the old rotator and deletes its secret
//! before a replacement starts.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use registration_common::conditions::set_condition;
use registration_common::crd::ManagedClusterAddOn;
use registration_common::patch::status_conditions_patch;
use registration_common::{
    Error, Result, ADDON_NAME_LABEL, CLUSTER_NAME_LABEL, KUBE_APISERVER_CLIENT_SIGNER,
    SUBJECT_PREFIX,
};
use registration_pki::Subject;

use super::AddonControllerManager;
use crate::rotation::{ClientCertRotator, RotatorOptions, StatusReporter};

/// One registration an addon declared
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationConfig {
    /// Owning addon
    pub addon_name: String,
    /// Namespace the credential secret lands in
    pub install_namespace: String,
    /// Signer passed through verbatim
    pub signer_name: String,
    /// Requested identity
    pub subject: Subject,
    /// Whether the addon agent runs outside the managed cluster
    pub hosted: bool,
}

impl RegistrationConfig {
    /// Content hash identifying this config
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.addon_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.install_namespace.as_bytes());
        hasher.update([0]);
        hasher.update(self.signer_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.subject.common_name.as_bytes());
        for org in &self.subject.organizations {
            hasher.update([0]);
            hasher.update(org.as_bytes());
        }
        for unit in &self.subject.organization_units {
            hasher.update([1]);
            hasher.update(unit.as_bytes());
        }
        hasher.update([if self.hosted { 1 } else { 0 }]);
        format!("{:x}", hasher.finalize())
    }

    /// Name of the maintained credential secret
    pub fn secret_name(&self) -> String {
        format!(
            "{}-{}-client-cert",
            self.addon_name,
            self.signer_name.replace('/', "-")
        )
    }
}

/// Derive the registration configs an addon currently declares
pub fn registration_configs(
    addon: &ManagedClusterAddOn,
    cluster_name: &str,
    agent_name: &str,
) -> HashMap<String, RegistrationConfig> {
    let Some(addon_name) = addon.metadata.name.clone() else {
        return HashMap::new();
    };
    let hosted = addon.runs_outside_managed_cluster();
    let install_namespace = addon.install_namespace().to_string();

    let mut configs = HashMap::new();
    for registration in addon
        .status
        .iter()
        .flat_map(|s| s.registrations.iter())
    {
        let subject = match &registration.subject {
            Some(subject) if !subject.user.is_empty() => Subject {
                common_name: subject.user.clone(),
                organizations: subject.groups.clone(),
                organization_units: subject.organization_units.clone(),
            },
            _ => default_addon_subject(cluster_name, &addon_name, agent_name),
        };
        let config = RegistrationConfig {
            addon_name: addon_name.clone(),
            install_namespace: install_namespace.clone(),
            signer_name: registration.signer_name.clone(),
            subject,
            hosted,
        };
        configs.insert(config.hash(), config);
    }
    configs
}

fn default_addon_subject(cluster_name: &str, addon_name: &str, agent_name: &str) -> Subject {
    Subject {
        common_name: format!(
            "{SUBJECT_PREFIX}cluster:{cluster_name}:addon:{addon_name}:agent:{agent_name}"
        ),
        organizations: vec![format!(
            "{SUBJECT_PREFIX}cluster:{cluster_name}:addon:{addon_name}"
        )],
        organization_units: vec![],
    }
}

struct RotatorHandle {
    cancel: CancellationToken,
    config: RegistrationConfig,
}

/// Writes rotation conditions onto the owning addon
struct AddonStatusReporter {
    hub_client: Client,
    cluster_name: String,
    addon_name: String,
}

#[async_trait]
impl StatusReporter for AddonStatusReporter {
    async fn report(&self, condition: Condition) -> Result<()> {
        let api: Api<ManagedClusterAddOn> =
            Api::namespaced(self.hub_client.clone(), &self.cluster_name);
        let Some(addon) = api
            .get_opt(&self.addon_name)
            .await
            .map_err(|source| Error::Kube { source })?
        else {
            return Ok(());
        };

        let mut conditions = addon
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        if !set_condition(&mut conditions, condition) {
            return Ok(());
        }
        api.patch_status(
            &self.addon_name,
            &PatchParams::default(),
            &Patch::Merge(status_conditions_patch(&conditions)),
        )
        .await
        .map_err(|source| Error::Kube { source })?;
        Ok(())
    }
}

/// Multiplexes one certificate rotator per addon registration config
pub struct AddonRegistrationManager {
    /// Hub client for CSRs and addon status
    pub hub_client: Client,
    /// Secret plane for addons running on the managed cluster
    pub managed_client: Client,
    /// Secret plane for hosted addons
    pub management_client: Client,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// Stable agent name
    pub agent_name: String,
    /// Hub kubeconfig bytes handed to kube-apiserver-client registrations
    pub hub_kubeconfig: Vec<u8>,
    /// Issue CSRs against the legacy beta endpoint
    pub use_beta_csr: bool,

    rotators: HashMap<String, HashMap<String, RotatorHandle>>,
}

impl AddonRegistrationManager {
    /// Create an empty manager
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub_client: Client,
        managed_client: Client,
        management_client: Client,
        cluster_name: String,
        agent_name: String,
        hub_kubeconfig: Vec<u8>,
        use_beta_csr: bool,
    ) -> Self {
        Self {
            hub_client,
            managed_client,
            management_client,
            cluster_name,
            agent_name,
            hub_kubeconfig,
            use_beta_csr,
            rotators: HashMap::new(),
        }
    }

    fn secret_client(&self, config: &RegistrationConfig) -> Client {
        if config.hosted {
            self.management_client.clone()
        } else {
            self.managed_client.clone()
        }
    }

    fn start_rotator(&self, config: &RegistrationConfig) -> CancellationToken {
        let mut csr_labels = BTreeMap::new();
        csr_labels.insert(CLUSTER_NAME_LABEL.to_string(), self.cluster_name.clone());
        csr_labels.insert(ADDON_NAME_LABEL.to_string(), config.addon_name.clone());

        let mut additional_secret_data = BTreeMap::new();
        if config.signer_name == KUBE_APISERVER_CLIENT_SIGNER {
            additional_secret_data
                .insert("kubeconfig".to_string(), self.hub_kubeconfig.clone());
        }

        let options = RotatorOptions {
            subject: config.subject.clone(),
            signer_name: config.signer_name.clone(),
            dns_names: vec![Subject::addon_dns_name(&config.addon_name)],
            csr_name_prefix: format!("addon-{}-{}-", self.cluster_name, config.addon_name),
            csr_labels,
            additional_secret_data,
            secret_namespace: config.install_namespace.clone(),
            secret_name: config.secret_name(),
            use_beta_csr: self.use_beta_csr,
        };

        let reporter = Box::new(AddonStatusReporter {
            hub_client: self.hub_client.clone(),
            cluster_name: self.cluster_name.clone(),
            addon_name: config.addon_name.clone(),
        });

        let rotator = ClientCertRotator::new(
            self.hub_client.clone(),
            self.secret_client(config),
            options,
            reporter,
        );
        let cancel = CancellationToken::new();
        tokio::spawn(rotator.run(cancel.clone()));
        cancel
    }

    async fn stop_rotator(&self, handle: &RotatorHandle) -> Result<()> {
        handle.cancel.cancel();
        let secrets: Api<Secret> = Api::namespaced(
            self.secret_client(&handle.config),
            &handle.config.install_namespace,
        );
        match secrets
            .delete(&handle.config.secret_name(), &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(source) => Err(Error::Kube { source }),
        }
    }
}

#[async_trait]
impl AddonControllerManager for AddonRegistrationManager {
    async fn run_controllers(&mut self, addon: &ManagedClusterAddOn) -> Result<()> {
        let Some(addon_name) = addon.metadata.name.clone() else {
            return Ok(());
        };
        if addon.metadata.deletion_timestamp.is_some() {
            return self.stop_controllers(&addon_name).await;
        }

        let configs = registration_configs(addon, &self.cluster_name, &self.agent_name);
        let cached = self.rotators.remove(&addon_name).unwrap_or_default();

        let mut synced: HashMap<String, RotatorHandle> = HashMap::new();
        for (hash, handle) in cached {
            if configs.contains_key(&hash) {
                synced.insert(hash, handle);
            } else {
                info!(addon = %addon_name, "stopping rotator for stale registration config");
                if let Err(e) = self.stop_rotator(&handle).await {
                    warn!(addon = %addon_name, error = %e, "failed to stop stale rotator");
                }
            }
        }

        for (hash, config) in configs {
            if synced.contains_key(&hash) {
                continue;
            }
            info!(addon = %addon_name, signer = %config.signer_name, "starting addon certificate rotator");
            let cancel = self.start_rotator(&config);
            synced.insert(hash, RotatorHandle { cancel, config });
        }

        if !synced.is_empty() {
            self.rotators.insert(addon_name, synced);
        }
        Ok(())
    }

    async fn stop_controllers(&mut self, addon_name: &str) -> Result<()> {
        let Some(handles) = self.rotators.remove(addon_name) else {
            return Ok(());
        };
        for handle in handles.values() {
            if let Err(e) = self.stop_rotator(handle).await {
                warn!(addon = %addon_name, error = %e, "failed to stop rotator");
            }
        }
        Ok(())
    }

    fn known_addons(&self) -> Vec<String> {
        self.rotators.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use registration_common::crd::{
        AddOnRegistration, AddOnSubject, ManagedClusterAddOnSpec, ManagedClusterAddOnStatus,
    };

    fn addon_with_registrations(registrations: Vec<AddOnRegistration>) -> ManagedClusterAddOn {
        ManagedClusterAddOn {
            metadata: ObjectMeta {
                name: Some("helloworld".to_string()),
                namespace: Some("cluster1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterAddOnSpec {
                install_namespace: "addon-ns".to_string(),
            },
            status: Some(ManagedClusterAddOnStatus {
                registrations,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn configs_key_by_content_hash() {
        let addon = addon_with_registrations(vec![AddOnRegistration {
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            subject: None,
        }]);
        let configs = registration_configs(&addon, "cluster1", "agent1");
        assert_eq!(configs.len(), 1);
        let (hash, config) = configs.iter().next().unwrap();
        assert_eq!(*hash, config.hash());
        assert_eq!(config.install_namespace, "addon-ns");
    }

    #[test]
    fn declared_subject_is_used_verbatim() {
        let addon = addon_with_registrations(vec![AddOnRegistration {
            signer_name: "example.com/signer".to_string(),
            subject: Some(AddOnSubject {
                user: "custom-user".to_string(),
                groups: vec!["group-a".to_string()],
                organization_units: vec!["unit".to_string()],
            }),
        }]);
        let configs = registration_configs(&addon, "cluster1", "agent1");
        let config = configs.values().next().unwrap();
        assert_eq!(config.subject.common_name, "custom-user");
        assert_eq!(config.subject.organizations, vec!["group-a".to_string()]);
    }

    #[test]
    fn missing_subject_falls_back_to_default_identity() {
        let addon = addon_with_registrations(vec![AddOnRegistration {
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            subject: None,
        }]);
        let configs = registration_configs(&addon, "cluster1", "agent1");
        let config = configs.values().next().unwrap();
        assert_eq!(
            config.subject.common_name,
            "open-cluster-management:cluster:cluster1:addon:helloworld:agent:agent1"
        );
    }

    #[test]
    fn hash_changes_with_signer_and_namespace() {
        let base = RegistrationConfig {
            addon_name: "helloworld".to_string(),
            install_namespace: "ns1".to_string(),
            signer_name: "signer-a".to_string(),
            subject: Subject {
                common_name: "cn".to_string(),
                organizations: vec![],
                organization_units: vec![],
            },
            hosted: false,
        };
        let mut other_signer = base.clone();
        other_signer.signer_name = "signer-b".to_string();
        let mut other_namespace = base.clone();
        other_namespace.install_namespace = "ns2".to_string();
        let mut hosted = base.clone();
        hosted.hosted = true;

        assert_ne!(base.hash(), other_signer.hash());
        assert_ne!(base.hash(), other_namespace.hash());
        assert_ne!(base.hash(), hosted.hash());
        assert_eq!(base.hash(), base.clone().hash());
    }

    #[test]
    fn secret_name_flattens_signer_path() {
        let addon = addon_with_registrations(vec![AddOnRegistration {
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            subject: None,
        }]);
        let configs = registration_configs(&addon, "cluster1", "agent1");
        let config = configs.values().next().unwrap();
        assert_eq!(
            config.secret_name(),
            "helloworld-kubernetes.io-kube-apiserver-client-client-cert"
        );
    }
}
