//! Bootstrap driver
//!
//! First contact with the hub uses a weak bootstrap credential: the driver
//! opens the initial CSR under the bootstrap identity, waits for an admin to
//! approve it, and persists the resulting hub kubeconfig secret. From then on
//! the agent talks to the hub with its own cluster-scoped certificate.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use registration_common::crd::{ManagedCluster, ManagedClusterSpec};
use registration_common::{Error, Result, CLUSTER_NAME_LABEL, KUBE_APISERVER_CLIENT_SIGNER};
use registration_pki::{render_kubeconfig, CertificateInfo, Subject};

use crate::hub_secret::{
    HubCredentials, HubSecretStore, AGENT_NAME_KEY, CLUSTER_NAME_KEY, KUBECONFIG_KEY,
};
use crate::rotation::{ClientCertRotator, NoopReporter, RotatorOptions};

const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Server endpoint and CA read from a kubeconfig file
#[derive(Debug)]
pub struct KubeconfigEndpoint {
    /// API server URL
    pub server: String,
    /// CA bundle, when the kubeconfig carries one
    pub ca_data: Option<Vec<u8>>,
}

/// Extract the server endpoint of the current (or first) cluster in a
/// kubeconfig file.
pub fn kubeconfig_endpoint(path: &Path) -> Result<KubeconfigEndpoint> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let kubeconfig = kube::config::Kubeconfig::read_from(path)
        .map_err(|e| Error::configuration(format!("failed to read kubeconfig {}: {e}", path.display())))?;

    let named = kubeconfig
        .clusters
        .first()
        .ok_or_else(|| Error::configuration(format!("kubeconfig {} has no clusters", path.display())))?;
    let cluster = named
        .cluster
        .as_ref()
        .ok_or_else(|| Error::configuration("kubeconfig cluster entry is empty"))?;
    let server = cluster
        .server
        .clone()
        .ok_or_else(|| Error::configuration("kubeconfig cluster has no server"))?;

    let ca_data = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
        (Some(data), _) => Some(
            STANDARD
                .decode(data)
                .map_err(|e| Error::configuration(format!("invalid CA data in kubeconfig: {e}")))?,
        ),
        (None, Some(file)) => Some(std::fs::read(file).map_err(|e| {
            Error::configuration(format!("failed to read CA file {file}: {e}"))
        })?),
        (None, None) => None,
    };

    Ok(KubeconfigEndpoint { server, ca_data })
}

/// Whether stored credentials are usable for this cluster identity
pub fn credentials_valid(
    credentials: &HubCredentials,
    cluster_name: &str,
    subject: &Subject,
    now: chrono::DateTime<Utc>,
) -> bool {
    if credentials.cluster_name != cluster_name {
        return false;
    }
    match CertificateInfo::from_pem(&credentials.tls_cert) {
        Ok(info) => info.matches_subject(subject) && !info.is_expired(now),
        Err(_) => false,
    }
}

/// Drives the initial CSR exchange with the bootstrap credential
pub struct BootstrapDriver {
    /// Client built from the bootstrap kubeconfig
    pub bootstrap_client: Client,
    /// Client owning the hub kubeconfig secret (the agent's own cluster)
    pub secret_client: Client,
    /// Namespace of the hub kubeconfig secret
    pub secret_namespace: String,
    /// Name of the hub kubeconfig secret
    pub secret_name: String,
    /// Name of this managed cluster
    pub cluster_name: String,
    /// Stable agent name
    pub agent_name: String,
    /// Hub API server URL, from the bootstrap kubeconfig
    pub hub_server: String,
    /// Hub CA bundle, from the bootstrap kubeconfig
    pub hub_ca: Option<Vec<u8>>,
    /// External apiserver URLs published on the created cluster
    pub external_server_urls: Vec<String>,
    /// CA bundle published alongside the external URLs
    pub spoke_ca_bundle: Option<Vec<u8>>,
    /// Issue CSRs against the legacy beta endpoint
    pub use_beta_csr: bool,
}

impl BootstrapDriver {
    /// Run the bootstrap flow until the hub kubeconfig secret is populated
    /// with a usable certificate, or the agent is cancelled.
    pub async fn bootstrap(&self, cancel: CancellationToken) -> Result<HubCredentials> {
        let subject = Subject::for_cluster(&self.cluster_name, &self.agent_name);
        let store = HubSecretStore::new(
            self.secret_client.clone(),
            &self.secret_namespace,
            &self.secret_name,
        );

        if let Some(credentials) = store.read().await? {
            if credentials_valid(&credentials, &self.cluster_name, &subject, Utc::now()) {
                debug!(cluster = %self.cluster_name, "existing hub credentials are valid, skipping bootstrap");
                return Ok(credentials);
            }
        }

        info!(cluster = %self.cluster_name, hub = %self.hub_server, "bootstrapping against hub");

        let kubeconfig = render_kubeconfig(
            &self.hub_server,
            self.hub_ca.as_deref(),
            "tls.crt",
            "tls.key",
        )
        .map_err(|e| Error::certificate(self.cluster_name.clone(), e.to_string()))?;

        let mut additional_secret_data = BTreeMap::new();
        additional_secret_data.insert(KUBECONFIG_KEY.to_string(), kubeconfig.into_bytes());
        additional_secret_data.insert(
            CLUSTER_NAME_KEY.to_string(),
            self.cluster_name.clone().into_bytes(),
        );
        additional_secret_data.insert(
            AGENT_NAME_KEY.to_string(),
            self.agent_name.clone().into_bytes(),
        );

        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_NAME_LABEL.to_string(), self.cluster_name.clone());

        let mut rotator = ClientCertRotator::new(
            self.bootstrap_client.clone(),
            self.secret_client.clone(),
            RotatorOptions {
                subject: subject.clone(),
                signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
                dns_names: vec![],
                csr_name_prefix: format!("{}-", self.cluster_name),
                csr_labels: labels,
                additional_secret_data,
                secret_namespace: self.secret_namespace.clone(),
                secret_name: self.secret_name.clone(),
                use_beta_csr: self.use_beta_csr,
            },
            Box::new(NoopReporter),
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::configuration("bootstrap cancelled before completion"));
            }

            // the cluster object goes up with the bootstrap identity so the
            // hub admin can accept it while the CSR is still pending
            if let Err(e) = self.ensure_cluster_exists().await {
                debug!(cluster = %self.cluster_name, error = %e, "failed to create managed cluster");
            }

            if let Err(e) = rotator.sync().await {
                debug!(cluster = %self.cluster_name, error = %e, "bootstrap csr not ready");
            }

            if let Some(credentials) = store.read().await? {
                if credentials_valid(&credentials, &self.cluster_name, &subject, Utc::now()) {
                    info!(cluster = %self.cluster_name, "bootstrap complete, hub credentials persisted");
                    return Ok(credentials);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::configuration("bootstrap cancelled before completion"));
                }
                _ = tokio::time::sleep(BOOTSTRAP_POLL_INTERVAL) => {}
            }
        }
    }

    async fn ensure_cluster_exists(&self) -> Result<()> {
        let api: Api<ManagedCluster> = Api::all(self.bootstrap_client.clone());
        if api
            .get_opt(&self.cluster_name)
            .await
            .map_err(|source| Error::Kube { source })?
            .is_some()
        {
            return Ok(());
        }

        let cluster = ManagedCluster {
            metadata: ObjectMeta {
                name: Some(self.cluster_name.clone()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                managed_cluster_client_configs: crate::join::desired_client_configs(
                    &self.external_server_urls,
                    self.spoke_ca_bundle.as_deref(),
                ),
                ..Default::default()
            },
            status: None,
        };
        match api.create(&PostParams::default(), &cluster).await {
            Ok(_) => {
                info!(cluster = %self.cluster_name, "created managed cluster on hub");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(source) => Err(Error::Kube { source }),
        }
    }
}
