//! Spoke agent lifecycle
//!
//! Bootstraps against the hub when no usable credential exists, then runs the
//! steady-state controllers: certificate rotation, cluster join and status,
//! lease publication, and (behind the AddonManagement gate) the addon
//! managers. Every child task hangs off one cancellation tree; agent
//! shutdown cancels the root.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use registration_common::features::{Feature, FeatureGates};
use registration_common::{Error, Result, CLUSTER_NAME_LABEL, KUBE_APISERVER_CLIENT_SIGNER};
use registration_pki::Subject;

use crate::addon::{
    AddonLeaseSupervisor, AddonManagementController, AddonNamespaceManager,
    AddonRegistrationManager,
};
use crate::bootstrap::{credentials_valid, kubeconfig_endpoint, BootstrapDriver};
use crate::hub_secret::{
    mirror_to_dir, HubCredentials, HubSecretStore, AGENT_NAME_KEY, CLUSTER_NAME_KEY,
    KUBECONFIG_KEY,
};
use crate::join::JoinController;
use crate::lease::LeasePublisher;
use crate::rotation::{ClientCertRotator, NoopReporter, RotatorOptions};

/// Default namespace for the agent's own resources
const DEFAULT_AGENT_NAMESPACE: &str = "open-cluster-management-agent";

/// In-cluster CA bundle path
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Options for the spoke agent
#[derive(Clone, Debug)]
pub struct SpokeAgentOptions {
    /// Name of the managed cluster this agent represents
    pub cluster_name: String,
    /// Agent name override; generated and persisted when unset
    pub agent_name: Option<String>,
    /// Bootstrap kubeconfig path; required until a valid credential exists
    pub bootstrap_kubeconfig: Option<PathBuf>,
    /// Name of the hub kubeconfig secret
    pub hub_kubeconfig_secret: String,
    /// Directory the hub kubeconfig contents are mirrored into
    pub hub_kubeconfig_dir: Option<PathBuf>,
    /// Kubeconfig of the managed cluster; when set the agent runs detached
    pub spoke_kubeconfig: Option<PathBuf>,
    /// Period of the cluster health/status sync
    pub cluster_healthcheck_period: Duration,
    /// External apiserver URLs published in the cluster's client configs
    pub spoke_external_server_urls: Vec<String>,
    /// Bound on custom cluster claims
    pub max_custom_cluster_claims: usize,
    /// Feature gates
    pub feature_gates: FeatureGates,
}

/// Run the agent until cancelled. A bootstrap failure is fatal.
pub async fn run(options: SpokeAgentOptions, cancel: CancellationToken) -> Result<()> {
    if options.cluster_name.is_empty() {
        return Err(Error::configuration("cluster name must not be empty"));
    }

    // the management cluster is wherever this agent runs
    let management_client = Client::try_default()
        .await
        .map_err(|source| Error::Kube { source })?;
    let spoke_client = match &options.spoke_kubeconfig {
        Some(path) => {
            info!(kubeconfig = %path.display(), "running detached from the managed cluster");
            client_from_kubeconfig(path).await?
        }
        None => management_client.clone(),
    };

    let agent_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_AGENT_NAMESPACE.to_string());
    let store = HubSecretStore::new(
        management_client.clone(),
        &agent_namespace,
        &options.hub_kubeconfig_secret,
    );

    let existing = store.read().await?;
    let agent_name = options
        .agent_name
        .clone()
        .or_else(|| existing.as_ref().map(|c| c.agent_name.clone()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let subject = Subject::for_cluster(&options.cluster_name, &agent_name);
    let use_beta_csr = options
        .feature_gates
        .enabled(Feature::V1beta1CSRAPICompatibility);

    let spoke_ca_bundle = spoke_ca_bundle(&options)?;

    let credentials = match existing
        .filter(|c| credentials_valid(c, &options.cluster_name, &subject, Utc::now()))
    {
        Some(credentials) => credentials,
        None => {
            let bootstrap_path = options.bootstrap_kubeconfig.as_ref().ok_or_else(|| {
                Error::configuration(
                    "no usable hub credential and no bootstrap kubeconfig provided",
                )
            })?;
            let endpoint = kubeconfig_endpoint(bootstrap_path)?;
            let driver = BootstrapDriver {
                bootstrap_client: client_from_kubeconfig(bootstrap_path).await?,
                secret_client: management_client.clone(),
                secret_namespace: agent_namespace.clone(),
                secret_name: options.hub_kubeconfig_secret.clone(),
                cluster_name: options.cluster_name.clone(),
                agent_name: agent_name.clone(),
                hub_server: endpoint.server,
                hub_ca: endpoint.ca_data,
                external_server_urls: options.spoke_external_server_urls.clone(),
                spoke_ca_bundle: spoke_ca_bundle.clone(),
                use_beta_csr,
            };
            driver.bootstrap(cancel.clone()).await?
        }
    };

    if let Some(dir) = &options.hub_kubeconfig_dir {
        mirror_to_dir(&credentials, dir)?;
    }

    let hub_client = hub_client_from_credentials(&credentials).await?;
    info!(cluster = %options.cluster_name, agent = %agent_name, "connected to hub with cluster-scoped credential");

    // steady-state rotation keeps the same secret current forever
    let mut csr_labels = BTreeMap::new();
    csr_labels.insert(CLUSTER_NAME_LABEL.to_string(), options.cluster_name.clone());
    let mut additional_secret_data = BTreeMap::new();
    additional_secret_data.insert(KUBECONFIG_KEY.to_string(), credentials.kubeconfig.clone());
    additional_secret_data.insert(
        CLUSTER_NAME_KEY.to_string(),
        options.cluster_name.clone().into_bytes(),
    );
    additional_secret_data.insert(AGENT_NAME_KEY.to_string(), agent_name.clone().into_bytes());

    let rotator = ClientCertRotator::new(
        hub_client.clone(),
        management_client.clone(),
        RotatorOptions {
            subject,
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            dns_names: vec![],
            csr_name_prefix: format!("{}-", options.cluster_name),
            csr_labels,
            additional_secret_data,
            secret_namespace: agent_namespace.clone(),
            secret_name: options.hub_kubeconfig_secret.clone(),
            use_beta_csr,
        },
        Box::new(NoopReporter),
    );

    let join = JoinController {
        hub_client: hub_client.clone(),
        spoke_client: spoke_client.clone(),
        cluster_name: options.cluster_name.clone(),
        external_server_urls: options.spoke_external_server_urls.clone(),
        spoke_ca_bundle,
        claims_enabled: options.feature_gates.enabled(Feature::ClusterClaim),
        max_custom_cluster_claims: options.max_custom_cluster_claims,
        healthcheck_period: options.cluster_healthcheck_period,
    };

    let addons_enabled = options.feature_gates.enabled(Feature::AddonManagement);
    let lease_publisher = LeasePublisher {
        hub_client: hub_client.clone(),
        managed_client: spoke_client.clone(),
        management_client: management_client.clone(),
        cluster_name: options.cluster_name.clone(),
        lease_duration_seconds: registration_common::DEFAULT_LEASE_DURATION_SECONDS,
        addons_enabled,
    };

    let mut tasks = vec![
        tokio::spawn(rotator.run(cancel.child_token())),
        tokio::spawn(join.run(cancel.child_token())),
        tokio::spawn(lease_publisher.run(cancel.child_token())),
    ];

    if addons_enabled {
        let management = AddonManagementController {
            hub_client: hub_client.clone(),
            cluster_name: options.cluster_name.clone(),
            managers: vec![
                Box::new(AddonRegistrationManager::new(
                    hub_client.clone(),
                    spoke_client.clone(),
                    management_client.clone(),
                    options.cluster_name.clone(),
                    agent_name.clone(),
                    credentials.kubeconfig.clone(),
                    use_beta_csr,
                )),
                Box::new(AddonLeaseSupervisor::new(
                    hub_client.clone(),
                    spoke_client.clone(),
                    management_client.clone(),
                    options.cluster_name.clone(),
                )),
                Box::new(AddonNamespaceManager::new(
                    hub_client.clone(),
                    spoke_client.clone(),
                    options.cluster_name.clone(),
                )),
            ],
        };
        tasks.push(tokio::spawn(management.run(cancel.child_token())));
    }

    cancel.cancelled().await;
    info!(cluster = %options.cluster_name, "agent shutting down");
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn client_from_kubeconfig(path: &std::path::Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::configuration(format!("failed to read kubeconfig {}: {e}", path.display())))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::configuration(format!("failed to load kubeconfig {}: {e}", path.display())))?;
    Client::try_from(config).map_err(|source| Error::Kube { source })
}

/// Build a hub client from the stored credential: server and CA come from the
/// persisted kubeconfig, the certificate pair is inlined so no file paths
/// need to resolve.
async fn hub_client_from_credentials(credentials: &HubCredentials) -> Result<Client> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let stored: serde_json::Value = serde_json::from_slice(&credentials.kubeconfig)
        .map_err(|e| Error::serialization(format!("stored kubeconfig is invalid: {e}")))?;
    let cluster = &stored["clusters"][0]["cluster"];
    let server = cluster["server"]
        .as_str()
        .ok_or_else(|| Error::serialization("stored kubeconfig has no server"))?;

    let mut cluster_entry = json!({ "server": server });
    if let Some(ca) = cluster["certificate-authority-data"].as_str() {
        cluster_entry["certificate-authority-data"] = json!(ca);
    } else {
        cluster_entry["insecure-skip-tls-verify"] = json!(true);
    }

    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "hub", "cluster": cluster_entry }],
        "users": [{
            "name": "agent",
            "user": {
                "client-certificate-data": STANDARD.encode(&credentials.tls_cert),
                "client-key-data": STANDARD.encode(&credentials.tls_key),
            }
        }],
        "contexts": [{ "name": "agent", "context": { "cluster": "hub", "user": "agent" } }],
        "current-context": "agent",
    }))
    .map_err(|e| Error::serialization(format!("failed to build hub kubeconfig: {e}")))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::configuration(format!("failed to load hub kubeconfig: {e}")))?;
    Client::try_from(config).map_err(|source| Error::Kube { source })
}

/// The CA bundle published with the spoke's external URLs: the spoke
/// kubeconfig's CA in detached mode, the service account CA otherwise.
fn spoke_ca_bundle(options: &SpokeAgentOptions) -> Result<Option<Vec<u8>>> {
    if let Some(path) = &options.spoke_kubeconfig {
        return Ok(kubeconfig_endpoint(path)?.ca_data);
    }
    Ok(std::fs::read(SERVICE_ACCOUNT_CA).ok())
}
