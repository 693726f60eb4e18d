//! Hub kubeconfig secret
//!
//! The only state the spoke persists: an opaque secret holding the hub
//! kubeconfig, the cluster and agent names, and the current client
//! certificate pair. Rotations replace the whole secret in one write, and the
//! agent mirrors the contents to a directory so the kubeconfig's relative
//! cert paths resolve.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;

use registration_common::{Error, Result};

/// Secret key holding the rendered hub kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Secret key holding the cluster name
pub const CLUSTER_NAME_KEY: &str = "cluster-name";
/// Secret key holding the stable agent name
pub const AGENT_NAME_KEY: &str = "agent-name";
/// Secret key holding the client certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the client private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// Contents of the hub kubeconfig secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HubCredentials {
    /// Rendered kubeconfig for the hub connection
    pub kubeconfig: Vec<u8>,
    /// Cluster name the credential is scoped to
    pub cluster_name: String,
    /// Stable random agent name, persisted on first bootstrap
    pub agent_name: String,
    /// PEM client certificate chain
    pub tls_cert: Vec<u8>,
    /// PEM client private key
    pub tls_key: Vec<u8>,
}

impl HubCredentials {
    /// Parse credentials from secret data; None if any key is missing
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let get = |key: &str| data.get(key).map(|v| v.0.clone());
        Some(Self {
            kubeconfig: get(KUBECONFIG_KEY)?,
            cluster_name: String::from_utf8(get(CLUSTER_NAME_KEY)?).ok()?,
            agent_name: String::from_utf8(get(AGENT_NAME_KEY)?).ok()?,
            tls_cert: get(TLS_CERT_KEY)?,
            tls_key: get(TLS_KEY_KEY)?,
        })
    }

    /// Serialize credentials into secret data
    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        let mut data = BTreeMap::new();
        data.insert(KUBECONFIG_KEY.to_string(), ByteString(self.kubeconfig.clone()));
        data.insert(
            CLUSTER_NAME_KEY.to_string(),
            ByteString(self.cluster_name.clone().into_bytes()),
        );
        data.insert(
            AGENT_NAME_KEY.to_string(),
            ByteString(self.agent_name.clone().into_bytes()),
        );
        data.insert(TLS_CERT_KEY.to_string(), ByteString(self.tls_cert.clone()));
        data.insert(TLS_KEY_KEY.to_string(), ByteString(self.tls_key.clone()));
        data
    }
}

/// Reader/writer for the hub kubeconfig secret
#[derive(Clone)]
pub struct HubSecretStore {
    client: Client,
    namespace: String,
    name: String,
}

impl HubSecretStore {
    /// Create a store for the given secret
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Read the current credentials, if the secret exists and is complete
    pub async fn read(&self) -> Result<Option<HubCredentials>> {
        let secret = self
            .api()
            .get_opt(&self.name)
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(secret.as_ref().and_then(HubCredentials::from_secret))
    }

    /// Write credentials, replacing the whole secret in a single request
    pub async fn write(&self, credentials: &HubCredentials) -> Result<()> {
        let api = self.api();
        let existing = api
            .get_opt(&self.name)
            .await
            .map_err(|source| Error::Kube { source })?;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: existing
                    .as_ref()
                    .and_then(|s| s.metadata.resource_version.clone()),
                ..Default::default()
            },
            data: Some(credentials.to_secret_data()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        match existing {
            Some(_) => {
                api.replace(&self.name, &PostParams::default(), &secret)
                    .await
                    .map_err(|source| Error::Kube { source })?;
            }
            None => {
                api.create(&PostParams::default(), &secret)
                    .await
                    .map_err(|source| Error::Kube { source })?;
            }
        }
        Ok(())
    }
}

/// Mirror credentials into a directory, so the kubeconfig's relative
/// certificate paths resolve for clients built from files.
pub fn mirror_to_dir(credentials: &HubCredentials, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::configuration(format!("failed to create {}: {e}", dir.display())))?;
    let write = |file: &str, contents: &[u8]| {
        std::fs::write(dir.join(file), contents)
            .map_err(|e| Error::configuration(format!("failed to write {file}: {e}")))
    };
    write(KUBECONFIG_KEY, &credentials.kubeconfig)?;
    write(TLS_CERT_KEY, &credentials.tls_cert)?;
    write(TLS_KEY_KEY, &credentials.tls_key)?;
    write(CLUSTER_NAME_KEY, credentials.cluster_name.as_bytes())?;
    write(AGENT_NAME_KEY, credentials.agent_name.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> HubCredentials {
        HubCredentials {
            kubeconfig: b"apiVersion: v1".to_vec(),
            cluster_name: "cluster1".to_string(),
            agent_name: "agent-abc".to_string(),
            tls_cert: b"CERT".to_vec(),
            tls_key: b"KEY".to_vec(),
        }
    }

    #[test]
    fn secret_data_round_trips() {
        let original = credentials();
        let secret = Secret {
            data: Some(original.to_secret_data()),
            ..Default::default()
        };
        let parsed = HubCredentials::from_secret(&secret).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn incomplete_secret_is_rejected() {
        let mut data = credentials().to_secret_data();
        data.remove(TLS_KEY_KEY);
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        assert!(HubCredentials::from_secret(&secret).is_none());
        assert!(HubCredentials::from_secret(&Secret::default()).is_none());
    }

    #[test]
    fn mirror_writes_all_files() {
        let dir = std::env::temp_dir().join(format!("hub-kubeconfig-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        mirror_to_dir(&credentials(), &dir).unwrap();

        assert_eq!(std::fs::read(dir.join("kubeconfig")).unwrap(), b"apiVersion: v1");
        assert_eq!(std::fs::read(dir.join("tls.crt")).unwrap(), b"CERT");
        assert_eq!(std::fs::read(dir.join("tls.key")).unwrap(), b"KEY");
        assert_eq!(
            std::fs::read_to_string(dir.join("cluster-name")).unwrap(),
            "cluster1"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
