//! Client certificate rotator
//!
//! Maintains a valid client certificate in a secret indefinitely. The state
//! machine per rotator:
//!
//! - **NoCert**: no usable certificate. Generate or reuse a private key,
//!   submit a CSR under the configured signer, move to Pending.
//! - **Pending**: a CSR is in flight. Approved + signed: validate the chain
//!   and subject, swap the secret in one write, back to steady state. Denied
//!   or failed: surface a condition, back off, retry with a fresh CSR.
//! - **Valid**: sleep until 80% of the leaf's lifetime is consumed, then
//!   renew reusing the current private key so the in-flight identity stays
//!   usable until approval.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::core::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use registration_common::conditions::{new_condition, FALSE, TRUE};
use registration_common::{Error, Result};
use registration_pki::{
    generate_key_pair, parse_cert_chain_pem, serialize_csr_pem, CertificateInfo, Subject,
};

use crate::hub_secret::{TLS_CERT_KEY, TLS_KEY_KEY};

/// Condition type written through the status reporter
pub const CONDITION_CERTIFICATE_ROTATED: &str = "ClusterCertificateRotated";

/// How often a rotator re-examines its state
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

const CSR_USAGES: &[&str] = &["digital signature", "key encipherment", "client auth"];

/// Receives certificate rotation conditions for the owning object
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Record the latest rotation condition; failures are logged by callers
    async fn report(&self, condition: Condition) -> Result<()>;
}

/// Reporter that drops conditions; used during bootstrap where no owning
/// object exists yet
pub struct NoopReporter;

#[async_trait]
impl StatusReporter for NoopReporter {
    async fn report(&self, _condition: Condition) -> Result<()> {
        Ok(())
    }
}

/// Options for one rotator instance
#[derive(Clone)]
pub struct RotatorOptions {
    /// Subject requested in every CSR
    pub subject: Subject,
    /// Signer name passed through verbatim
    pub signer_name: String,
    /// DNS SANs requested in the CSR
    pub dns_names: Vec<String>,
    /// Prefix for generated CSR names
    pub csr_name_prefix: String,
    /// Labels identifying cluster/addon on the CSR
    pub csr_labels: BTreeMap<String, String>,
    /// Extra data written into the secret on every rotation
    pub additional_secret_data: BTreeMap<String, Vec<u8>>,
    /// Namespace of the maintained secret
    pub secret_namespace: String,
    /// Name of the maintained secret
    pub secret_name: String,
    /// Post CSRs against the legacy v1beta1 endpoint
    pub use_beta_csr: bool,
}

/// What a sync observed about the in-flight CSR
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsrObservation {
    /// CSR no longer exists
    pub missing: bool,
    /// Approved condition present
    pub approved: bool,
    /// Denied or Failed condition present
    pub rejected: bool,
    /// Issued certificate, once populated
    pub certificate: Option<Vec<u8>>,
}

/// Client certificate rotator
pub struct ClientCertRotator {
    hub_client: Client,
    secret_client: Client,
    options: RotatorOptions,
    reporter: Box<dyn StatusReporter>,
    pending: Option<PendingCsr>,
}

struct PendingCsr {
    csr_name: String,
    key_pem: String,
}

impl ClientCertRotator {
    /// Create a rotator. `hub_client` talks to the CSR API; `secret_client`
    /// owns the plane where the secret lives.
    pub fn new(
        hub_client: Client,
        secret_client: Client,
        options: RotatorOptions,
        reporter: Box<dyn StatusReporter>,
    ) -> Self {
        Self {
            hub_client,
            secret_client,
            options,
            reporter,
            pending: None,
        }
    }

    /// Run until cancelled, syncing on a fixed interval with jittered backoff
    /// after failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(secret = %self.options.secret_name, "certificate rotator stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(secret = %self.options.secret_name, error = %e, "certificate rotation sync failed");
                        let jitter = rand::thread_rng().gen_range(0..5000);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                }
            }
        }
    }

    /// Drive the state machine one step
    pub async fn sync(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            return self.sync_pending(pending).await;
        }

        let secret = self.read_secret().await?;
        if let Some(cert) = secret.as_ref().and_then(|s| secret_value(s, TLS_CERT_KEY)) {
            if let Ok(info) = CertificateInfo::from_pem(&cert) {
                if info.matches_subject(&self.options.subject) && !info.needs_rotation(Utc::now()) {
                    // Valid: nothing to do until the threshold passes
                    return Ok(());
                }
            }
        }

        // NoCert: reuse the current key on renewal, generate otherwise
        let key_pem = match secret.as_ref().and_then(|s| secret_value(s, TLS_KEY_KEY)) {
            Some(existing) => match String::from_utf8(existing) {
                Ok(pem) if rcgen::KeyPair::from_pem(&pem).is_ok() => pem,
                _ => fresh_key_pem()?,
            },
            None => fresh_key_pem()?,
        };

        let csr_name = self.create_csr(&key_pem).await?;
        info!(csr = %csr_name, signer = %self.options.signer_name, "submitted certificate signing request");
        self.pending = Some(PendingCsr { csr_name, key_pem });
        Ok(())
    }

    async fn sync_pending(&mut self, pending: PendingCsr) -> Result<()> {
        let observation = self.observe_csr(&pending.csr_name).await?;

        if observation.missing || observation.rejected {
            let condition = new_condition(
                CONDITION_CERTIFICATE_ROTATED,
                FALSE,
                "ClientCertificateUpdateFailed",
                format!("certificate signing request {} was not approved", pending.csr_name),
            );
            if let Err(e) = self.reporter.report(condition).await {
                warn!(error = %e, "failed to report certificate condition");
            }
            // back to NoCert; the next sync opens a fresh CSR
            return Err(Error::certificate(
                self.options.secret_name.clone(),
                format!("csr {} denied, failed or removed", pending.csr_name),
            ));
        }

        let Some(certificate) = observation.certificate.filter(|_| observation.approved) else {
            // still pending; keep waiting
            self.pending = Some(pending);
            return Ok(());
        };

        // issued: the chain must parse and the leaf must carry our subject
        parse_cert_chain_pem(&certificate)
            .map_err(|e| Error::certificate(self.options.secret_name.clone(), e.to_string()))?;
        let info = CertificateInfo::from_pem(&certificate)
            .map_err(|e| Error::certificate(self.options.secret_name.clone(), e.to_string()))?;
        if !info.matches_subject(&self.options.subject) {
            return Err(Error::certificate(
                self.options.secret_name.clone(),
                format!(
                    "issued certificate subject {:?} does not match requested {:?}",
                    info.common_name, self.options.subject.common_name
                ),
            ));
        }

        self.write_secret(&certificate, pending.key_pem.as_bytes())
            .await?;
        info!(secret = %self.options.secret_name, not_after = %info.not_after,
            "client certificate rotated");

        let condition = new_condition(
            CONDITION_CERTIFICATE_ROTATED,
            TRUE,
            "ClientCertificateUpdated",
            "client certificate rotated successfully".to_string(),
        );
        if let Err(e) = self.reporter.report(condition).await {
            warn!(error = %e, "failed to report certificate condition");
        }
        Ok(())
    }

    async fn read_secret(&self) -> Result<Option<Secret>> {
        let api: Api<Secret> =
            Api::namespaced(self.secret_client.clone(), &self.options.secret_namespace);
        api.get_opt(&self.options.secret_name)
            .await
            .map_err(|source| Error::Kube { source })
    }

    /// Replace the secret contents in one write
    async fn write_secret(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        let api: Api<Secret> =
            Api::namespaced(self.secret_client.clone(), &self.options.secret_namespace);
        let existing = api
            .get_opt(&self.options.secret_name)
            .await
            .map_err(|source| Error::Kube { source })?;

        let mut data: BTreeMap<String, ByteString> = self
            .options
            .additional_secret_data
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect();
        data.insert(TLS_CERT_KEY.to_string(), ByteString(cert_pem.to_vec()));
        data.insert(TLS_KEY_KEY.to_string(), ByteString(key_pem.to_vec()));

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.options.secret_name.clone()),
                namespace: Some(self.options.secret_namespace.clone()),
                resource_version: existing
                    .as_ref()
                    .and_then(|s| s.metadata.resource_version.clone()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        match existing {
            Some(_) => api
                .replace(&self.options.secret_name, &PostParams::default(), &secret)
                .await
                .map(|_| ())
                .map_err(|source| Error::Kube { source })?,
            None => api
                .create(&PostParams::default(), &secret)
                .await
                .map(|_| ())
                .map_err(|source| Error::Kube { source })?,
        }
        Ok(())
    }

    async fn create_csr(&self, key_pem: &str) -> Result<String> {
        let key_pair = rcgen::KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(self.options.secret_name.clone(), e.to_string()))?;
        let request_pem = serialize_csr_pem(&self.options.subject, &self.options.dns_names, &key_pair)
            .map_err(|e| Error::certificate(self.options.secret_name.clone(), e.to_string()))?;

        let csr_name = format!("{}{}", self.options.csr_name_prefix, random_suffix());

        if self.options.use_beta_csr {
            return self.create_beta_csr(&csr_name, request_pem.as_bytes()).await;
        }

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(csr_name.clone()),
                labels: Some(self.options.csr_labels.clone()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem.into_bytes()),
                signer_name: self.options.signer_name.clone(),
                usages: Some(CSR_USAGES.iter().map(|u| u.to_string()).collect()),
                ..Default::default()
            },
            status: None,
        };

        let api: Api<CertificateSigningRequest> = Api::all(self.hub_client.clone());
        api.create(&PostParams::default(), &csr)
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(csr_name)
    }

    /// Legacy endpoint for stores without the certificates/v1 API
    async fn create_beta_csr(&self, csr_name: &str, request_pem: &[u8]) -> Result<String> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let resource = beta_csr_resource();
        let mut obj = DynamicObject::new(csr_name, &resource).data(serde_json::json!({
            "spec": {
                "request": STANDARD.encode(request_pem),
                "signerName": self.options.signer_name,
                "usages": CSR_USAGES,
            }
        }));
        obj.types = Some(TypeMeta {
            api_version: "certificates.k8s.io/v1beta1".to_string(),
            kind: "CertificateSigningRequest".to_string(),
        });
        obj.metadata.labels = Some(self.options.csr_labels.clone());

        let api: Api<DynamicObject> = Api::all_with(self.hub_client.clone(), &resource);
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(csr_name.to_string())
    }

    async fn observe_csr(&self, csr_name: &str) -> Result<CsrObservation> {
        if self.options.use_beta_csr {
            let api: Api<DynamicObject> =
                Api::all_with(self.hub_client.clone(), &beta_csr_resource());
            let Some(obj) = api
                .get_opt(csr_name)
                .await
                .map_err(|source| Error::Kube { source })?
            else {
                return Ok(CsrObservation {
                    missing: true,
                    ..Default::default()
                });
            };
            return Ok(observe_beta_csr(&obj.data));
        }

        let api: Api<CertificateSigningRequest> = Api::all(self.hub_client.clone());
        let Some(csr) = api
            .get_opt(csr_name)
            .await
            .map_err(|source| Error::Kube { source })?
        else {
            return Ok(CsrObservation {
                missing: true,
                ..Default::default()
            });
        };
        Ok(observe_csr_status(&csr))
    }
}

/// Fold a v1 CSR's status into an observation
pub fn observe_csr_status(csr: &CertificateSigningRequest) -> CsrObservation {
    let mut observation = CsrObservation::default();
    if let Some(status) = &csr.status {
        for condition in status.conditions.iter().flatten() {
            match condition.type_.as_str() {
                "Approved" => observation.approved = true,
                "Denied" | "Failed" => observation.rejected = true,
                _ => {}
            }
        }
        observation.certificate = status
            .certificate
            .as_ref()
            .filter(|c| !c.0.is_empty())
            .map(|c| c.0.clone());
    }
    observation
}

/// Fold a v1beta1 CSR's raw status into an observation
pub fn observe_beta_csr(data: &serde_json::Value) -> CsrObservation {
    let mut observation = CsrObservation::default();
    let status = &data["status"];
    if let Some(conditions) = status["conditions"].as_array() {
        for condition in conditions {
            match condition["type"].as_str() {
                Some("Approved") => observation.approved = true,
                Some("Denied") | Some("Failed") => observation.rejected = true,
                _ => {}
            }
        }
    }
    if let Some(certificate) = status["certificate"].as_str() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        if let Ok(decoded) = STANDARD.decode(certificate) {
            if !decoded.is_empty() {
                observation.certificate = Some(decoded);
            }
        }
    }
    observation
}

fn beta_csr_resource() -> ApiResource {
    ApiResource {
        group: "certificates.k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "certificates.k8s.io/v1beta1".to_string(),
        kind: "CertificateSigningRequest".to_string(),
        plural: "certificatesigningrequests".to_string(),
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret.data.as_ref()?.get(key).map(|v| v.0.clone())
}

fn fresh_key_pem() -> Result<String> {
    Ok(generate_key_pair()
        .map_err(|e| Error::internal_with_context("rotator", e.to_string()))?
        .serialize_pem())
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
