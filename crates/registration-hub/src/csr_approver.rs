//! CSR approving controller
//!
//! Auto-approves *renewal* certificate requests: a pending CSR whose subject
//! proves it already holds a per-cluster identity, submitted by that same
//! identity, under the kube-apiserver client signer. First-time joins carry a
//! bootstrap identity instead and are left for a human. Even recognized
//! renewals must pass a SubjectAccessReview before approval.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use registration_common::{
    Error, Result, CLUSTER_NAME_LABEL, KUBE_APISERVER_CLIENT_SIGNER, MANAGED_CLUSTERS_GROUP,
    REGISTRATION_API_GROUP,
};
use registration_pki::{CsrSubject, Subject};

use crate::authorizer::{Authorizer, ReviewAttributes, ReviewUser};
use crate::backoff::{ErrorBackoff, RESYNC_INTERVAL};

const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";
const FAILED: &str = "Failed";

/// Context shared by CSR reconciliations
pub struct Context {
    /// Hub client
    pub client: Client,
    /// Authorizer used to confirm the requester may renew
    pub authorizer: Arc<dyn Authorizer>,
    /// Per-request retry backoff
    pub backoff: ErrorBackoff,
}

/// Whether the CSR already carries a terminal condition
pub fn is_in_terminal_state(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == APPROVED || c.type_ == DENIED || c.type_ == FAILED)
        })
        .unwrap_or(false)
}

/// Recognize a renewal CSR from an already-enrolled cluster.
///
/// Checks, in order: the cluster-name label, the signer, exactly one
/// non-legacy organization of the form `open-cluster-management:<cluster>`,
/// a CN prefixed with that organization, and a requesting username equal to
/// the CN. Anything else is not a renewal and is ignored.
pub fn recognize_renewal(csr: &CertificateSigningRequest) -> Option<String> {
    let cluster_name = csr.labels().get(CLUSTER_NAME_LABEL)?.clone();

    if csr.spec.signer_name != KUBE_APISERVER_CLIENT_SIGNER {
        return None;
    }

    let subject = CsrSubject::from_pem(&csr.spec.request.0).ok()?;

    let mut orgs: Vec<&String> = subject
        .organizations
        .iter()
        .filter(|org| org.as_str() != MANAGED_CLUSTERS_GROUP)
        .collect();
    orgs.dedup();
    if orgs.len() != 1 {
        return None;
    }

    let expected_org = Subject::cluster_organization(&cluster_name);
    if *orgs[0] != expected_org {
        return None;
    }

    if !subject.common_name.starts_with(&expected_org) {
        return None;
    }

    if csr.spec.username.as_deref() != Some(subject.common_name.as_str()) {
        return None;
    }

    Some(cluster_name)
}

/// Reconcile one CertificateSigningRequest
pub async fn reconcile(csr: Arc<CertificateSigningRequest>, ctx: Arc<Context>) -> Result<Action> {
    let name = csr.name_any();

    if is_in_terminal_state(&csr) {
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    let Some(cluster_name) = recognize_renewal(&csr) else {
        debug!(csr = %name, "csr was not recognized as a managed cluster renewal");
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    };

    let user = ReviewUser {
        username: csr.spec.username.clone().unwrap_or_default(),
        uid: csr.spec.uid.clone(),
        groups: csr.spec.groups.clone().unwrap_or_default(),
        extra: csr.spec.extra.clone().unwrap_or_default(),
    };
    let attributes = ReviewAttributes {
        group: REGISTRATION_API_GROUP.to_string(),
        resource: "managedclusters".to_string(),
        subresource: "clientcertificates".to_string(),
        verb: "renew".to_string(),
        name: String::new(),
    };

    // A failed review call is retried; a denial leaves the CSR pending for a
    // human rather than rejecting it.
    if !ctx.authorizer.allowed(&user, &attributes).await? {
        debug!(csr = %name, cluster = %cluster_name,
            "renewal csr not auto-approved, subject access review denied");
        ctx.backoff.reset(&name);
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }

    approve(&ctx.client, &name).await?;
    info!(csr = %name, cluster = %cluster_name, "renewal csr auto-approved");
    ctx.backoff.reset(&name);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per request; a failed subject access
/// review lands here and retries with a growing delay
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!(csr = %csr.name_any(), error = %error, "csr reconciliation failed");
    Action::requeue(ctx.backoff.next_delay(&csr.name_any()))
}

async fn approve(client: &Client, name: &str) -> Result<()> {
    let api: Api<CertificateSigningRequest> = Api::all(client.clone());

    // re-read through the approval subresource so the update is based on the
    // freshest status
    let mut csr = api
        .get_approval(name)
        .await
        .map_err(|source| Error::Kube { source })?;
    if is_in_terminal_state(&csr) {
        return Ok(());
    }

    let status = csr.status.get_or_insert_with(Default::default);
    status
        .conditions
        .get_or_insert_with(Vec::new)
        .push(CertificateSigningRequestCondition {
            type_: APPROVED.to_string(),
            status: "True".to_string(),
            reason: Some("AutoApprovedByHubCSRApprovingController".to_string()),
            message: Some(
                "Auto approving managed cluster agent certificate after SubjectAccessReview."
                    .to_string(),
            ),
            last_transition_time: Some(Time(Utc::now())),
            last_update_time: Some(Time(Utc::now())),
        });

    let data = serde_json::to_vec(&csr).map_err(|e| Error::serialization(e.to_string()))?;
    api.replace_subresource("approval", name, &PostParams::default(), data)
        .await
        .map_err(|source| Error::Kube { source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    };
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use registration_pki::{generate_key_pair, serialize_csr_pem};

    fn renewal_csr(cluster: &str, agent: &str) -> CertificateSigningRequest {
        let key = generate_key_pair().unwrap();
        let subject = Subject::for_cluster(cluster, agent);
        let request = serialize_csr_pem(&subject, &[], &key).unwrap();

        let mut labels = std::collections::BTreeMap::new();
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.to_string());

        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(format!("{cluster}-abcde")),
                labels: Some(labels),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.into_bytes()),
                signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
                username: Some(subject.common_name),
                groups: Some(vec![format!("open-cluster-management:{cluster}")]),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn recognizes_well_formed_renewal() {
        let csr = renewal_csr("cluster1", "agent1");
        assert_eq!(recognize_renewal(&csr), Some("cluster1".to_string()));
    }

    #[test]
    fn rejects_missing_cluster_label() {
        let mut csr = renewal_csr("cluster1", "agent1");
        csr.metadata.labels = None;
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn rejects_wrong_signer() {
        let mut csr = renewal_csr("cluster1", "agent1");
        csr.spec.signer_name = "example.com/custom-signer".to_string();
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn rejects_label_and_subject_cluster_mismatch() {
        let mut csr = renewal_csr("cluster1", "agent1");
        csr.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(CLUSTER_NAME_LABEL.to_string(), "cluster2".to_string());
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn rejects_username_mismatch() {
        let mut csr = renewal_csr("cluster1", "agent1");
        // the bootstrap user submits first-join CSRs; those are not renewals
        csr.spec.username = Some("kube:admin".to_string());
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn rejects_garbage_request() {
        let mut csr = renewal_csr("cluster1", "agent1");
        csr.spec.request = ByteString(b"not a pem".to_vec());
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn legacy_group_alone_is_not_a_renewal() {
        let key = generate_key_pair().unwrap();
        let subject = Subject {
            common_name: format!("{MANAGED_CLUSTERS_GROUP}:agent"),
            organizations: vec![MANAGED_CLUSTERS_GROUP.to_string()],
            organization_units: vec![],
        };
        let request = serialize_csr_pem(&subject, &[], &key).unwrap();

        let mut csr = renewal_csr("cluster1", "agent1");
        csr.spec.request = ByteString(request.into_bytes());
        csr.spec.username = Some(subject.common_name);
        assert_eq!(recognize_renewal(&csr), None);
    }

    #[test]
    fn terminal_state_detection() {
        let mut csr = renewal_csr("cluster1", "agent1");
        assert!(!is_in_terminal_state(&csr));

        csr.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: DENIED.to_string(),
                status: "True".to_string(),
                reason: None,
                message: None,
                last_transition_time: None,
                last_update_time: None,
            }]),
            certificate: None,
        });
        assert!(is_in_terminal_state(&csr));
    }
}
