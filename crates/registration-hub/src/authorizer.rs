//! SubjectAccessReview-backed authorization checks
//!
//! Both the CSR approver and the validating webhook gate decisions on the
//! store's authorizer. The trait keeps the decision logic testable without an
//! API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;

use registration_common::{Error, Result};

/// The identity on whose behalf an access review is performed
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReviewUser {
    /// User name
    pub username: String,
    /// User UID
    pub uid: Option<String>,
    /// Groups the user belongs to
    pub groups: Vec<String>,
    /// Extra attributes propagated from the request
    pub extra: BTreeMap<String, Vec<String>>,
}

/// The resource access being reviewed
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReviewAttributes {
    /// API group
    pub group: String,
    /// Resource plural
    pub resource: String,
    /// Subresource, if any
    pub subresource: String,
    /// Verb
    pub verb: String,
    /// Resource name, if the check is name-scoped
    pub name: String,
}

/// Capability check against the store's authorizer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user` is allowed the access described by `attributes`.
    /// An Err means the review itself could not be performed.
    async fn allowed(&self, user: &ReviewUser, attributes: &ReviewAttributes) -> Result<bool>;
}

/// Authorizer creating SubjectAccessReviews through the hub client
#[derive(Clone)]
pub struct SubjectAccessReviewAuthorizer {
    client: Client,
}

impl SubjectAccessReviewAuthorizer {
    /// Create an authorizer backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    async fn allowed(&self, user: &ReviewUser, attributes: &ReviewAttributes) -> Result<bool> {
        let sar = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(user.username.clone()),
                uid: user.uid.clone(),
                groups: if user.groups.is_empty() {
                    None
                } else {
                    Some(user.groups.clone())
                },
                extra: if user.extra.is_empty() {
                    None
                } else {
                    Some(user.extra.clone())
                },
                resource_attributes: Some(ResourceAttributes {
                    group: Some(attributes.group.clone()),
                    resource: Some(attributes.resource.clone()),
                    subresource: if attributes.subresource.is_empty() {
                        None
                    } else {
                        Some(attributes.subresource.clone())
                    },
                    verb: Some(attributes.verb.clone()),
                    name: if attributes.name.is_empty() {
                        None
                    } else {
                        Some(attributes.name.clone())
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &sar)
            .await
            .map_err(|source| Error::Kube { source })?;

        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}
