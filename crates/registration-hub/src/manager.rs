//! Hub controller manager
//!
//! Builds and runs every hub-side controller. Workers run in parallel across
//! controllers; the informer layer serializes syncs per object key.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::Api;
use kube::discovery::ApiResource;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tracing::info;

use registration_common::crd::{ManagedCluster, ManagedClusterAddOn};
use registration_common::features::{Feature, FeatureGates};
use registration_common::CLUSTER_NAME_LABEL;

use crate::authorizer::SubjectAccessReviewAuthorizer;
use crate::backoff::ErrorBackoff;
use crate::{acceptance, addon_discovery, csr_approver, deletion, lease, taint};

/// Run all hub controllers until shutdown
pub async fn run_controllers(
    client: Client,
    gates: FeatureGates,
    pre_delete_monitors: Vec<ApiResource>,
) {
    let clusters: Api<ManagedCluster> = Api::all(client.clone());
    let addons: Api<ManagedClusterAddOn> = Api::all(client.clone());
    let csrs: Api<CertificateSigningRequest> = Api::all(client.clone());

    info!("starting registration hub controllers");

    let acceptance_controller = Controller::new(clusters.clone(), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            acceptance::reconcile,
            acceptance::error_policy,
            Arc::new(acceptance::Context {
                client: client.clone(),
                default_cluster_set: gates.enabled(Feature::DefaultClusterSet),
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "acceptance reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "acceptance reconciliation error"),
            }
        });

    let deletion_controller = Controller::new(clusters.clone(), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            deletion::reconcile,
            deletion::error_policy,
            Arc::new(deletion::Context {
                client: client.clone(),
                pre_delete_monitors,
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "deletion reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "deletion reconciliation error"),
            }
        });

    // only CSRs labelled with a cluster name are interesting here
    let csr_watch = WatcherConfig::default().labels(CLUSTER_NAME_LABEL);
    let csr_controller = Controller::new(csrs, csr_watch)
        .shutdown_on_signal()
        .run(
            csr_approver::reconcile,
            csr_approver::error_policy,
            Arc::new(csr_approver::Context {
                client: client.clone(),
                authorizer: Arc::new(SubjectAccessReviewAuthorizer::new(client.clone())),
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "csr reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "csr reconciliation error"),
            }
        });

    let lease_controller = Controller::new(clusters.clone(), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            lease::reconcile,
            lease::error_policy,
            Arc::new(lease::Context {
                client: client.clone(),
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "lease evaluation completed"),
                Err(e) => tracing::error!(error = %e, "lease evaluation error"),
            }
        });

    let taint_controller = Controller::new(clusters.clone(), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            taint::reconcile,
            taint::error_policy,
            Arc::new(taint::Context {
                client: client.clone(),
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "taint reconciliation completed"),
                Err(e) => tracing::error!(error = %e, "taint reconciliation error"),
            }
        });

    // addon changes re-trigger the owning cluster
    let discovery_controller = Controller::new(clusters, WatcherConfig::default())
        .watches(addons, WatcherConfig::default(), |addon| {
            addon
                .metadata
                .namespace
                .as_deref()
                .map(ObjectRef::<ManagedCluster>::new)
        })
        .shutdown_on_signal()
        .run(
            addon_discovery::reconcile,
            addon_discovery::error_policy,
            Arc::new(addon_discovery::Context {
                client,
                backoff: ErrorBackoff::default(),
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "addon discovery completed"),
                Err(e) => tracing::error!(error = %e, "addon discovery error"),
            }
        });

    tokio::select! {
        _ = acceptance_controller => info!("acceptance controller completed"),
        _ = deletion_controller => info!("deletion controller completed"),
        _ = csr_controller => info!("csr approving controller completed"),
        _ = lease_controller => info!("cluster lease controller completed"),
        _ = taint_controller => info!("taint controller completed"),
        _ = discovery_controller => info!("addon discovery controller completed"),
    }
}
