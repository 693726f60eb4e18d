//! Admission webhook for cluster and clusterset writes
//!
//! Two sibling endpoints run inline on the write path: the mutator stamps
//! taint timestamps and defaults clusterset selectors, the validator enforces
//! client-config URLs and permission checks. TLS termination happens in
//! front of this server.

mod mutation;
mod validation;

pub use mutation::mutate_handler;
pub use validation::validate_handler;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use kube::core::admission::AdmissionResponse;
use tracing::info;

use registration_common::Result;

use crate::authorizer::Authorizer;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Authorizer for accept and label permission checks
    pub authorizer: Arc<dyn Authorizer>,
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/validate", post(validate_handler))
        .with_state(state)
}

/// Serve the webhook until the listener fails or the process stops
pub async fn serve(addr: std::net::SocketAddr, state: Arc<WebhookState>) -> Result<()> {
    let app = router(state);
    info!(%addr, "starting admission webhook");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| registration_common::Error::configuration(format!("failed to bind webhook listener: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| registration_common::Error::internal_with_context("webhook", e.to_string()))
}

/// Deny with an explicit HTTP status code carried in the admission result
pub(crate) fn deny_with_code(
    response: AdmissionResponse,
    code: u16,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = response.deny(message);
    response.result.code = code;
    response
}
