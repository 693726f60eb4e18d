//! Registration hub controller
//!
//! Runs the hub-side controllers plus the admission webhook for cluster and
//! clusterset writes.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use registration_common::features::FeatureGates;
use registration_hub::authorizer::SubjectAccessReviewAuthorizer;
use registration_hub::webhook::{self, WebhookState};
use registration_hub::manager;

/// Hub-side registration controller manager
#[derive(Parser, Debug)]
#[command(name = "registration-hub", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig; in-cluster config is used when omitted
    #[arg(long)]
    kubeconfig: Option<std::path::PathBuf>,

    /// Address the admission webhook listens on
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Feature gate overrides, e.g. DefaultClusterSet=true
    #[arg(long, default_value = "")]
    feature_gates: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // client TLS needs a process-wide provider before the first connection
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    let mut gates = FeatureGates::hub_defaults();
    gates.apply_overrides(&cli.feature_gates)?;

    let client = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            Client::try_from(config)?
        }
        None => Client::try_default().await?,
    };

    let webhook_state = Arc::new(WebhookState {
        authorizer: Arc::new(SubjectAccessReviewAuthorizer::new(client.clone())),
    });

    tokio::select! {
        result = webhook::serve(cli.webhook_addr, webhook_state) => {
            result?;
        }
        _ = manager::run_controllers(client, gates, vec![]) => {}
    }

    Ok(())
}
