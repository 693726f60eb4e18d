//! Registration agent
//!
//! Long-lived agent on a managed cluster: bootstraps with a weak credential,
//! obtains a cluster-scoped client certificate, then keeps registration,
//! liveness and addon lifecycle reconciled against the hub. Exits zero on a
//! clean cancel and non-zero on bootstrap failure.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use registration_common::features::FeatureGates;
use registration_spoke::agent::{self, SpokeAgentOptions};

/// Spoke registration agent
#[derive(Parser, Debug)]
#[command(name = "registration-agent", version, about, long_about = None)]
struct Cli {
    /// Name of the managed cluster this agent represents
    #[arg(long)]
    cluster_name: String,

    /// Agent name override; a stable random token is generated when omitted
    #[arg(long)]
    agent_name: Option<String>,

    /// Kubeconfig with the bootstrap credential for first contact
    #[arg(long)]
    bootstrap_kubeconfig: Option<PathBuf>,

    /// Name of the secret holding the hub kubeconfig and client certificate
    #[arg(long, default_value = "hub-kubeconfig-secret")]
    hub_kubeconfig_secret: String,

    /// Directory the hub kubeconfig contents are mirrored into
    #[arg(long)]
    hub_kubeconfig_dir: Option<PathBuf>,

    /// Kubeconfig of the managed cluster; when set the agent runs detached
    #[arg(long)]
    spoke_kubeconfig: Option<PathBuf>,

    /// Period of the cluster health/status sync, in seconds
    #[arg(long, default_value_t = 60)]
    cluster_healthcheck_period: u64,

    /// External apiserver URL published in the cluster's client configs
    #[arg(long = "spoke-external-server-urls")]
    spoke_external_server_urls: Vec<String>,

    /// Bound on custom cluster claims reported in status
    #[arg(long, default_value_t = 20)]
    max_custom_cluster_claims: usize,

    /// Feature gate overrides, e.g. AddonManagement=true,ClusterClaim=false
    #[arg(long, default_value = "")]
    feature_gates: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    let mut feature_gates = FeatureGates::spoke_defaults();
    feature_gates.apply_overrides(&cli.feature_gates)?;

    let options = SpokeAgentOptions {
        cluster_name: cli.cluster_name,
        agent_name: cli.agent_name,
        bootstrap_kubeconfig: cli.bootstrap_kubeconfig,
        hub_kubeconfig_secret: cli.hub_kubeconfig_secret,
        hub_kubeconfig_dir: cli.hub_kubeconfig_dir,
        spoke_kubeconfig: cli.spoke_kubeconfig,
        cluster_healthcheck_period: Duration::from_secs(cli.cluster_healthcheck_period.max(1)),
        spoke_external_server_urls: cli.spoke_external_server_urls,
        max_custom_cluster_claims: cli.max_custom_cluster_claims,
        feature_gates,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    // bootstrap failures propagate and exit non-zero; a signal-driven cancel
    // unwinds cleanly through run() and exits zero
    agent::run(options, cancel).await?;
    Ok(())
}
