//! Main binary for the partition reconfigurator daemon (reconfigd)

use anyhow::Context;
use clap::Parser;
use comp_core::profile::DEFAULT_PROFILE_PATH;
use comp_core::{PartitionProfiles, PinQueue};
use comp_kube::{KubeCluster, NodeApi, PodApi};
use comp_reconfig::{PodPreprocessor, ReconfigController, ReconfigSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reconfigd")]
#[command(about = "GPU partition reconfigurator and pod preprocessor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Partition profile file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_PROFILE_PATH)]
    profile_config: PathBuf,

    /// Log level when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let profiles = PartitionProfiles::from_file(&cli.profile_config)
        .context("cannot load partition profiles")?;
    info!(
        profiles = profiles.names().len(),
        file = %cli.profile_config.display(),
        "loaded partition profiles"
    );

    let client = kube::Client::try_default()
        .await
        .context("cannot create cluster client")?;

    let cancel = CancellationToken::new();
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let pins = Arc::new(PinQueue::new());

    let nodes: Arc<dyn NodeApi> = cluster.clone();
    let pods: Arc<dyn PodApi> = cluster;
    let controller = ReconfigController::new(
        nodes,
        pods.clone(),
        profiles,
        pins.clone(),
        ReconfigSettings::default(),
    );
    let preprocessor = PodPreprocessor::new(pods, pins);

    let reconfig_client = client.clone();
    let reconfig_cancel = cancel.clone();
    let reconfig_task = tokio::spawn(async move {
        if let Err(e) = controller.run(reconfig_client, reconfig_cancel).await {
            error!("reconfigurator stopped with error: {}", e);
        }
    });

    let preprocess_cancel = cancel.clone();
    let preprocess_task = tokio::spawn(async move {
        if let Err(e) = preprocessor.run(client, preprocess_cancel).await {
            error!("preprocessor stopped with error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("received shutdown signal");
    cancel.cancel();

    let _ = reconfig_task.await;
    let _ = preprocess_task.await;
    info!("reconfigd stopped");
    Ok(())
}
