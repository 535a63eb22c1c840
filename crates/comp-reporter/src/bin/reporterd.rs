//! Main binary for the per-node GPU reporter daemon (reporterd)

use anyhow::Context;
use clap::Parser;
use comp_core::profile::DEFAULT_PROFILE_PATH;
use comp_core::PartitionProfiles;
use comp_kube::{KubeCluster, NodeApi, PodApi};
use comp_reporter::{
    AcceleratorLibrary, GpuReporter, KubeletCheckpoint, NvmlLibrary, PodResourcesSource,
    ReporterSettings, StaticLibrary,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reporterd")]
#[command(about = "Per-node GPU slice reporter")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Name of the node this daemon runs on
    #[arg(long, env = "NODE_NAME", value_name = "NODE")]
    node_name: String,

    /// Partition profile file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_PROFILE_PATH)]
    profile_config: PathBuf,

    /// Kubelet device-manager state file
    #[arg(
        long,
        value_name = "FILE",
        default_value = comp_reporter::allocations::DEFAULT_CHECKPOINT_PATH
    )]
    device_state: PathBuf,

    /// Use a device map stub instead of NVML (development only)
    #[arg(long)]
    mock_devices: bool,

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

    let library: Arc<dyn AcceleratorLibrary> = if cli.mock_devices {
        info!("using stub device map instead of NVML");
        Arc::new(StaticLibrary::new())
    } else {
        Arc::new(NvmlLibrary::new().context("cannot initialize accelerator library")?)
    };

    let client = kube::Client::try_default()
        .await
        .context("cannot create cluster client")?;

    let cancel = CancellationToken::new();
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let pods: Arc<dyn PodApi> = cluster.clone();
    let nodes: Arc<dyn NodeApi> = cluster;
    let source: Arc<dyn PodResourcesSource> =
        Arc::new(KubeletCheckpoint::new(cli.device_state.clone()));

    let reporter = GpuReporter::new(
        pods,
        nodes,
        source,
        library,
        profiles,
        ReporterSettings::new(cli.node_name.clone()),
    );

    info!(node = %cli.node_name, "starting reporterd");
    let run_cancel = cancel.clone();
    tokio::select! {
        result = reporter.run(client, run_cancel) => {
            result.context("reporter stopped with error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            cancel.cancel();
        }
    }

    info!("reporterd stopped");
    Ok(())
}
