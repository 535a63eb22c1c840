//! Main binary for the autoscaler daemon (autoscalerd)

use anyhow::Context;
use clap::Parser;
use comp_autoscaler::{
    Autoscaler, ConfigMapFetcher, PrometheusBackend, ResourceDefaults, ScaleApplier, ScaleDecider,
    SliceTierRegistry,
};
use comp_core::Settings;
use comp_kube::{KnativeWorkloads, KubeCluster, NodeApi, PodApi};
use comp_metrics::Exporter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autoscalerd")]
#[command(about = "GPU slice autoscaler for serverless inference workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
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

    let settings = Settings::from_env().context("invalid environment configuration")?;
    info!(
        namespace = %settings.namespace,
        interval = ?settings.scrape_interval,
        "starting autoscalerd"
    );

    let client = kube::Client::try_default()
        .await
        .context("cannot create cluster client")?;

    let cancel = CancellationToken::new();
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let workloads = Arc::new(KnativeWorkloads::new(
        client,
        &settings.namespace,
        cancel.clone(),
    ));

    let nodes: Arc<dyn NodeApi> = cluster.clone();
    let registry = Arc::new(SliceTierRegistry::new(nodes));
    let decider = Arc::new(ScaleDecider::new(
        registry,
        ResourceDefaults {
            cpu: settings.default_cpu.clone(),
            memory: settings.default_memory.clone(),
        },
    ));
    let applier = Arc::new(ScaleApplier::new(
        workloads.clone(),
        settings.scale_timeout,
        settings.revision_grace,
    ));
    let fetcher = Arc::new(ConfigMapFetcher::new(
        cluster.clone(),
        Arc::new(PrometheusBackend::new(settings.prometheus_url.clone())),
        settings.namespace.clone(),
        settings.config_map_name.clone(),
    ));

    let exporter = Arc::new(
        Exporter::new(settings.metrics_bind, settings.scrape_interval)
            .context("cannot create metrics exporter")?,
    );
    let sink = Arc::new(exporter.sink());

    let pods: Arc<dyn PodApi> = cluster;
    let autoscaler = Autoscaler::new(settings, workloads, pods, fetcher, decider, applier, sink);

    let exporter_cancel = cancel.clone();
    let exporter_task = tokio::spawn(async move {
        if let Err(e) = exporter.run(exporter_cancel).await {
            error!("exporter stopped with error: {}", e);
        }
    });

    let loop_cancel = cancel.clone();
    tokio::select! {
        _ = autoscaler.run(loop_cancel) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            cancel.cancel();
        }
    }

    cancel.cancel();
    let _ = exporter_task.await;
    info!("autoscalerd stopped");
    Ok(())
}
