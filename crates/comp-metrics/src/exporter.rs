//! Scaling-state exporter
//!
//! Single-writer task that drains scaling events off an unbounded channel
//! and reflects them into the `KubeComp_gpu_resource{revision}` gauge. No
//! other component touches the metric registry directly; the autoscaler
//! reports through the [`ScalingEventSink`] capability returned by
//! [`Exporter::sink`].

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use comp_core::{Error, Result, ScaleKind, ScalingEvent, ScalingEventSink};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gauge reporting each revision's slice compute weight
const GAUGE_NAME: &str = "KubeComp_gpu_resource";

/// Scaling-state exporter with its own metric registry and HTTP endpoint
pub struct Exporter {
    registry: Registry,
    gauge: GaugeVec,
    tx: mpsc::UnboundedSender<ScalingEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ScalingEvent>>>,
    bind_addr: SocketAddr,
    update_interval: Duration,
}

impl Exporter {
    /// Create the exporter and register its gauge
    pub fn new(bind_addr: SocketAddr, update_interval: Duration) -> Result<Self> {
        let registry = Registry::new();
        let gauge = GaugeVec::new(
            Opts::new(GAUGE_NAME, "GPU slice used by each workload revision"),
            &["revision"],
        )
        .map_err(|e| Error::internal(format!("failed to create gauge: {}", e)))?;
        registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| Error::internal(format!("failed to register gauge: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            registry,
            gauge,
            tx,
            rx: Mutex::new(Some(rx)),
            bind_addr,
            update_interval,
        })
    }

    /// A cloneable sink the autoscaler reports events through
    pub fn sink(&self) -> ExporterSink {
        ExporterSink {
            tx: self.tx.clone(),
        }
    }

    /// Serve the metrics endpoint and drain events until shutdown.
    ///
    /// One event is applied per update interval; the channel is unbounded,
    /// so senders never block.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::internal("exporter already running"))?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.registry.clone());

        let listener = TcpListener::bind(self.bind_addr).await?;
        info!("Serving scaling metrics on {}", self.bind_addr);

        let shutdown = cancel.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!("Metrics server error: {}", e);
            }
        });

        let mut ticker = tokio::time::interval(self.update_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => self.apply(&event),
                            None => break,
                        }
                    }
                }
            }
        }

        server.abort();
        Ok(())
    }

    /// Reflect one event into the gauge.
    ///
    /// Observations and scale-out keep the revision's series alive with the
    /// current slice weight; up/down/in drop the superseded revision's
    /// series (its replacement is observed on the next tick).
    pub fn apply(&self, event: &ScalingEvent) {
        match event.kind {
            ScaleKind::None | ScaleKind::Out => {
                let weight = event
                    .slice
                    .as_ref()
                    .map(|slice| if slice.compute.is_finite() { slice.compute } else { 0.0 })
                    .unwrap_or(0.0);
                self.gauge
                    .with_label_values(&[event.revision.as_str()])
                    .set(weight);
            }
            ScaleKind::Up | ScaleKind::Down | ScaleKind::In => {
                if self
                    .gauge
                    .remove_label_values(&[event.revision.as_str()])
                    .is_err()
                {
                    debug!(revision = %event.revision, "no gauge series to drop");
                }
            }
        }
    }

    /// Current metrics in text exposition format
    pub fn metrics_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Sink handle writing into the exporter's event channel
#[derive(Clone)]
pub struct ExporterSink {
    tx: mpsc::UnboundedSender<ScalingEvent>,
}

impl ScalingEventSink for ExporterSink {
    fn record(&self, event: ScalingEvent) {
        if self.tx.send(event).is_err() {
            warn!("scaling event dropped: exporter stopped");
        }
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::internal(format!("metrics not UTF-8: {}", e)))
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    match encode_registry(&registry) {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use comp_core::tier::SliceTier;

    fn exporter() -> Exporter {
        Exporter::new("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_observation_sets_gauge_to_compute_weight() {
        let exporter = exporter();
        let tier = SliceTier::parse("nvidia.com/mig-3g.20gb").unwrap();

        exporter.apply(&ScalingEvent::not_scaling("llama-00001", Some(tier)));

        let text = exporter.metrics_text().unwrap();
        assert!(text.contains("KubeComp_gpu_resource{revision=\"llama-00001\"} 3"));
    }

    #[test]
    fn test_scale_up_drops_superseded_series() {
        let exporter = exporter();
        let tier = SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap();

        exporter.apply(&ScalingEvent::not_scaling("llama-00001", Some(tier.clone())));
        exporter.apply(&ScalingEvent::scaled("llama-00001", ScaleKind::Up, Some(tier)));

        let text = exporter.metrics_text().unwrap();
        assert!(!text.contains("llama-00001"));
    }

    #[test]
    fn test_scale_out_keeps_series() {
        let exporter = exporter();
        let tier = SliceTier::parse("nvidia.com/mig-1g.5gb").unwrap();

        exporter.apply(&ScalingEvent::scaled("llama-00002", ScaleKind::Out, Some(tier)));

        let text = exporter.metrics_text().unwrap();
        assert!(text.contains("KubeComp_gpu_resource{revision=\"llama-00002\"} 1"));
    }

    #[test]
    fn test_observation_without_slice_reports_zero() {
        let exporter = exporter();
        exporter.apply(&ScalingEvent::not_scaling("llama-00003", None));

        let text = exporter.metrics_text().unwrap();
        assert!(text.contains("KubeComp_gpu_resource{revision=\"llama-00003\"} 0"));
    }

    #[tokio::test]
    async fn test_run_drains_sink_events() {
        let exporter = exporter();
        let sink = exporter.sink();
        let cancel = CancellationToken::new();

        let tier = SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap();
        sink.record(ScalingEvent::not_scaling("llama-00001", Some(tier)));

        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            run_cancel.cancel();
        });

        exporter.run(cancel).await.unwrap();
        handle.await.unwrap();

        let text = exporter.metrics_text().unwrap();
        assert!(text.contains("llama-00001"));
    }
}
