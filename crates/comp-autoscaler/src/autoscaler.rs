//! The periodic autoscaler loop
//!
//! Every tick, lists the workload services, skips the ones on the ignore
//! list or already being scaled, and inspects each remaining workload's
//! pods. A non-trivial decision marks the workload as scaling and hands the
//! rest to a detached applier task; everything else is reported to the
//! event sink so the exporter stays accurate.

use crate::applier::ScaleApplier;
use crate::decider::{ScaleDecider, WorkloadSnapshot};
use crate::fetcher::MetricFetcher;
use comp_core::labels::{
    KNATIVE_REVISION_LABEL, KNATIVE_SERVICE_LABEL, SCALING_DONE, SCALING_IN_PROGRESS,
    SCALING_LABEL,
};
use comp_core::{Error, Result, ScaleKind, ScalingEvent, ScalingEventSink, Settings};
use comp_kube::serving::Service;
use comp_kube::util::{pod_is_ready, pod_label, pod_slice_request};
use comp_kube::{PodApi, WorkloadApi};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The per-workload vertical autoscaler
pub struct Autoscaler {
    settings: Settings,
    workloads: Arc<dyn WorkloadApi>,
    pods: Arc<dyn PodApi>,
    fetcher: Arc<dyn MetricFetcher>,
    decider: Arc<ScaleDecider>,
    applier: Arc<ScaleApplier>,
    sink: Arc<dyn ScalingEventSink>,
}

impl Autoscaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        workloads: Arc<dyn WorkloadApi>,
        pods: Arc<dyn PodApi>,
        fetcher: Arc<dyn MetricFetcher>,
        decider: Arc<ScaleDecider>,
        applier: Arc<ScaleApplier>,
        sink: Arc<dyn ScalingEventSink>,
    ) -> Self {
        Self {
            settings,
            workloads,
            pods,
            fetcher,
            decider,
            applier,
            sink,
        }
    }

    /// Tick until shutdown. The tick loop itself is single-threaded;
    /// appliers run as detached tasks, at most one per workload.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.scrape_interval);
        info!(
            interval = ?self.settings.scrape_interval,
            "autoscaler loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("autoscaler loop stopped");
                    return;
                }
                _ = ticker.tick() => self.tick_once(&cancel).await,
            }
        }
    }

    /// One pass over every managed workload. Per-workload errors are logged
    /// and never abort the tick.
    pub async fn tick_once(&self, cancel: &CancellationToken) {
        let services = match self.workloads.list_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!("failed to list workload services: {}", e);
                return;
            }
        };

        for service in services {
            let name = service.metadata.name.clone().unwrap_or_default();
            if self.settings.is_ignored(&name) {
                debug!(service = %name, "on ignore list");
                continue;
            }
            if service.label(SCALING_LABEL) == Some(SCALING_IN_PROGRESS) {
                debug!(service = %name, "scaling already in flight");
                continue;
            }
            if let Err(e) = self.process_service(&service, cancel).await {
                warn!(service = %name, "workload inspection failed: {}", e);
            }
        }
    }

    async fn process_service(&self, service: &Service, cancel: &CancellationToken) -> Result<()> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("service without a name"))?;
        let selector = format!("{}={}", KNATIVE_SERVICE_LABEL, name);
        let pods = self
            .pods
            .list_labeled(Some(&self.settings.namespace), &selector)
            .await?;

        for pod in pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let revision = pod_label(&pod, KNATIVE_REVISION_LABEL)
                .unwrap_or_default()
                .to_string();

            if !pod_is_ready(&pod) {
                debug!(pod = %pod_name, "not ready, reporting observation only");
                self.sink.record(ScalingEvent::not_scaling(revision, None));
                continue;
            }

            let Some(current) = pod_slice_request(&pod) else {
                debug!(pod = %pod_name, "not using any accelerator slice");
                continue;
            };

            let metrics = match self.fetcher.fetch(&pod).await {
                Ok(metrics) => metrics,
                Err(Error::NoMetricConfig(reason)) => {
                    debug!(pod = %pod_name, %reason, "skipping unconfigured pod");
                    continue;
                }
                Err(Error::MetricUnavailable(reason)) => {
                    warn!(pod = %pod_name, %reason, "metrics unavailable this tick");
                    self.sink
                        .record(ScalingEvent::not_scaling(revision, Some(current)));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let snapshot = WorkloadSnapshot {
                service: name.clone(),
                revision: revision.clone(),
                pod: pod_name,
                current: current.clone(),
                metrics,
            };

            let decision = self.decider.decide(&snapshot).await?;
            if decision.kind() == ScaleKind::None {
                self.sink
                    .record(ScalingEvent::not_scaling(revision, Some(current)));
                continue;
            }

            info!(
                service = %name,
                revision = %snapshot.revision,
                decision = %decision.kind(),
                target = ?decision.target().map(|t| t.name.as_str()),
                "scaling workload"
            );

            // mark before spawning so no second applier can start
            self.workloads
                .set_service_label(&name, SCALING_LABEL, SCALING_IN_PROGRESS)
                .await?;
            self.spawn_applier(decision, snapshot, cancel.clone());
            break;
        }

        Ok(())
    }

    fn spawn_applier(
        &self,
        decision: crate::decider::ScaleDecision,
        snapshot: WorkloadSnapshot,
        cancel: CancellationToken,
    ) {
        let requirements = self.decider.requirements(&decision);
        let applier = self.applier.clone();
        let workloads = self.workloads.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::canceled("scaling aborted by shutdown")),
                result = applier.apply(&decision, requirements.as_ref(), &snapshot) => result,
            };

            match &result {
                Ok(()) => {
                    info!(
                        service = %snapshot.service,
                        revision = %snapshot.revision,
                        "scaling complete"
                    );
                    sink.record(ScalingEvent::scaled(
                        snapshot.revision.clone(),
                        decision.kind(),
                        decision.target().cloned(),
                    ));
                }
                Err(e) => {
                    warn!(
                        service = %snapshot.service,
                        revision = %snapshot.revision,
                        "scaling failed: {}",
                        e
                    );
                }
            }

            // always release the marker so the next tick can retry
            if let Err(e) = workloads
                .set_service_label(&snapshot.service, SCALING_LABEL, SCALING_DONE)
                .await
            {
                warn!(service = %snapshot.service, "failed to clear scaling marker: {}", e);
            }
        });
    }
}
