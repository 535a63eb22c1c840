//! Partition reconfigurator
//!
//! Node-watch reconciler that reacts when a node is labeled with a pending
//! pod's identity: verifies the pod is still unscheduled, taints the node,
//! picks the partition profile that covers the aggregate slice demand with
//! the fewest evictions, evicts exactly the pods on re-sliced devices,
//! flips the partitioning-agent label, and waits for completion.

use crate::selector::{pod_locations, short_demand, slice_demand};
use comp_core::labels::{
    PARTITION_CONFIG_LABEL, PARTITION_STATE_FAILED, PARTITION_STATE_LABEL,
    PARTITION_STATE_PENDING, RECONFIG_STATE_TAINT, TARGET_NAMESPACE_LABEL, TARGET_POD_LABEL,
};
use comp_core::{Error, PartitionProfiles, PinQueue, Result};
use comp_kube::util::{pod_template_hash, PodRef};
use comp_kube::wait::wait_until;
use comp_kube::{NodeApi, PodApi};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::api::Api;
use kube::runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables of the reconfigurator
#[derive(Debug, Clone)]
pub struct ReconfigSettings {
    /// Poll cadence for the partitioning agent's completion
    pub completion_poll: Duration,

    /// Poll cadence while waiting for evicted pods to disappear
    pub deletion_poll: Duration,

    /// Namespace the GPU reporter daemon runs in
    pub reporter_namespace: String,

    /// Name of the reporter DaemonSet
    pub reporter_daemonset: String,
}

impl Default for ReconfigSettings {
    fn default() -> Self {
        Self {
            completion_poll: Duration::from_secs(3),
            deletion_poll: Duration::from_secs(1),
            reporter_namespace: "gpu-operator".to_string(),
            reporter_daemonset: "reporter".to_string(),
        }
    }
}

/// The partition reconfigurator
pub struct ReconfigController {
    nodes: Arc<dyn NodeApi>,
    pods: Arc<dyn PodApi>,
    profiles: PartitionProfiles,
    pins: Arc<PinQueue>,
    settings: ReconfigSettings,
}

impl ReconfigController {
    pub fn new(
        nodes: Arc<dyn NodeApi>,
        pods: Arc<dyn PodApi>,
        profiles: PartitionProfiles,
        pins: Arc<PinQueue>,
        settings: ReconfigSettings,
    ) -> Self {
        Self {
            nodes,
            pods,
            profiles,
            pins,
            settings,
        }
    }

    /// Watch nodes and reconcile whenever the target-pod labels change.
    /// Different nodes reconcile independently; per node, the pending taint
    /// serializes overlapping triggers.
    pub async fn run(&self, client: kube::Client, cancel: CancellationToken) -> Result<()> {
        let api: Api<Node> = Api::all(client);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        let mut seen: HashMap<String, (String, String)> = HashMap::new();

        info!("partition reconfigurator watching nodes");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(node)))
                    | Ok(Some(watcher::Event::InitApply(node))) => {
                        self.observe_node(&node, &mut seen, &cancel).await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        warn!("node watch error, retrying: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    async fn observe_node(
        &self,
        node: &Node,
        seen: &mut HashMap<String, (String, String)>,
        cancel: &CancellationToken,
    ) {
        let name = node.metadata.name.clone().unwrap_or_default();
        let target = target_labels(node);
        let changed = seen.get(&name) != Some(&target);
        seen.insert(name.clone(), target.clone());

        if !changed || target.0.is_empty() {
            return;
        }

        if let Err(e) = self.reconcile(&name, cancel).await {
            warn!(node = %name, "reconfiguration failed: {}", e);
        }
    }

    /// Run one reconfiguration for a node. No-op when the target pod is
    /// gone or already scheduled.
    pub async fn reconcile(&self, node_name: &str, cancel: &CancellationToken) -> Result<()> {
        let node = self.nodes.get(node_name).await?;
        let (target_pod, target_namespace) = target_labels(&node);
        if target_pod.is_empty() || target_namespace.is_empty() {
            return Ok(());
        }

        // the pod must still exist and be unscheduled
        let target = match self.pods.get(&target_namespace, &target_pod).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                info!(node = node_name, pod = %target_pod, "target pod gone, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if target
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some()
        {
            info!(node = node_name, pod = %target_pod, "target pod already scheduled");
            return Ok(());
        }

        info!(
            node = node_name,
            pod = %target_pod,
            namespace = %target_namespace,
            "reconfiguring node partitioning"
        );

        self.add_pending_taint(node_name).await?;
        let outcome = self.reconfigure(node_name, &target, cancel).await;
        if let Err(e) = self.remove_pending_taint(node_name).await {
            warn!(node = node_name, "failed to remove pending taint: {}", e);
        }
        outcome
    }

    async fn reconfigure(
        &self,
        node_name: &str,
        target: &Pod,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pods_on_node = self.pods.list_on_node(node_name).await?;
        let locations = pod_locations(&pods_on_node);
        let demand = short_demand(&slice_demand(&pods_on_node, target));
        debug!(node = node_name, ?demand, "aggregate slice demand");

        let node = self.nodes.get(node_name).await?;
        let current_profile = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(PARTITION_CONFIG_LABEL))
            .cloned()
            .unwrap_or_default();

        let pods_per_device: HashMap<u32, usize> = locations
            .iter()
            .map(|(device, pods)| (*device, pods.len()))
            .collect();
        let choice = self
            .profiles
            .select(&demand, &pods_per_device, &current_profile)?;
        info!(
            node = node_name,
            profile = %choice.profile,
            reslice = ?choice.reslice,
            "selected partition profile"
        );

        // exactly the pods on re-sliced devices are evicted
        let mut evicted: Vec<PodRef> = Vec::new();
        let mut unique = HashSet::new();
        for device in &choice.reslice {
            for pod in locations.get(device).cloned().unwrap_or_default() {
                if unique.insert(pod.clone()) {
                    evicted.push(pod);
                }
            }
        }
        self.evict_pods(&evicted, node_name, cancel).await?;

        if let Err(e) = self.restart_reporter(node_name).await {
            warn!(node = node_name, "failed to restart GPU reporter: {}", e);
        }

        self.nodes
            .patch_labels(
                node_name,
                [(
                    PARTITION_CONFIG_LABEL.to_string(),
                    Some(choice.profile.clone()),
                )]
                .into(),
            )
            .await?;

        self.wait_for_partition(node_name, cancel).await
    }

    async fn evict_pods(
        &self,
        evicted: &[PodRef],
        node_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for pod_ref in evicted {
            match self.pods.get(&pod_ref.namespace, &pod_ref.name).await {
                Ok(pod) => match pod_template_hash(&pod) {
                    Some(hash) => self.pins.push(hash, node_name),
                    None => info!(pod = %pod_ref, "no template hash, pod will not be re-pinned"),
                },
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }

            info!(pod = %pod_ref, "evicting pod from re-sliced device");
            match self.pods.delete(&pod_ref.namespace, &pod_ref.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        // block until every eviction completed
        wait_until(self.settings.deletion_poll, None, cancel, || {
            let pods = self.pods.clone();
            let evicted = evicted.to_vec();
            async move {
                for pod_ref in &evicted {
                    match pods.get(&pod_ref.namespace, &pod_ref.name).await {
                        Ok(_) => return Ok(None),
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(Some(()))
            }
        })
        .await
    }

    /// Delete the reporter daemon's pod on this node so it restarts with a
    /// fresh view of the new partitioning
    async fn restart_reporter(&self, node_name: &str) -> Result<()> {
        let pods = self.pods.list_on_node(node_name).await?;
        for pod in pods {
            if pod.metadata.namespace.as_deref() != Some(self.settings.reporter_namespace.as_str())
            {
                continue;
            }
            let owned = pod
                .metadata
                .owner_references
                .as_ref()
                .map(|owners| {
                    owners.iter().any(|owner| {
                        owner.kind == "DaemonSet" && owner.name == self.settings.reporter_daemonset
                    })
                })
                .unwrap_or(false);
            if !owned {
                continue;
            }
            let pod_ref = PodRef::from_pod(&pod);
            info!(pod = %pod_ref, "restarting GPU reporter");
            match self.pods.delete(&pod_ref.namespace, &pod_ref.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn wait_for_partition(&self, node_name: &str, cancel: &CancellationToken) -> Result<()> {
        let state = wait_until(self.settings.completion_poll, None, cancel, || {
            let nodes = self.nodes.clone();
            let node_name = node_name.to_string();
            async move {
                let node = nodes.get(&node_name).await?;
                let state = node
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(PARTITION_STATE_LABEL))
                    .cloned()
                    .unwrap_or_default();
                if state == PARTITION_STATE_PENDING {
                    Ok(None)
                } else {
                    Ok(Some(state))
                }
            }
        })
        .await?;

        if state == PARTITION_STATE_FAILED {
            return Err(Error::PartitionFailed(format!(
                "partitioning agent reported failure on {}",
                node_name
            )));
        }
        info!(node = node_name, state = %state, "partitioning agent finished");
        Ok(())
    }

    async fn add_pending_taint(&self, node_name: &str) -> Result<()> {
        let mut node = self.nodes.get(node_name).await?;
        let spec = node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        if taints.iter().any(|taint| taint.key == RECONFIG_STATE_TAINT) {
            return Err(Error::conflict(format!(
                "reconfiguration already in progress on {}",
                node_name
            )));
        }
        taints.push(Taint {
            key: RECONFIG_STATE_TAINT.to_string(),
            value: Some(PARTITION_STATE_PENDING.to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        self.nodes.update(&node).await?;
        Ok(())
    }

    async fn remove_pending_taint(&self, node_name: &str) -> Result<()> {
        let mut node = self.nodes.get(node_name).await?;
        if let Some(taints) = node.spec.as_mut().and_then(|spec| spec.taints.as_mut()) {
            taints.retain(|taint| taint.key != RECONFIG_STATE_TAINT);
        }
        self.nodes.update(&node).await?;
        Ok(())
    }
}

fn target_labels(node: &Node) -> (String, String) {
    let labels = node.metadata.labels.as_ref();
    (
        labels
            .and_then(|l| l.get(TARGET_POD_LABEL))
            .cloned()
            .unwrap_or_default(),
        labels
            .and_then(|l| l.get(TARGET_NAMESPACE_LABEL))
            .cloned()
            .unwrap_or_default(),
    )
}
