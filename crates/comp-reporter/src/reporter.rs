//! The GPU reporter daemon
//!
//! Watches pod events on the local node. Newly-scheduled slice pods get the
//! `gpuIDs` label naming the physical devices their slices landed on; after
//! every reconciliation the node's max-free-tier and per-GPU free-slice
//! labels are recomputed from the current allocations.

use crate::allocations::PodResourcesSource;
use crate::devices::AcceleratorLibrary;
use comp_core::labels::{
    gpu_status_label, GPU_ID_LABEL, GPU_STATUS_LABEL_PREFIX, MAX_FREE_TIER_LABEL,
    PARTITION_CONFIG_LABEL,
};
use comp_core::tier::parse_mig_geometry;
use comp_core::{Error, PartitionProfiles, Result};
use comp_kube::util::pod_requests_slice;
use comp_kube::{NodeApi, PodApi};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables of the reporter daemon
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    /// Name of the node this daemon runs on
    pub node_name: String,

    /// How often a missing allocation entry is retried before giving up
    pub gpu_id_retries: u32,

    /// Backoff between allocation lookups
    pub retry_interval: Duration,
}

impl ReporterSettings {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            gpu_id_retries: 5,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Per-node reporter of slice placements and free capacity
pub struct GpuReporter {
    pods: Arc<dyn PodApi>,
    nodes: Arc<dyn NodeApi>,
    source: Arc<dyn PodResourcesSource>,
    library: Arc<dyn AcceleratorLibrary>,
    profiles: PartitionProfiles,
    settings: ReporterSettings,
}

impl GpuReporter {
    pub fn new(
        pods: Arc<dyn PodApi>,
        nodes: Arc<dyn NodeApi>,
        source: Arc<dyn PodResourcesSource>,
        library: Arc<dyn AcceleratorLibrary>,
        profiles: PartitionProfiles,
        settings: ReporterSettings,
    ) -> Self {
        Self {
            pods,
            nodes,
            source,
            library,
            profiles,
            settings,
        }
    }

    /// Watch local pod events until shutdown
    pub async fn run(&self, client: kube::Client, cancel: CancellationToken) -> Result<()> {
        let api: Api<Pod> = Api::all(client);
        let config = watcher::Config::default()
            .fields(&format!("spec.nodeName={}", self.settings.node_name));
        let mut stream = Box::pin(watcher(api, config));

        info!(node = %self.settings.node_name, "GPU reporter watching local pods");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(pod)))
                    | Ok(Some(watcher::Event::InitApply(pod))) => {
                        if let Err(e) = self.reconcile_pod(&pod).await {
                            warn!(
                                pod = pod.metadata.name.as_deref().unwrap_or_default(),
                                "pod reconciliation failed: {}", e
                            );
                        }
                        self.refresh_labels_logged().await;
                    }
                    Ok(Some(watcher::Event::Delete(_))) => {
                        self.refresh_labels_logged().await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        warn!("pod watch error, retrying: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    async fn refresh_labels_logged(&self) {
        if let Err(e) = self.refresh_node_labels().await {
            warn!(node = %self.settings.node_name, "node label refresh failed: {}", e);
        }
    }

    /// Label a locally-scheduled slice pod with its physical GPU indices
    pub async fn reconcile_pod(&self, pod: &Pod) -> Result<()> {
        let on_local_node = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            == Some(self.settings.node_name.as_str());
        if !on_local_node || !pod_requests_slice(pod) {
            return Ok(());
        }

        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let gpu_ids = self.resolve_gpu_ids(&uid).await?;
        let joined = gpu_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods
            .patch_labels(
                namespace,
                name,
                BTreeMap::from([(GPU_ID_LABEL.to_string(), joined.clone())]),
            )
            .await?;
        info!(pod = name, gpu_ids = %joined, "labeled pod with physical GPUs");
        Ok(())
    }

    /// Resolve the pod's granted devices to GPU indices, retrying while the
    /// kubelet has not recorded the allocation yet
    async fn resolve_gpu_ids(&self, pod_uid: &str) -> Result<Vec<u32>> {
        let mut attempt = 0;
        loop {
            match self.lookup_gpu_ids(pod_uid).await {
                Ok(gpu_ids) if !gpu_ids.is_empty() => return Ok(gpu_ids),
                result => {
                    if attempt >= self.settings.gpu_id_retries {
                        return match result {
                            Err(e) => Err(e),
                            Ok(_) => Err(Error::device(format!(
                                "no devices recorded for pod {}",
                                pod_uid
                            ))),
                        };
                    }
                    attempt += 1;
                    debug!(pod_uid, attempt, "allocation not visible yet, retrying");
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
            }
        }
    }

    async fn lookup_gpu_ids(&self, pod_uid: &str) -> Result<Vec<u32>> {
        let mut gpu_ids = Vec::new();
        for allocation in self.source.allocations().await? {
            if allocation.pod_uid != pod_uid {
                continue;
            }
            for device_id in &allocation.device_ids {
                let index = self.library.gpu_index(device_id)?;
                if !gpu_ids.contains(&index) {
                    gpu_ids.push(index);
                }
            }
        }
        Ok(gpu_ids)
    }

    /// Recompute the node's max-free-tier and per-GPU free-slice labels
    pub async fn refresh_node_labels(&self) -> Result<()> {
        let allocations = self.source.allocations().await?;

        let mut allocated: BTreeMap<String, i64> = BTreeMap::new();
        let mut used_per_device: BTreeMap<u32, BTreeMap<String, i64>> = BTreeMap::new();
        for allocation in &allocations {
            for device_id in &allocation.device_ids {
                let profile = match self.library.slice_profile(device_id) {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!(device = %device_id, "cannot resolve slice profile: {}", e);
                        continue;
                    }
                };
                *allocated.entry(profile.clone()).or_insert(0) += 1;
                if let Ok(index) = self.library.gpu_index(device_id) {
                    *used_per_device
                        .entry(index)
                        .or_default()
                        .entry(profile)
                        .or_insert(0) += 1;
                }
            }
        }

        let node = self.nodes.get(&self.settings.node_name).await?;
        let node_labels = node.metadata.labels.unwrap_or_default();
        let active_profile = node_labels
            .get(PARTITION_CONFIG_LABEL)
            .cloned()
            .unwrap_or_default();

        let mut patch: BTreeMap<String, Option<String>> = BTreeMap::new();
        for key in node_labels.keys() {
            if key.starts_with(GPU_STATUS_LABEL_PREFIX) {
                patch.insert(key.clone(), None);
            }
        }

        for (device, tiers) in self.profiles.device_layout(&active_profile) {
            for (tier, capacity) in tiers {
                let used = used_per_device
                    .get(&device)
                    .and_then(|counts| counts.get(&tier))
                    .copied()
                    .unwrap_or(0);
                let free = capacity as i64 - used;
                if free > 0 {
                    patch.insert(gpu_status_label(device, &tier), Some(free.to_string()));
                }
            }
        }

        let max_free = max_free_tier(&self.profiles, &allocated).unwrap_or_default();
        debug!(node = %self.settings.node_name, max_free = %max_free, "recomputed free capacity");
        patch.insert(MAX_FREE_TIER_LABEL.to_string(), Some(max_free));

        self.nodes
            .patch_labels(&self.settings.node_name, patch)
            .await
    }
}

/// The largest slice tier some profile could still offer given the current
/// allocations. For each profile whose enabled capacity covers every
/// allocated tier, the lexicographically-last tier with a surplus is that
/// profile's candidate; the largest candidate by compute weight wins.
pub fn max_free_tier(
    profiles: &PartitionProfiles,
    allocated: &BTreeMap<String, i64>,
) -> Option<String> {
    let mut best: Option<String> = None;
    for profile in profiles.mig_configs.keys() {
        let capacity = enabled_capacity(profiles, profile);

        let covered = allocated
            .iter()
            .all(|(tier, count)| capacity.get(tier).copied().unwrap_or(0) >= *count);
        if !covered {
            continue;
        }

        let mut surplus: Vec<&String> = capacity
            .iter()
            .filter(|(tier, count)| **count > allocated.get(*tier).copied().unwrap_or(0))
            .map(|(tier, _)| tier)
            .collect();
        surplus.sort();
        let Some(candidate) = surplus.last().map(|tier| tier.to_string()) else {
            continue;
        };

        best = match best {
            Some(current) if !tier_exceeds(&candidate, &current) => Some(current),
            _ => Some(candidate),
        };
    }
    best
}

/// Per-tier capacity of a profile, counting only partition-enabled devices
fn enabled_capacity(profiles: &PartitionProfiles, profile: &str) -> BTreeMap<String, i64> {
    let mut capacity = BTreeMap::new();
    if let Some(groups) = profiles.mig_configs.get(profile) {
        for group in groups.iter().filter(|group| group.mig_enabled) {
            for (tier, count) in &group.mig_devices {
                *capacity.entry(tier.clone()).or_insert(0) +=
                    *count as i64 * group.devices.len() as i64;
            }
        }
    }
    capacity
}

/// Compare short tier names by compute weight
fn tier_exceeds(a: &str, b: &str) -> bool {
    let weight = |name: &str| parse_mig_geometry(name).map(|(compute, _)| compute).unwrap_or(0.0);
    weight(a) > weight(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocations::{DeviceAllocation, MockPodResources};
    use crate::devices::{MigDevice, StaticLibrary};
    use comp_kube::mock::{node_fixture, MockCluster, PodBuilder};

    const PROFILE_YAML: &str = r#"
version: v1
mig-configs:
  all-3g:
    - devices: [0, 1]
      mig-enabled: true
      mig-devices:
        3g.20gb: 2
  mixed:
    - devices: [0]
      mig-enabled: true
      mig-devices:
        3g.20gb: 2
    - devices: [1]
      mig-enabled: true
      mig-devices:
        1g.5gb: 7
  all-1g:
    - devices: [0, 1]
      mig-enabled: true
      mig-devices:
        1g.5gb: 7
"#;

    fn profiles() -> PartitionProfiles {
        PartitionProfiles::from_yaml(PROFILE_YAML).unwrap()
    }

    fn allocation(pod_uid: &str, device_ids: &[&str]) -> DeviceAllocation {
        DeviceAllocation {
            pod_uid: pod_uid.to_string(),
            container: "serving".to_string(),
            resource: "nvidia.com/mig-1g.5gb".to_string(),
            device_ids: device_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn reporter(
        cluster: Arc<MockCluster>,
        source: Arc<MockPodResources>,
        library: StaticLibrary,
    ) -> GpuReporter {
        let mut settings = ReporterSettings::new("node-r");
        settings.gpu_id_retries = 1;
        settings.retry_interval = Duration::from_millis(1);
        GpuReporter::new(
            cluster.clone(),
            cluster,
            source,
            Arc::new(library),
            profiles(),
            settings,
        )
    }

    #[test]
    fn test_max_free_tier_with_no_allocations() {
        let best = max_free_tier(&profiles(), &BTreeMap::new());
        assert_eq!(best.as_deref(), Some("3g.20gb"));
    }

    #[test]
    fn test_max_free_tier_accounts_for_allocations() {
        let mut allocated = BTreeMap::new();
        allocated.insert("3g.20gb".to_string(), 2);
        // all-3g still has two 3g free; mixed can only offer 1g
        assert_eq!(
            max_free_tier(&profiles(), &allocated).as_deref(),
            Some("3g.20gb")
        );

        allocated.insert("3g.20gb".to_string(), 4);
        // only all-3g covers four 3g slices and it has nothing left
        assert_eq!(max_free_tier(&profiles(), &allocated), None);
    }

    #[test]
    fn test_max_free_tier_mixed_demand() {
        let mut allocated = BTreeMap::new();
        allocated.insert("3g.20gb".to_string(), 2);
        allocated.insert("1g.5gb".to_string(), 1);
        // only mixed covers both tiers; its surplus still includes 1g
        assert_eq!(
            max_free_tier(&profiles(), &allocated).as_deref(),
            Some("1g.5gb")
        );
    }

    #[tokio::test]
    async fn test_reconcile_pod_labels_gpu_ids() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture("node-r", &[], &[]));
        cluster.add_pod(
            PodBuilder::new("slice-pod")
                .on_node("node-r")
                .uid("uid-1")
                .slice("nvidia.com/mig-1g.5gb", 2)
                .build(),
        );

        let source = Arc::new(MockPodResources::new());
        source.set(vec![allocation("uid-1", &["MIG-a", "MIG-b"])]);
        let library = StaticLibrary::with_devices(vec![
            MigDevice {
                uuid: "MIG-a".into(),
                gpu_index: 0,
                profile: "1g.5gb".into(),
            },
            MigDevice {
                uuid: "MIG-b".into(),
                gpu_index: 0,
                profile: "1g.5gb".into(),
            },
        ]);

        let reporter = reporter(cluster.clone(), source, library);
        let pod = cluster.pod("default", "slice-pod").unwrap();
        reporter.reconcile_pod(&pod).await.unwrap();

        let labels = cluster.pod("default", "slice-pod").unwrap().metadata.labels.unwrap();
        // both slices sit on the same physical GPU
        assert_eq!(labels.get(GPU_ID_LABEL).map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_reconcile_pod_ignores_foreign_and_plain_pods() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture("node-r", &[], &[]));
        let source = Arc::new(MockPodResources::new());
        let reporter = reporter(cluster.clone(), source, StaticLibrary::new());

        let elsewhere = PodBuilder::new("far")
            .on_node("node-z")
            .slice("nvidia.com/mig-1g.5gb", 1)
            .build();
        reporter.reconcile_pod(&elsewhere).await.unwrap();

        let plain = PodBuilder::new("cpu-only").on_node("node-r").build();
        reporter.reconcile_pod(&plain).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_gpu_ids_exhausts_retries() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture("node-r", &[], &[]));
        cluster.add_pod(
            PodBuilder::new("slice-pod")
                .on_node("node-r")
                .uid("uid-1")
                .slice("nvidia.com/mig-1g.5gb", 1)
                .build(),
        );

        let reporter = reporter(
            cluster.clone(),
            Arc::new(MockPodResources::new()),
            StaticLibrary::new(),
        );
        let pod = cluster.pod("default", "slice-pod").unwrap();
        let err = reporter.reconcile_pod(&pod).await.unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }

    #[tokio::test]
    async fn test_refresh_node_labels() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture(
            "node-r",
            &[],
            &[
                (PARTITION_CONFIG_LABEL, "mixed"),
                ("kubecomp.com/status-gpu-9-7g.40gb-free", "1"),
            ],
        ));

        let source = Arc::new(MockPodResources::new());
        source.set(vec![allocation("uid-1", &["MIG-a", "MIG-b"])]);
        let library = StaticLibrary::with_devices(vec![
            MigDevice {
                uuid: "MIG-a".into(),
                gpu_index: 1,
                profile: "1g.5gb".into(),
            },
            MigDevice {
                uuid: "MIG-b".into(),
                gpu_index: 1,
                profile: "1g.5gb".into(),
            },
        ]);

        let reporter = reporter(cluster.clone(), source, library);
        reporter.refresh_node_labels().await.unwrap();

        let labels = cluster.node("node-r").unwrap().metadata.labels.unwrap();
        // stale detail label removed, fresh ones written
        assert!(!labels.contains_key("kubecomp.com/status-gpu-9-7g.40gb-free"));
        assert_eq!(
            labels
                .get("kubecomp.com/status-gpu-0-3g.20gb-free")
                .map(String::as_str),
            Some("2")
        );
        assert_eq!(
            labels
                .get("kubecomp.com/status-gpu-1-1g.5gb-free")
                .map(String::as_str),
            Some("5")
        );
        // two 1g slices in use: the mixed profile still has a 3g surplus
        assert_eq!(
            labels.get(MAX_FREE_TIER_LABEL).map(String::as_str),
            Some("3g.20gb")
        );
    }
}
