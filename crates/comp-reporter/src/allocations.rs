//! Device allocation source
//!
//! The kubelet records which device-plugin devices each running pod was
//! granted. The reporter consumes that state through this seam to resolve
//! slice placements and compute free-capacity labels.

use async_trait::async_trait;
use comp_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Default location of the kubelet's device-manager state
pub const DEFAULT_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

/// Devices granted to one container of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAllocation {
    /// UID of the owning pod
    pub pod_uid: String,

    /// Container the devices were granted to
    pub container: String,

    /// Device-plugin resource name
    pub resource: String,

    /// Granted device identifiers (MIG device UUIDs for slices)
    pub device_ids: Vec<String>,
}

/// Source of the current device allocations on this node
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    /// All current allocations
    async fn allocations(&self) -> Result<Vec<DeviceAllocation>>;
}

/// Reader of the kubelet device-manager checkpoint file
pub struct KubeletCheckpoint {
    path: PathBuf,
}

impl KubeletCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for KubeletCheckpoint {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_PATH)
    }
}

#[async_trait]
impl PodResourcesSource for KubeletCheckpoint {
    async fn allocations(&self) -> Result<Vec<DeviceAllocation>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::device(format!(
                "cannot read kubelet device state {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let checkpoint: CheckpointFile = serde_json::from_str(&contents)
            .map_err(|e| Error::device(format!("malformed kubelet device state: {}", e)))?;

        Ok(checkpoint
            .data
            .pod_device_entries
            .unwrap_or_default()
            .into_iter()
            .map(|entry| DeviceAllocation {
                pod_uid: entry.pod_uid,
                container: entry.container_name,
                resource: entry.resource_name,
                device_ids: entry
                    .device_ids
                    .into_values()
                    .flatten()
                    .collect(),
            })
            .collect())
    }
}

/// Kubelet device-manager checkpoint structure
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckpointFile {
    data: CheckpointData,
    #[allow(dead_code)]
    checksum: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckpointData {
    pod_device_entries: Option<Vec<PodDeviceEntry>>,
    #[serde(default)]
    #[allow(dead_code)]
    registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodDeviceEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    container_name: String,
    resource_name: String,
    /// key is the NUMA index (usually "-1"), value the granted device IDs
    #[serde(rename = "DeviceIDs")]
    device_ids: HashMap<String, Vec<String>>,
}

/// In-memory allocation source for tests and development
#[derive(Debug, Default)]
pub struct MockPodResources {
    allocations: Mutex<Vec<DeviceAllocation>>,
}

impl MockPodResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, allocations: Vec<DeviceAllocation>) {
        *self.allocations.lock().unwrap() = allocations;
    }
}

#[async_trait]
impl PodResourcesSource for MockPodResources {
    async fn allocations(&self) -> Result<Vec<DeviceAllocation>> {
        Ok(self.allocations.lock().unwrap().clone())
    }
}
