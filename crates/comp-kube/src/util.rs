//! Pod inspection helpers shared by the control loops

use comp_core::labels;
use comp_core::tier::{SliceTier, MIG_RESOURCE_PREFIX};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;

/// Name/namespace pair identifying a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Build a reference from a pod object
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read a label off a pod
pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// Whether the pod is running, ready, and not being deleted
pub fn pod_is_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match status.conditions.as_ref() {
        Some(conditions) => conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True"),
        None => true,
    }
}

/// Whether the pod has finished (succeeded or failed)
pub fn pod_is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// The slice tier requested by the pod's first container, if any.
///
/// A pod backed by a CUDA process holds at most one slice, so the first
/// parseable slice resource with a positive count wins.
pub fn pod_slice_request(pod: &Pod) -> Option<SliceTier> {
    let container = pod.spec.as_ref()?.containers.first()?;
    let requests = container.resources.as_ref()?.requests.as_ref()?;
    requests.iter().find_map(|(resource, quantity)| {
        if quantity_value(quantity) > 0 {
            SliceTier::parse(resource)
        } else {
            None
        }
    })
}

/// Whether any container of the pod requests a hardware slice
pub fn pod_requests_slice(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers.iter().any(|container| {
        container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(|requests| requests.keys().any(|r| r.starts_with(MIG_RESOURCE_PREFIX)))
            .unwrap_or(false)
    })
}

/// Sum the hardware-slice requests across all containers of a pod.
/// Keys are full resource names.
pub fn pod_slice_demand(pod: &Pod) -> BTreeMap<String, i64> {
    let mut demand = BTreeMap::new();
    let Some(spec) = pod.spec.as_ref() else {
        return demand;
    };
    for container in &spec.containers {
        let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        for (resource, quantity) in requests {
            if resource.starts_with(MIG_RESOURCE_PREFIX) {
                *demand.entry(resource.clone()).or_insert(0) += quantity_value(quantity);
            }
        }
    }
    demand
}

/// The physical GPU indices recorded on the pod by the GPU reporter
pub fn pod_gpu_ids(pod: &Pod) -> Vec<u32> {
    pod_label(pod, labels::GPU_ID_LABEL)
        .map(|ids| {
            ids.split(',')
                .filter_map(|id| id.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// The orchestrator-computed template hash of a pod
pub fn pod_template_hash(pod: &Pod) -> Option<&str> {
    pod_label(pod, labels::POD_TEMPLATE_HASH_LABEL)
}

/// Integer value of a resource quantity (slice counts are plain integers)
pub fn quantity_value(quantity: &Quantity) -> i64 {
    quantity.0.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, PodCondition, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn slice_pod(name: &str, resource: &str) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert(resource.to_string(), Quantity("1".to_string()));
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "serving".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests.clone()),
                        limits: Some(requests),
                        ..ResourceRequirements::default()
                    }),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
        }
    }

    #[test]
    fn test_pod_is_ready() {
        let mut pod = slice_pod("p", "nvidia.com/mig-1g.5gb");
        assert!(pod_is_ready(&pod));

        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!pod_is_ready(&pod));

        let mut pending = slice_pod("p", "nvidia.com/mig-1g.5gb");
        pending.status.as_mut().unwrap().phase = Some("Pending".to_string());
        assert!(!pod_is_ready(&pending));
    }

    #[test]
    fn test_pod_slice_request() {
        let pod = slice_pod("p", "nvidia.com/mig-2g.10gb");
        let tier = pod_slice_request(&pod).unwrap();
        assert_eq!(tier.name, "nvidia.com/mig-2g.10gb");

        let plain = slice_pod("p", "example.com/fpga");
        assert!(pod_slice_request(&plain).is_none());
    }

    #[test]
    fn test_pod_slice_demand() {
        let pod = slice_pod("p", "nvidia.com/mig-3g.20gb");
        let demand = pod_slice_demand(&pod);
        assert_eq!(demand.get("nvidia.com/mig-3g.20gb"), Some(&1));
        assert!(pod_requests_slice(&pod));
    }

    #[test]
    fn test_pod_gpu_ids() {
        let mut pod = slice_pod("p", "nvidia.com/mig-1g.5gb");
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(labels::GPU_ID_LABEL.to_string(), "0,2".to_string());
        assert_eq!(pod_gpu_ids(&pod), vec![0, 2]);

        let bare = slice_pod("p", "nvidia.com/mig-1g.5gb");
        assert!(pod_gpu_ids(&bare).is_empty());
    }

    #[test]
    fn test_quantity_value() {
        assert_eq!(quantity_value(&Quantity("2".to_string())), 2);
        assert_eq!(quantity_value(&Quantity("garbage".to_string())), 0);
    }
}
