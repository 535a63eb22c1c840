//! Demand and placement views used by profile selection

use comp_core::tier::short_slice_name;
use comp_kube::util::{pod_gpu_ids, pod_is_terminated, pod_slice_demand, PodRef};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap};

/// Which pods occupy which physical device, read off the `gpuIDs` labels
/// maintained by the GPU reporter
pub fn pod_locations(pods: &[Pod]) -> HashMap<u32, Vec<PodRef>> {
    let mut locations: HashMap<u32, Vec<PodRef>> = HashMap::new();
    for pod in pods {
        for device in pod_gpu_ids(pod) {
            locations.entry(device).or_default().push(PodRef::from_pod(pod));
        }
    }
    locations
}

/// Aggregate slice demand on a node: requests of every non-terminated pod
/// plus the target pod's own request. Keys are full resource names.
pub fn slice_demand(pods: &[Pod], target: &Pod) -> BTreeMap<String, i64> {
    let mut demand = BTreeMap::new();
    for pod in pods.iter().filter(|pod| !pod_is_terminated(pod)) {
        merge_demand(&mut demand, pod_slice_demand(pod));
    }
    merge_demand(&mut demand, pod_slice_demand(target));
    demand
}

/// Map a demand keyed by full resource names to the short tier names the
/// partition profiles use
pub fn short_demand(demand: &BTreeMap<String, i64>) -> BTreeMap<String, i64> {
    demand
        .iter()
        .map(|(resource, count)| (short_slice_name(resource).to_string(), *count))
        .collect()
}

fn merge_demand(into: &mut BTreeMap<String, i64>, from: BTreeMap<String, i64>) {
    for (resource, count) in from {
        *into.entry(resource).or_insert(0) += count;
    }
}
