//! Label, annotation, and taint keys written to cluster objects
//!
//! Ownership rules: the autoscaler exclusively owns [`SCALING_LABEL`] on
//! workload services; the partitioning agent exclusively owns
//! [`PARTITION_STATE_LABEL`] on nodes (KubeComp only reads it); the GPU
//! reporter exclusively owns [`GPU_ID_LABEL`] on pods scheduled to its node.

/// Node label naming the pod a reconfiguration is being triggered for
pub const TARGET_POD_LABEL: &str = "targetPod";

/// Node label naming the target pod's namespace
pub const TARGET_NAMESPACE_LABEL: &str = "targetNamespace";

/// Taint key guarding a node during partition reconfiguration
pub const RECONFIG_STATE_TAINT: &str = "kubecomp.com/reconfig.state";

/// Node label selecting the partitioning agent's active profile
pub const PARTITION_CONFIG_LABEL: &str = "nvidia.com/mig.config";

/// Node label reporting the partitioning agent's progress (read-only)
pub const PARTITION_STATE_LABEL: &str = "nvidia.com/mig.config.state";

/// Partitioning agent state while a reconfiguration is in flight
pub const PARTITION_STATE_PENDING: &str = "pending";

/// Partitioning agent state after a failed reconfiguration
pub const PARTITION_STATE_FAILED: &str = "failed";

/// Pod label marking that the preprocessor has handled the pod
pub const PREPROCESS_LABEL: &str = "preprocess";

/// Value of [`PREPROCESS_LABEL`] once preprocessing is complete
pub const PREPROCESS_DONE: &str = "done";

/// Pod label pinning a recreated pod to its original node
pub const NODE_AFFINITY_LABEL: &str = "expectedNode";

/// Pod label listing the physical GPU indices granted to the pod
pub const GPU_ID_LABEL: &str = "gpuIDs";

/// Orchestrator-computed hash identifying pods sharing a template
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Node label publishing the largest slice tier still free on the node
pub const MAX_FREE_TIER_LABEL: &str = "kubecomp.com/max-mig";

/// Prefix of the per-GPU free-slice detail node labels
pub const GPU_STATUS_LABEL_PREFIX: &str = "kubecomp.com/status-gpu";

/// Workload service label marking an in-flight scaling operation
pub const SCALING_LABEL: &str = "auto-scaler";

/// Value of [`SCALING_LABEL`] while an applier task is running
pub const SCALING_IN_PROGRESS: &str = "scaling";

/// Value of [`SCALING_LABEL`] once the applier task has finished
pub const SCALING_DONE: &str = "done";

/// Pod template label carrying the workload's latency objective
pub const SLO_LABEL: &str = "slo";

/// Standard application label used to derive the metric-config family key
pub const APP_LABEL: &str = "app";

/// Knative-owned pod label naming the owning service
pub const KNATIVE_SERVICE_LABEL: &str = "serving.knative.dev/service";

/// Knative-owned pod label naming the owning revision
pub const KNATIVE_REVISION_LABEL: &str = "serving.knative.dev/revision";

/// Service annotation stamped on every resource change so the orchestrator
/// materializes a new revision
pub const UPDATED_AT_ANNOTATION: &str = "kubecomp.com/updated-at";

/// Build the per-GPU free-slice detail label key for one device and tier
pub fn gpu_status_label(gpu_index: u32, tier_short_name: &str) -> String {
    format!("{}-{}-{}-free", GPU_STATUS_LABEL_PREFIX, gpu_index, tier_short_name)
}

/// Derive the metric-config family key from a pod's `app` label.
///
/// Application families share one metric configuration; the family key is
/// the app label up to the first dash (`llama-7b-00001` -> `llama`).
pub fn app_family(app_label: &str) -> Option<&str> {
    let family = app_label.split('-').next().unwrap_or_default();
    if family.is_empty() {
        None
    } else {
        Some(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_family() {
        assert_eq!(app_family("llama-7b-00001"), Some("llama"));
        assert_eq!(app_family("bert"), Some("bert"));
        assert_eq!(app_family(""), None);
        assert_eq!(app_family("-suffix"), None);
    }

    #[test]
    fn test_gpu_status_label() {
        assert_eq!(
            gpu_status_label(1, "3g.20gb"),
            "kubecomp.com/status-gpu-1-3g.20gb-free"
        );
    }
}
