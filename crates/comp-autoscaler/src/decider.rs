//! Scale decider
//!
//! Turns a workload snapshot into a scale decision and the concrete
//! resource requirements of the new revision. The reactive policy only
//! emits up/down; scale-out and scale-in are reserved for external
//! invocation and share the same machinery.

use crate::fetcher::MetricSample;
use crate::registry::SliceTierRegistry;
use comp_core::tier::SliceTier;
use comp_core::{Error, Result, ScaleKind};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything known about one workload at decision time
#[derive(Debug, Clone)]
pub struct WorkloadSnapshot {
    /// Owning service name
    pub service: String,

    /// Revision the inspected pod belongs to
    pub revision: String,

    /// The inspected pod
    pub pod: String,

    /// Slice tier the pod currently holds
    pub current: SliceTier,

    /// Fetched metric values with their descriptors
    pub metrics: Vec<MetricSample>,
}

impl WorkloadSnapshot {
    /// SLO of the primary (first configured) metric, if any
    pub fn primary_slo(&self) -> Option<f64> {
        self.metrics.first().map(|sample| sample.spec.slo)
    }
}

/// A scale decision with its target tier
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    /// Nothing to do
    None,
    /// Move to the adjacent larger tier
    Up(SliceTier),
    /// Move to the adjacent smaller tier
    Down(SliceTier),
    /// Add a revision on the same tier
    Out(SliceTier),
    /// Retire the revision
    In,
}

impl ScaleDecision {
    /// The decision's direction tag
    pub fn kind(&self) -> ScaleKind {
        match self {
            ScaleDecision::None => ScaleKind::None,
            ScaleDecision::Up(_) => ScaleKind::Up,
            ScaleDecision::Down(_) => ScaleKind::Down,
            ScaleDecision::Out(_) => ScaleKind::Out,
            ScaleDecision::In => ScaleKind::In,
        }
    }

    /// The target tier, when the decision carries one
    pub fn target(&self) -> Option<&SliceTier> {
        match self {
            ScaleDecision::Up(tier) | ScaleDecision::Down(tier) | ScaleDecision::Out(tier) => {
                Some(tier)
            }
            ScaleDecision::None | ScaleDecision::In => None,
        }
    }
}

/// CPU and memory written into every new revision
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefaults {
    pub cpu: String,
    pub memory: String,
}

/// Metric-to-decision policy plus tier lookup
pub struct ScaleDecider {
    registry: Arc<SliceTierRegistry>,
    defaults: ResourceDefaults,
}

impl ScaleDecider {
    pub fn new(registry: Arc<SliceTierRegistry>, defaults: ResourceDefaults) -> Self {
        Self { registry, defaults }
    }

    /// Decide for the reactive policy.
    ///
    /// Per metric: NaN or a value below `slo * down_factor` asks for a
    /// smaller slice; a value above `slo * up_factor` asks for a larger
    /// one. Across metrics the worst case wins: up dominates down
    /// dominates none. A candidate without free inventory in the adjacent
    /// tier demotes to no-op.
    pub async fn decide(&self, snapshot: &WorkloadSnapshot) -> Result<ScaleDecision> {
        let candidate = combined_candidate(&snapshot.metrics);
        debug!(
            service = %snapshot.service,
            pod = %snapshot.pod,
            candidate = %candidate,
            "evaluated metric policy"
        );

        match candidate {
            ScaleKind::Up => match self.registry.next_larger(&snapshot.current).await {
                Ok(target) => Ok(ScaleDecision::Up(target)),
                Err(Error::NoAvailableTier(reason)) => {
                    info!(service = %snapshot.service, %reason, "scale up blocked");
                    Ok(ScaleDecision::None)
                }
                Err(e) => Err(e),
            },
            ScaleKind::Down => match self.registry.next_smaller(&snapshot.current).await {
                Ok(target) => Ok(ScaleDecision::Down(target)),
                Err(Error::NoAvailableTier(reason)) => {
                    info!(service = %snapshot.service, %reason, "scale down blocked");
                    Ok(ScaleDecision::None)
                }
                Err(e) => Err(e),
            },
            _ => Ok(ScaleDecision::None),
        }
    }

    /// Decide a scale-out on the current tier (external invocation only)
    pub async fn decide_out(&self, snapshot: &WorkloadSnapshot) -> Result<ScaleDecision> {
        match self.registry.same(&snapshot.current).await {
            Ok(target) => Ok(ScaleDecision::Out(target)),
            Err(Error::NoAvailableTier(reason)) => {
                info!(service = %snapshot.service, %reason, "scale out blocked");
                Ok(ScaleDecision::None)
            }
            Err(e) => Err(e),
        }
    }

    /// The resource requirements realizing a decision: CPU and memory at
    /// the configured defaults plus one unit of the target slice. Prior
    /// slice keys disappear because the whole record is replaced.
    pub fn requirements(&self, decision: &ScaleDecision) -> Option<ResourceRequirements> {
        let target = decision.target()?;
        let mut resources = BTreeMap::new();
        resources.insert("cpu".to_string(), Quantity(self.defaults.cpu.clone()));
        resources.insert("memory".to_string(), Quantity(self.defaults.memory.clone()));
        resources.insert(target.name.clone(), Quantity("1".to_string()));

        Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..ResourceRequirements::default()
        })
    }
}

/// Fold per-metric candidates into one: up dominates down dominates none
fn combined_candidate(metrics: &[MetricSample]) -> ScaleKind {
    let mut combined = ScaleKind::None;
    for sample in metrics {
        let candidate = if sample.value.is_nan()
            || sample.value < sample.spec.slo * sample.spec.scale_down_factor
        {
            ScaleKind::Down
        } else if sample.value > sample.spec.slo * sample.spec.scale_up_factor {
            ScaleKind::Up
        } else {
            ScaleKind::None
        };

        combined = match (combined, candidate) {
            (ScaleKind::Up, _) | (_, ScaleKind::Up) => ScaleKind::Up,
            (ScaleKind::Down, _) | (_, ScaleKind::Down) => ScaleKind::Down,
            _ => ScaleKind::None,
        };
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::MetricSpec;
    use comp_kube::mock::{node_fixture, MockCluster};

    fn sample(value: f64, slo: f64, down: f64, up: f64) -> MetricSample {
        MetricSample {
            spec: MetricSpec {
                name: "mean_time_per_token".into(),
                query: "q".into(),
                slo,
                scale_down_factor: down,
                scale_up_factor: up,
            },
            value,
        }
    }

    fn decider_with(allocatable: &[(&str, i64)]) -> ScaleDecider {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(node_fixture("node-a", allocatable, &[]));
        ScaleDecider::new(
            Arc::new(SliceTierRegistry::new(cluster)),
            ResourceDefaults {
                cpu: "1".into(),
                memory: "10Gi".into(),
            },
        )
    }

    fn snapshot(current: &str, metrics: Vec<MetricSample>) -> WorkloadSnapshot {
        WorkloadSnapshot {
            service: "llama".into(),
            revision: "llama-00001".into(),
            pod: "llama-00001-deployment-abc".into(),
            current: SliceTier::parse(current).unwrap(),
            metrics,
        }
    }

    #[tokio::test]
    async fn test_scale_up_to_adjacent_tier() {
        // value 0.8 against SLO 0.4 with up factor 1.5 (threshold 0.6)
        let decider = decider_with(&[("nvidia.com/mig-3g.20gb", 2)]);
        let snapshot = snapshot("nvidia.com/mig-2g.10gb", vec![sample(0.8, 0.4, 0.5, 1.5)]);

        let decision = decider.decide(&snapshot).await.unwrap();
        assert_eq!(
            decision,
            ScaleDecision::Up(SliceTier::parse("nvidia.com/mig-3g.20gb").unwrap())
        );
    }

    #[tokio::test]
    async fn test_scale_down_blocked_at_floor() {
        let decider = decider_with(&[("nvidia.com/mig-1g.5gb", 3)]);
        let snapshot = snapshot("nvidia.com/mig-1g.5gb", vec![sample(0.05, 1.0, 0.5, 1.5)]);

        let decision = decider.decide(&snapshot).await.unwrap();
        assert_eq!(decision, ScaleDecision::None);
    }

    #[tokio::test]
    async fn test_idle_nan_scales_down() {
        let decider = decider_with(&[("nvidia.com/mig-2g.10gb", 1)]);
        let snapshot = snapshot(
            "nvidia.com/mig-3g.20gb",
            vec![sample(f64::NAN, 0.4, 0.5, 1.5)],
        );

        let decision = decider.decide(&snapshot).await.unwrap();
        assert_eq!(
            decision,
            ScaleDecision::Down(SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap())
        );
    }

    #[tokio::test]
    async fn test_in_band_value_is_noop() {
        let decider = decider_with(&[("nvidia.com/mig-3g.20gb", 1)]);
        let snapshot = snapshot("nvidia.com/mig-2g.10gb", vec![sample(0.4, 0.4, 0.5, 1.5)]);
        assert_eq!(decider.decide(&snapshot).await.unwrap(), ScaleDecision::None);
    }

    #[tokio::test]
    async fn test_up_dominates_down_across_metrics() {
        let decider = decider_with(&[("nvidia.com/mig-3g.20gb", 1)]);
        let snapshot = snapshot(
            "nvidia.com/mig-2g.10gb",
            vec![sample(f64::NAN, 0.4, 0.5, 1.5), sample(0.9, 0.4, 0.5, 1.5)],
        );

        let decision = decider.decide(&snapshot).await.unwrap();
        assert!(matches!(decision, ScaleDecision::Up(_)));
    }

    #[tokio::test]
    async fn test_decide_out_uses_same_tier() {
        let decider = decider_with(&[("nvidia.com/mig-2g.10gb", 1)]);
        let snapshot = snapshot("nvidia.com/mig-2g.10gb", Vec::new());

        let decision = decider.decide_out(&snapshot).await.unwrap();
        assert_eq!(
            decision,
            ScaleDecision::Out(SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap())
        );
    }

    #[tokio::test]
    async fn test_requirements_replace_slice_keys() {
        let decider = decider_with(&[("nvidia.com/mig-3g.20gb", 1)]);
        let decision = ScaleDecision::Up(SliceTier::parse("nvidia.com/mig-3g.20gb").unwrap());

        let requirements = decider.requirements(&decision).unwrap();
        let requests = requirements.requests.unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "1");
        assert_eq!(requests.get("memory").unwrap().0, "10Gi");
        assert_eq!(requests.get("nvidia.com/mig-3g.20gb").unwrap().0, "1");
        assert_eq!(requests.len(), 3);

        assert!(decider.requirements(&ScaleDecision::In).is_none());
        assert!(decider.requirements(&ScaleDecision::None).is_none());
    }

    #[test]
    fn test_decision_admissibility_by_construction() {
        // target accessor mirrors the variant payloads
        let tier = SliceTier::parse("nvidia.com/mig-2g.10gb").unwrap();
        assert_eq!(ScaleDecision::Up(tier.clone()).kind(), ScaleKind::Up);
        assert_eq!(ScaleDecision::Up(tier.clone()).target(), Some(&tier));
        assert_eq!(ScaleDecision::In.target(), None);
    }
}
