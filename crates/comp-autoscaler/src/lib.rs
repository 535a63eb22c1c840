//! # comp-autoscaler
//!
//! The per-workload vertical autoscaler.
//!
//! Closes a loop from latency metrics to slice-tier changes: the periodic
//! loop assembles a snapshot per workload pod, the decider turns it into a
//! scale decision against the slice-tier registry, and the applier realizes
//! the decision by revising the serving object, rebalancing traffic, and
//! retiring the superseded revision.

pub mod applier;
pub mod autoscaler;
pub mod decider;
pub mod fetcher;
pub mod registry;
pub mod traffic;

pub use applier::ScaleApplier;
pub use autoscaler::Autoscaler;
pub use decider::{ResourceDefaults, ScaleDecider, ScaleDecision, WorkloadSnapshot};
pub use fetcher::{ConfigMapFetcher, MetricBackend, MetricFetcher, MetricSample, MetricSpec, PrometheusBackend};
pub use registry::{SliceInventory, SliceTierRegistry};
pub use traffic::rebalance;
