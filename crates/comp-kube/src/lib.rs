//! # comp-kube
//!
//! Kubernetes and serving-object adapters for KubeComp.
//!
//! This crate holds every seam between the control plane and the cluster:
//!
//! - CRD types for the Knative serving objects the autoscaler mutates
//! - The workload client façade ([`WorkloadApi`]) over services/revisions
//! - Narrow pod/node/configmap capabilities ([`PodApi`], [`NodeApi`],
//!   [`ConfigApi`]) with kube-backed and in-memory implementations
//! - The `wait_until` polling primitive shared by every blocking site

pub mod cluster;
pub mod mock;
pub mod serving;
pub mod util;
pub mod wait;
pub mod workload;

pub use cluster::{ConfigApi, KubeCluster, NodeApi, PodApi};
pub use mock::{MockCluster, MockWorkloads};
pub use serving::{Revision, RevisionSpec, RevisionTemplate, Service, ServiceSpec, TrafficTarget};
pub use util::PodRef;
pub use wait::wait_until;
pub use workload::{KnativeWorkloads, WorkloadApi};
