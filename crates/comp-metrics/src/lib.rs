//! # comp-metrics
//!
//! Prometheus exporter for KubeComp.
//!
//! Reflects the latest known slice assignment of each workload revision
//! into the `KubeComp_gpu_resource` gauge, serialized through a single
//! event-draining task, and serves the text exposition endpoint.

pub mod exporter;

pub use exporter::{Exporter, ExporterSink};
