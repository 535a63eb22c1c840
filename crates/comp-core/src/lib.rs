//! # comp-core
//!
//! Core types, traits, and utilities for KubeComp - a GPU-aware autoscaling
//! control plane for serverless inference workloads.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared across all other KubeComp components. It includes:
//!
//! - The slice-tier model (MIG / MPS / whole-device accelerator slices)
//! - The partition-profile model read from the partitioning agent's config
//! - Label, taint, and annotation keys written to cluster objects
//! - The node-pin queue coupling the reconfigurator and the pod preprocessor
//! - Environment-driven settings and parsing utilities
//! - Error handling types and the scaling-event contract

pub mod config;
pub mod error;
pub mod events;
pub mod labels;
pub mod pin_queue;
pub mod profile;
pub mod tier;

// Re-export commonly used types at the crate root
pub use config::Settings;
pub use error::{Error, Result};
pub use events::{RecordingSink, ScaleKind, ScalingEvent, ScalingEventSink};
pub use pin_queue::PinQueue;
pub use profile::{DeviceSlices, PartitionProfiles};
pub use tier::{SliceFamily, SliceTier};
