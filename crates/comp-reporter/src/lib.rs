//! # comp-reporter
//!
//! Per-node GPU reporter daemon.
//!
//! Watches pods scheduled to the local node, labels them with the physical
//! device indices their slices were granted on, and maintains the node
//! labels describing the largest slice still free given current demand.

pub mod allocations;
pub mod devices;
pub mod reporter;

pub use allocations::{DeviceAllocation, KubeletCheckpoint, MockPodResources, PodResourcesSource};
pub use devices::{AcceleratorLibrary, MigDevice, NvmlLibrary, StaticLibrary};
pub use reporter::{GpuReporter, ReporterSettings};
