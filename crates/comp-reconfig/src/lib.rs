//! # comp-reconfig
//!
//! The partition reconfigurator and the pod preprocessor.
//!
//! When a pending pod cannot fit any existing slice, the reconfigurator
//! picks a new partition profile for the node, evicts exactly the pods on
//! the devices that must be re-sliced, and drives the external partitioning
//! agent through a node label. The preprocessor pins recreated pods back to
//! their original node so vertical scale decisions survive the move.

pub mod preprocess;
pub mod reconciler;
pub mod selector;

pub use preprocess::PodPreprocessor;
pub use reconciler::{ReconfigController, ReconfigSettings};
