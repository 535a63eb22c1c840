//! Scaling-event contract between the autoscaler and the exporter
//!
//! The autoscaler reports the outcome of every workload inspection through
//! a [`ScalingEventSink`] capability. The metrics exporter is the production
//! implementation; tests substitute a [`RecordingSink`].

use crate::tier::SliceTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// The direction of a scale decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleKind {
    /// No change
    None,
    /// Move to the next-larger slice tier
    Up,
    /// Move to the next-smaller slice tier
    Down,
    /// Add a revision on the same slice tier
    Out,
    /// Retire a revision
    In,
}

impl fmt::Display for ScaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleKind::None => write!(f, "none"),
            ScaleKind::Up => write!(f, "up"),
            ScaleKind::Down => write!(f, "down"),
            ScaleKind::Out => write!(f, "out"),
            ScaleKind::In => write!(f, "in"),
        }
    }
}

/// One observation or outcome for a revision
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingEvent {
    /// The revision the event applies to
    pub revision: String,

    /// Direction of the decision (`None` for pure observations)
    pub kind: ScaleKind,

    /// The slice the revision holds, when known
    pub slice: Option<SliceTier>,
}

impl ScalingEvent {
    /// Observation event: the revision is running on `slice` and no scaling
    /// happened this tick
    pub fn not_scaling(revision: impl Into<String>, slice: Option<SliceTier>) -> Self {
        Self {
            revision: revision.into(),
            kind: ScaleKind::None,
            slice,
        }
    }

    /// Outcome event for a completed scale decision
    pub fn scaled(revision: impl Into<String>, kind: ScaleKind, slice: Option<SliceTier>) -> Self {
        Self {
            revision: revision.into(),
            kind,
            slice,
        }
    }
}

/// Capability for reporting scaling events
pub trait ScalingEventSink: Send + Sync {
    /// Record one event. Must not block the caller.
    fn record(&self, event: ScalingEvent);
}

/// Sink that remembers every event, for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ScalingEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far
    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ScalingEventSink for RecordingSink {
    fn record(&self, event: ScalingEvent) {
        self.events.lock().unwrap().push(event);
    }
}
