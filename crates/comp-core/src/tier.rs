//! The slice-tier model
//!
//! A slice is a logical partition of a physical accelerator exposed to the
//! scheduler as a separate allocatable resource name. Tiers are equivalence
//! classes of slices by capability within one slicing family, totally
//! ordered by compute-weight and tie-broken by memory-weight.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Resource-name prefix of hardware-partitioned (MIG) slices
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

/// Resource-name prefix of time-shared (MPS) slices
pub const MPS_RESOURCE_PREFIX: &str = "nvidia.com/gpu-";

/// Resource name of an undivided device
pub const WHOLE_GPU_RESOURCE: &str = "nvidia.com/gpu";

/// The partitioning technology a slice belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceFamily {
    /// Hardware partitioning (`nvidia.com/mig-Xg.Ygb`)
    Mig,
    /// Time-sharing (`nvidia.com/gpu-Xgb`)
    Mps,
    /// Undivided device (`nvidia.com/gpu`)
    Whole,
}

impl std::str::FromStr for SliceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mig" => Ok(SliceFamily::Mig),
            "mps" => Ok(SliceFamily::Mps),
            "whole" => Ok(SliceFamily::Whole),
            _ => Err(format!("Unknown slice family: {}", s)),
        }
    }
}

impl fmt::Display for SliceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceFamily::Mig => write!(f, "mig"),
            SliceFamily::Mps => write!(f, "mps"),
            SliceFamily::Whole => write!(f, "whole"),
        }
    }
}

/// One slice tier: a named accelerator slice size within a family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceTier {
    /// Partitioning family this tier belongs to
    pub family: SliceFamily,

    /// Full scheduler resource name (e.g. `nvidia.com/mig-3g.20gb`)
    pub name: String,

    /// Compute weight (MIG compute slices, MPS memory share); NaN for the
    /// whole-device tier, which never participates in ordering
    pub compute: f64,

    /// Memory weight in GB; NaN for the whole-device tier
    pub memory: f64,
}

impl SliceTier {
    /// Create a new tier
    pub fn new(family: SliceFamily, name: impl Into<String>, compute: f64, memory: f64) -> Self {
        Self {
            family,
            name: name.into(),
            compute,
            memory,
        }
    }

    /// Parse a scheduler resource name into a slice tier.
    ///
    /// Returns `None` for resource names outside the slice families
    /// (regular CPU/memory resources, unrelated extended resources).
    pub fn parse(resource_name: &str) -> Option<Self> {
        if let Some(geometry) = resource_name.strip_prefix(MIG_RESOURCE_PREFIX) {
            let (compute, memory) = parse_mig_geometry(geometry)?;
            return Some(Self::new(SliceFamily::Mig, resource_name, compute, memory));
        }

        if let Some(share) = resource_name.strip_prefix(MPS_RESOURCE_PREFIX) {
            let memory = parse_gb(share)?;
            return Some(Self::new(SliceFamily::Mps, resource_name, memory, memory));
        }

        if resource_name == WHOLE_GPU_RESOURCE {
            return Some(Self::new(SliceFamily::Whole, resource_name, f64::NAN, f64::NAN));
        }

        None
    }

    /// The tier name without its family resource prefix (`3g.20gb`), as
    /// used by the partitioning agent's profile file.
    pub fn short_name(&self) -> &str {
        self.name
            .strip_prefix(MIG_RESOURCE_PREFIX)
            .or_else(|| self.name.strip_prefix(MPS_RESOURCE_PREFIX))
            .unwrap_or(&self.name)
    }

    /// Total order within a family: compute weight, then memory weight.
    /// NaN weights (whole-device) compare equal to everything, which keeps
    /// the single-member family stable under sorting.
    pub fn weight_cmp(&self, other: &Self) -> Ordering {
        self.compute
            .partial_cmp(&other.compute)
            .unwrap_or(Ordering::Equal)
            .then(
                self.memory
                    .partial_cmp(&other.memory)
                    .unwrap_or(Ordering::Equal),
            )
    }
}

impl fmt::Display for SliceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Parse MIG geometry (`3g.20gb`) into (compute slices, memory GB)
pub fn parse_mig_geometry(geometry: &str) -> Option<(f64, f64)> {
    let (compute_part, memory_part) = geometry.split_once('.')?;
    let compute: f64 = compute_part.strip_suffix('g')?.parse().ok()?;
    let memory = parse_gb(memory_part)?;
    Some((compute, memory))
}

fn parse_gb(part: &str) -> Option<f64> {
    part.strip_suffix("gb")?.parse().ok()
}

/// Strip the MIG resource prefix, mapping a full resource name to the short
/// tier name used by partition profiles. Names without the prefix are
/// returned unchanged.
pub fn short_slice_name(resource_name: &str) -> &str {
    resource_name
        .strip_prefix(MIG_RESOURCE_PREFIX)
        .unwrap_or(resource_name)
}

/// The built-in tier tables, ordered smallest to largest within each family
pub fn builtin_tiers(family: SliceFamily) -> Vec<SliceTier> {
    match family {
        SliceFamily::Mig => ["1g.5gb", "2g.10gb", "3g.20gb", "4g.20gb", "7g.40gb"]
            .iter()
            .filter_map(|g| SliceTier::parse(&format!("{}{}", MIG_RESOURCE_PREFIX, g)))
            .collect(),
        SliceFamily::Mps => (1..=13)
            .filter_map(|gb| SliceTier::parse(&format!("{}{}gb", MPS_RESOURCE_PREFIX, gb)))
            .collect(),
        SliceFamily::Whole => vec![SliceTier::parse(WHOLE_GPU_RESOURCE).unwrap()],
    }
}
