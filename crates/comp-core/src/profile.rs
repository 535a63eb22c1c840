//! The partition-profile model
//!
//! A partition profile names a slicing configuration for every physical
//! device on a node. The partitioning agent consumes the profile name via a
//! node label; KubeComp reads the same profile file to decide which profile
//! can host a pending pod's demand and which devices a profile switch would
//! re-slice.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Default location of the partitioning agent's profile file
pub const DEFAULT_PROFILE_PATH: &str = "/etc/config/config.yaml";

/// Slicing configuration for a group of physical devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlices {
    /// Physical device indices this entry applies to
    pub devices: Vec<u32>,

    /// Whether hardware partitioning is enabled on these devices
    #[serde(rename = "mig-enabled")]
    pub mig_enabled: bool,

    /// Slice tiers (short names) and counts each device yields
    #[serde(rename = "mig-devices", default)]
    pub mig_devices: BTreeMap<String, u32>,
}

/// The full profile file: named profiles, each a list of device groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProfiles {
    /// Schema version of the profile file
    pub version: String,

    /// Profile name to device-group list
    #[serde(rename = "mig-configs")]
    pub mig_configs: BTreeMap<String, Vec<DeviceSlices>>,
}

impl PartitionProfiles {
    /// Load the profile file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read profile file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse the profile file from a YAML string
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let profiles: Self = serde_yaml::from_str(contents)
            .map_err(|e| Error::config(format!("malformed profile file: {}", e)))?;
        if profiles.mig_configs.is_empty() {
            return Err(Error::config("profile file defines no partition profiles"));
        }
        Ok(profiles)
    }

    /// All profile names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.mig_configs.keys().map(String::as_str).collect()
    }

    /// Total per-tier capacity of a profile, summed over all its devices.
    /// Keys are short tier names.
    pub fn capacity(&self, profile: &str) -> Option<BTreeMap<String, i64>> {
        let groups = self.mig_configs.get(profile)?;
        let mut capacity = BTreeMap::new();
        for group in groups {
            for (tier, count) in &group.mig_devices {
                *capacity.entry(tier.clone()).or_insert(0) +=
                    *count as i64 * group.devices.len() as i64;
            }
        }
        Some(capacity)
    }

    /// Per-device tier multiset of a profile. Unknown profile names yield an
    /// empty layout, which makes every device of a known profile differ.
    pub fn device_layout(&self, profile: &str) -> BTreeMap<u32, BTreeMap<String, u32>> {
        let mut layout = BTreeMap::new();
        if let Some(groups) = self.mig_configs.get(profile) {
            for group in groups {
                for device in &group.devices {
                    layout.insert(*device, group.mig_devices.clone());
                }
            }
        }
        layout
    }

    /// The physical devices whose per-tier multiset differs between two
    /// profiles. These devices must be re-sliced, so their pods will be
    /// evicted. Result is sorted.
    pub fn devices_to_reslice(&self, old_profile: &str, new_profile: &str) -> Vec<u32> {
        let old_layout = self.device_layout(old_profile);
        let new_layout = self.device_layout(new_profile);

        let mut devices: Vec<u32> = old_layout
            .keys()
            .chain(new_layout.keys())
            .copied()
            .filter(|device| old_layout.get(device) != new_layout.get(device))
            .collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    /// Profiles whose capacity covers `demand` (short tier name -> count)
    /// for every demanded tier. Result is sorted by profile name.
    pub fn candidates(&self, demand: &BTreeMap<String, i64>) -> Vec<&str> {
        self.mig_configs
            .keys()
            .filter(|profile| {
                let capacity = self.capacity(profile).unwrap_or_default();
                demand
                    .iter()
                    .all(|(tier, wanted)| capacity.get(tier).copied().unwrap_or(0) >= *wanted)
            })
            .map(String::as_str)
            .collect()
    }

    /// Choose the profile that covers `demand` while evicting the fewest
    /// pods. A candidate's score is minus the number of pods currently on
    /// the devices it would re-slice; the highest score wins, ties broken
    /// by lexicographically smallest profile name.
    pub fn select(
        &self,
        demand: &BTreeMap<String, i64>,
        pods_per_device: &HashMap<u32, usize>,
        current_profile: &str,
    ) -> Result<ProfileChoice> {
        let mut best: Option<ProfileChoice> = None;

        for candidate in self.candidates(demand) {
            let reslice = self.devices_to_reslice(current_profile, candidate);
            let score = -(reslice
                .iter()
                .map(|device| pods_per_device.get(device).copied().unwrap_or(0) as i64)
                .sum::<i64>());

            // candidates() iterates in name order, so strict improvement
            // keeps the lexicographically smallest name on ties
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(ProfileChoice {
                    profile: candidate.to_string(),
                    reslice,
                    score,
                });
            }
        }

        best.ok_or_else(|| {
            Error::no_viable_profile(format!("no partition profile covers demand {:?}", demand))
        })
    }
}

/// Outcome of partition-profile selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileChoice {
    /// Name of the chosen profile
    pub profile: String,

    /// Devices that must be re-sliced to activate the profile
    pub reslice: Vec<u32>,

    /// Selection score (minus the pods on re-sliced devices)
    pub score: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_YAML: &str = r#"
version: v1
mig-configs:
  all-3g:
    - devices: [0, 1]
      mig-enabled: true
      mig-devices:
        3g.20gb: 2
  mixed:
    - devices: [0]
      mig-enabled: true
      mig-devices:
        3g.20gb: 2
    - devices: [1]
      mig-enabled: true
      mig-devices:
        1g.5gb: 7
  all-1g:
    - devices: [0, 1]
      mig-enabled: true
      mig-devices:
        1g.5gb: 7
"#;

    fn profiles() -> PartitionProfiles {
        PartitionProfiles::from_yaml(PROFILE_YAML).unwrap()
    }

    #[test]
    fn test_parse_profile_file() {
        let profiles = profiles();
        assert_eq!(profiles.version, "v1");
        assert_eq!(profiles.names(), vec!["all-1g", "all-3g", "mixed"]);
    }

    #[test]
    fn test_rejects_empty_profile_file() {
        let err = PartitionProfiles::from_yaml("version: v1\nmig-configs: {}\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_capacity() {
        let profiles = profiles();
        let capacity = profiles.capacity("mixed").unwrap();
        assert_eq!(capacity.get("3g.20gb"), Some(&2));
        assert_eq!(capacity.get("1g.5gb"), Some(&7));

        let capacity = profiles.capacity("all-3g").unwrap();
        assert_eq!(capacity.get("3g.20gb"), Some(&4));
        assert!(profiles.capacity("missing").is_none());
    }

    #[test]
    fn test_devices_to_reslice() {
        let profiles = profiles();
        // all-3g -> mixed only changes device 1
        assert_eq!(profiles.devices_to_reslice("all-3g", "mixed"), vec![1]);
        // identical profiles change nothing
        assert!(profiles.devices_to_reslice("mixed", "mixed").is_empty());
        // unknown old profile forces every device of the new one
        assert_eq!(profiles.devices_to_reslice("", "all-3g"), vec![0, 1]);
    }

    #[test]
    fn test_candidate_filter() {
        let profiles = profiles();

        let mut demand = BTreeMap::new();
        demand.insert("3g.20gb".to_string(), 2);
        demand.insert("1g.5gb".to_string(), 1);
        assert_eq!(profiles.candidates(&demand), vec!["mixed"]);

        let mut demand = BTreeMap::new();
        demand.insert("1g.5gb".to_string(), 20);
        assert!(profiles.candidates(&demand).is_empty());
    }

    #[test]
    fn test_select_minimizes_eviction() {
        let profiles = profiles();

        // Node on all-3g with pods on both devices; one 1g slice demanded
        // on top of the two 3g slices in use on device 0.
        let mut demand = BTreeMap::new();
        demand.insert("3g.20gb".to_string(), 2);
        demand.insert("1g.5gb".to_string(), 1);

        let mut pods = HashMap::new();
        pods.insert(0u32, 2usize);
        pods.insert(1u32, 1usize);

        let choice = profiles.select(&demand, &pods, "all-3g").unwrap();
        assert_eq!(choice.profile, "mixed");
        assert_eq!(choice.reslice, vec![1]);
        assert_eq!(choice.score, -1);
    }

    #[test]
    fn test_select_tiebreak_prefers_lexicographic_name() {
        let profiles = profiles();

        // Empty demand keeps every profile; no pods anywhere, so every
        // candidate scores 0 and the smallest name must win.
        let demand = BTreeMap::new();
        let pods = HashMap::new();
        let choice = profiles.select(&demand, &pods, "all-1g").unwrap();
        assert_eq!(choice.profile, "all-1g");
        assert!(choice.reslice.is_empty());
    }

    #[test]
    fn test_select_with_no_candidate() {
        let profiles = profiles();
        let mut demand = BTreeMap::new();
        demand.insert("7g.40gb".to_string(), 1);
        let err = profiles.select(&demand, &HashMap::new(), "all-3g").unwrap_err();
        assert!(matches!(err, Error::NoViableProfile(_)));
    }
}
