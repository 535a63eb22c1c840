//! Slice-tier registry
//!
//! Single source of truth for which slice sizes exist, in what order, and
//! where they are free right now. Inventory is re-read from the live node
//! objects on every tier query; the call rate is at most once per workload
//! per tick, and freshness matters more than throughput.

use comp_core::tier::{builtin_tiers, SliceFamily, SliceTier};
use comp_core::{Error, Result};
use comp_kube::util::quantity_value;
use comp_kube::NodeApi;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Free slice counts per (node, resource name), rebuilt per query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceInventory {
    counts: HashMap<(String, String), i64>,
}

impl SliceInventory {
    /// Free count of a tier on one node
    pub fn on_node(&self, node: &str, tier: &SliceTier) -> i64 {
        self.counts
            .get(&(node.to_string(), tier.name.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Free count of a tier summed over all nodes
    pub fn available(&self, tier: &SliceTier) -> i64 {
        self.counts
            .iter()
            .filter(|((_, resource), _)| *resource == tier.name)
            .map(|(_, count)| *count)
            .sum()
    }
}

/// Names, orders, and inventories the slice tiers per family
pub struct SliceTierRegistry {
    tiers: HashMap<SliceFamily, Vec<SliceTier>>,
    nodes: Arc<dyn NodeApi>,
}

impl SliceTierRegistry {
    /// Registry over the built-in tier tables
    pub fn new(nodes: Arc<dyn NodeApi>) -> Self {
        let tiers = [SliceFamily::Mig, SliceFamily::Mps, SliceFamily::Whole]
            .into_iter()
            .map(|family| (family, builtin_tiers(family)))
            .collect();
        Self { tiers, nodes }
    }

    /// Registry over an explicit tier list. Tiers are ordered by compute
    /// then memory weight; equal weights keep their configured order, so
    /// the tier named earlier wins ties.
    pub fn with_tiers(tier_list: Vec<SliceTier>, nodes: Arc<dyn NodeApi>) -> Self {
        let mut tiers: HashMap<SliceFamily, Vec<SliceTier>> = HashMap::new();
        for tier in tier_list {
            tiers.entry(tier.family).or_default().push(tier);
        }
        for family_tiers in tiers.values_mut() {
            family_tiers.sort_by(|a, b| a.weight_cmp(b));
        }
        Self { tiers, nodes }
    }

    /// The ordered tier sequence of a family
    pub fn tiers_for(&self, family: SliceFamily) -> &[SliceTier] {
        self.tiers.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rebuild the (node, tier) free-count map from live node objects
    pub async fn refresh_inventory(&self) -> Result<SliceInventory> {
        let mut counts = HashMap::new();
        for node in self.nodes.list().await? {
            let node_name = node.metadata.name.clone().unwrap_or_default();
            let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref())
            else {
                continue;
            };
            for (resource, quantity) in allocatable {
                if SliceTier::parse(resource).is_some() {
                    counts.insert(
                        (node_name.clone(), resource.clone()),
                        quantity_value(quantity),
                    );
                }
            }
        }
        Ok(SliceInventory { counts })
    }

    /// The current tier itself, if it still has free inventory somewhere
    pub async fn same(&self, current: &SliceTier) -> Result<SliceTier> {
        let (tier, _) = self.position_of(current)?;
        let inventory = self.refresh_inventory().await?;
        if inventory.available(&tier) > 0 {
            Ok(tier)
        } else {
            Err(Error::no_available_tier(format!(
                "no free {} anywhere",
                tier.name
            )))
        }
    }

    /// The strictly adjacent larger tier, if it has free inventory
    pub async fn next_larger(&self, current: &SliceTier) -> Result<SliceTier> {
        self.adjacent(current, 1).await
    }

    /// The strictly adjacent smaller tier, if it has free inventory
    pub async fn next_smaller(&self, current: &SliceTier) -> Result<SliceTier> {
        self.adjacent(current, -1).await
    }

    async fn adjacent(&self, current: &SliceTier, direction: isize) -> Result<SliceTier> {
        if current.family == SliceFamily::Whole {
            return Err(Error::no_available_tier(
                "whole-device workloads have no adjacent tier",
            ));
        }

        let (_, index) = self.position_of(current)?;
        let family_tiers = self.tiers_for(current.family);
        let neighbor_index = index as isize + direction;
        if neighbor_index < 0 || neighbor_index as usize >= family_tiers.len() {
            return Err(Error::no_available_tier(format!(
                "{} is already the {} tier of its family",
                current.name,
                if direction < 0 { "smallest" } else { "largest" }
            )));
        }

        let neighbor = family_tiers[neighbor_index as usize].clone();
        let inventory = self.refresh_inventory().await?;
        let available = inventory.available(&neighbor);
        debug!(tier = %neighbor.name, available, "checked adjacent tier inventory");
        if available > 0 {
            Ok(neighbor)
        } else {
            Err(Error::no_available_tier(format!(
                "no free {} anywhere",
                neighbor.name
            )))
        }
    }

    fn position_of(&self, current: &SliceTier) -> Result<(SliceTier, usize)> {
        let family_tiers = self.tiers_for(current.family);
        if family_tiers.is_empty() {
            return Err(Error::no_available_tier(format!(
                "family {} has no configured tiers",
                current.family
            )));
        }
        family_tiers
            .iter()
            .position(|tier| tier.name == current.name)
            .map(|index| (family_tiers[index].clone(), index))
            .ok_or_else(|| {
                Error::no_available_tier(format!(
                    "{} is not a configured {} tier",
                    current.name, current.family
                ))
            })
    }
}
