//! Merge policies deciding when disk components are compacted.

use crate::operation::ComponentId;
use kestrel_common::MergePolicyConfig;
use std::fmt::Debug;

/// Metadata a merge policy sees for one disk component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub size_bytes: u64,
    pub entry_count: u64,
}

/// Chooses disk components to merge.
///
/// `components` is ordered newest first. A selection is a contiguous run of
/// at least two components, returned newest first.
pub trait MergePolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn select(&self, components: &[ComponentInfo]) -> Option<Vec<ComponentId>>;
}

/// Builds the policy described by configuration.
pub fn merge_policy_for(config: &MergePolicyConfig) -> Box<dyn MergePolicy> {
    match *config {
        MergePolicyConfig::None => Box::new(NoMergePolicy),
        MergePolicyConfig::Constant { max_components } => {
            Box::new(ConstantMergePolicy::new(max_components))
        }
        MergePolicyConfig::Prefix {
            max_mergable_component_size,
            max_tolerance_component_count,
        } => Box::new(PrefixMergePolicy::new(
            max_mergable_component_size,
            max_tolerance_component_count,
        )),
    }
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn select(&self, _components: &[ComponentInfo]) -> Option<Vec<ComponentId>> {
        None
    }
}

/// Merges every disk component once there are `max_components` of them.
#[derive(Debug, Clone, Copy)]
pub struct ConstantMergePolicy {
    max_components: usize,
}

impl ConstantMergePolicy {
    pub fn new(max_components: usize) -> Self {
        Self {
            max_components: max_components.max(2),
        }
    }
}

impl MergePolicy for ConstantMergePolicy {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn select(&self, components: &[ComponentInfo]) -> Option<Vec<ComponentId>> {
        (components.len() >= self.max_components).then(|| components.iter().map(|c| c.id).collect())
    }
}

/// Merges the newest run of small components once it grows too long.
///
/// Walking newest first, components join the run while each one and the
/// running total stay within `max_mergable_size`. The run is merged when it
/// holds more than `max_tolerance_count` components.
#[derive(Debug, Clone, Copy)]
pub struct PrefixMergePolicy {
    max_mergable_size: u64,
    max_tolerance_count: usize,
}

impl PrefixMergePolicy {
    pub fn new(max_mergable_size: u64, max_tolerance_count: usize) -> Self {
        Self {
            max_mergable_size,
            max_tolerance_count: max_tolerance_count.max(1),
        }
    }
}

impl MergePolicy for PrefixMergePolicy {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn select(&self, components: &[ComponentInfo]) -> Option<Vec<ComponentId>> {
        let mut total = 0u64;
        let run: Vec<ComponentId> = components
            .iter()
            .take_while(|c| {
                total = total.saturating_add(c.size_bytes);
                c.size_bytes <= self.max_mergable_size && total <= self.max_mergable_size
            })
            .map(|c| c.id)
            .collect();

        (run.len() > self.max_tolerance_count && run.len() >= 2).then_some(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(sizes: &[u64]) -> Vec<ComponentInfo> {
        // Newest first: the first size gets the highest generation.
        let n = sizes.len() as u64;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size_bytes)| ComponentInfo {
                id: ComponentId::flushed(n - i as u64),
                size_bytes,
                entry_count: size_bytes / 10,
            })
            .collect()
    }

    #[test]
    fn test_no_merge() {
        assert!(NoMergePolicy.select(&components(&[1; 50])).is_none());
    }

    #[test]
    fn test_constant_threshold() {
        let policy = ConstantMergePolicy::new(3);
        assert!(policy.select(&components(&[10, 10])).is_none());
        let picked = policy.select(&components(&[10, 10, 10])).unwrap();
        assert_eq!(
            picked,
            vec![
                ComponentId::flushed(3),
                ComponentId::flushed(2),
                ComponentId::flushed(1)
            ]
        );
    }

    #[test]
    fn test_prefix_stops_at_large_component() {
        let policy = PrefixMergePolicy::new(100, 2);
        // Two small components, then a big one: run too short.
        assert!(policy.select(&components(&[10, 10, 500])).is_none());
        // Three small components ahead of the big one.
        let picked = policy.select(&components(&[10, 10, 10, 500])).unwrap();
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0], ComponentId::flushed(4));
        assert!(!picked.contains(&ComponentId::flushed(1)));
    }

    #[test]
    fn test_prefix_caps_total_size() {
        let policy = PrefixMergePolicy::new(100, 2);
        let picked = policy.select(&components(&[40, 40, 15, 40, 40])).unwrap();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_policy_from_config() {
        assert_eq!(merge_policy_for(&MergePolicyConfig::None).name(), "none");
        assert_eq!(
            merge_policy_for(&MergePolicyConfig::Constant { max_components: 4 }).name(),
            "constant"
        );
        assert_eq!(merge_policy_for(&MergePolicyConfig::default()).name(), "prefix");
    }
}
