//! Configuration structures for the KestrelDB storage runtime.

use crate::error::{KestrelError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use sysinfo::System;

/// Smallest memory component budget accepted by `auto_sized`.
pub const MIN_MEMORY_COMPONENT_BUDGET: usize = 1024 * 1024;

/// Execution discipline for background flush and merge operations.
///
/// Chosen once when the storage runtime is assembled and fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    /// Operations run synchronously on the scheduling thread.
    Immediate,
    /// Operations are queued and run one at a time, in FIFO order, on a worker thread.
    #[default]
    Sequential,
}

impl SchedulerPolicy {
    /// Returns the configuration name of this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerPolicy::Immediate => "immediate",
            SchedulerPolicy::Sequential => "sequential",
        }
    }
}

impl std::fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerPolicy {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(SchedulerPolicy::Immediate),
            "sequential" => Ok(SchedulerPolicy::Sequential),
            _ => Err(KestrelError::ConfigError(format!(
                "unknown I/O scheduler policy '{}'",
                s
            ))),
        }
    }
}

/// Rule deciding when flushed disk components are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MergePolicyConfig {
    /// Never merge.
    None,
    /// Merge all disk components once their count reaches `max_components`.
    Constant { max_components: usize },
    /// Merge the newest run of components smaller than `max_mergable_component_size`
    /// once the run is longer than `max_tolerance_component_count`.
    Prefix {
        max_mergable_component_size: u64,
        max_tolerance_component_count: usize,
    },
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig::Prefix {
            max_mergable_component_size: 1024 * 1024 * 1024, // 1 GB
            max_tolerance_component_count: 5,
        }
    }
}

impl MergePolicyConfig {
    /// Checks that the policy parameters are usable.
    pub fn validate(&self) -> Result<()> {
        match *self {
            MergePolicyConfig::None => Ok(()),
            MergePolicyConfig::Constant { max_components } => {
                if max_components < 2 {
                    return Err(KestrelError::InvalidParameter {
                        name: "max_components".to_string(),
                        value: max_components.to_string(),
                    });
                }
                Ok(())
            }
            MergePolicyConfig::Prefix {
                max_mergable_component_size,
                max_tolerance_component_count,
            } => {
                if max_mergable_component_size == 0 {
                    return Err(KestrelError::InvalidParameter {
                        name: "max_mergable_component_size".to_string(),
                        value: "0".to_string(),
                    });
                }
                if max_tolerance_component_count == 0 {
                    return Err(KestrelError::InvalidParameter {
                        name: "max_tolerance_component_count".to_string(),
                        value: "0".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Storage configuration for the index runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory under which index splits are resolved.
    pub data_dir: PathBuf,
    /// I/O scheduler policy for flush and merge operations.
    pub io_scheduler: SchedulerPolicy,
    /// Enable fsync for component files and durable WAL appends.
    pub fsync_enabled: bool,
    /// Memory component size in bytes that triggers a flush.
    pub memory_component_budget: usize,
    /// Merge policy applied to disk components.
    pub merge_policy: MergePolicyConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            io_scheduler: SchedulerPolicy::Sequential,
            fsync_enabled: true,
            memory_component_budget: 32 * 1024 * 1024, // 32 MB
            merge_policy: MergePolicyConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Creates a config rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a config whose memory component budget is derived from system RAM.
    ///
    /// Uses 1/64 of available memory per memory component, with a floor of
    /// `MIN_MEMORY_COMPONENT_BUDGET`. For a system with 16GB available this
    /// budgets 256MB.
    pub fn auto_sized(data_dir: impl Into<PathBuf>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let budget = (available_bytes / 64).max(MIN_MEMORY_COMPONENT_BUDGET);

        Self {
            memory_component_budget: budget,
            ..Self::new(data_dir)
        }
    }

    /// Sets the I/O scheduler policy.
    pub fn with_scheduler(mut self, policy: SchedulerPolicy) -> Self {
        self.io_scheduler = policy;
        self
    }

    /// Sets the memory component budget.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_component_budget = bytes;
        self
    }

    /// Sets the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Checks the configuration for values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.memory_component_budget == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "memory_component_budget".to_string(),
                value: "0".to_string(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(KestrelError::ConfigError("data_dir is empty".to_string()));
        }
        self.merge_policy.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.io_scheduler, SchedulerPolicy::Sequential);
        assert!(config.fsync_enabled);
        assert_eq!(config.memory_component_budget, 32 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_policy_from_str() {
        assert_eq!(
            "immediate".parse::<SchedulerPolicy>().unwrap(),
            SchedulerPolicy::Immediate
        );
        assert_eq!(
            "SEQUENTIAL".parse::<SchedulerPolicy>().unwrap(),
            SchedulerPolicy::Sequential
        );
        let err = "eager".parse::<SchedulerPolicy>().unwrap_err();
        assert!(matches!(err, KestrelError::ConfigError(_)));
    }

    #[test]
    fn test_scheduler_policy_wire_names() {
        let json = serde_json::to_string(&SchedulerPolicy::Immediate).unwrap();
        assert_eq!(json, "\"immediate\"");
        let policy: SchedulerPolicy = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(policy, SchedulerPolicy::Sequential);
        assert_eq!(SchedulerPolicy::Immediate.to_string(), "immediate");
    }

    #[test]
    fn test_merge_policy_serde() {
        let policy = MergePolicyConfig::Constant { max_components: 3 };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"kind":"constant","max_components":3}"#);
        let back: MergePolicyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);

        let none: MergePolicyConfig = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, MergePolicyConfig::None);
    }

    #[test]
    fn test_merge_policy_validation() {
        assert!(MergePolicyConfig::None.validate().is_ok());
        assert!(
            MergePolicyConfig::Constant { max_components: 1 }
                .validate()
                .is_err()
        );
        assert!(
            MergePolicyConfig::Prefix {
                max_mergable_component_size: 1024,
                max_tolerance_component_count: 0,
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = StorageConfig::default().with_memory_budget(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, KestrelError::InvalidParameter { .. }));
    }

    #[test]
    fn test_auto_sized_has_floor() {
        let config = StorageConfig::auto_sized("/tmp/kestrel");
        assert!(config.memory_component_budget >= MIN_MEMORY_COMPONENT_BUDGET);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/kestrel"));
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::new("/var/lib/kestrel")
            .with_scheduler(SchedulerPolicy::Immediate)
            .with_memory_budget(4096)
            .with_merge_policy(MergePolicyConfig::None);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.io_scheduler, deserialized.io_scheduler);
        assert_eq!(
            original.memory_component_budget,
            deserialized.memory_component_budget
        );
        assert_eq!(original.merge_policy, deserialized.merge_policy);
    }
}
