//! Serializable description of a partitioned index.

use kestrel_common::{KestrelError, MergePolicyConfig, Result, StorageConfig, TypeTrait};
use kestrel_lsm::{IndexId, IndexKind, LsmIndexConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to build one partition of an index.
///
/// Carried by job descriptions, so it is plain serializable data. Partition
/// `p` lives in `splits[p % splits.len()]` under the runtime's data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub kind: IndexKind,
    pub type_traits: Vec<TypeTrait>,
    pub key_field_count: usize,
    /// Fixed for the index's lifetime.
    pub durable: bool,
    pub splits: Vec<PathBuf>,
    /// Overrides the runtime's merge policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_policy: Option<MergePolicyConfig>,
    /// Overrides the runtime's memory component budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_budget: Option<usize>,
}

impl IndexDescriptor {
    /// B-tree index stored in a single split named after the index.
    pub fn btree(
        name: impl Into<String>,
        type_traits: Vec<TypeTrait>,
        key_field_count: usize,
        durable: bool,
    ) -> Self {
        let name = name.into();
        Self {
            splits: vec![PathBuf::from(&name)],
            name,
            kind: IndexKind::BTree,
            type_traits,
            key_field_count,
            durable,
            merge_policy: None,
            memory_budget: None,
        }
    }

    /// R-tree index over a `dims`-dimensional bounding key.
    pub fn rtree(
        name: impl Into<String>,
        type_traits: Vec<TypeTrait>,
        dims: usize,
        durable: bool,
    ) -> Self {
        let key_field_count = type_traits.len();
        Self {
            kind: IndexKind::RTree { dims },
            ..Self::btree(name, type_traits, key_field_count, durable)
        }
    }

    pub fn with_splits(mut self, splits: Vec<PathBuf>) -> Self {
        self.splits = splits;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Checks the parts of the descriptor that do not depend on the schema codec.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KestrelError::ConfigError("index name is empty".to_string()));
        }
        if self.splits.is_empty() {
            return Err(KestrelError::ConfigError(format!(
                "index {} has no splits",
                self.name
            )));
        }
        if let Some(policy) = &self.merge_policy {
            policy.validate()?;
        }
        if self.memory_budget == Some(0) {
            return Err(KestrelError::InvalidParameter {
                name: "memory_budget".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the split holding `partition`.
    pub fn split_for(&self, partition: usize) -> Result<&Path> {
        if self.splits.is_empty() {
            return Err(KestrelError::ConfigError(format!(
                "index {} has no splits",
                self.name
            )));
        }
        Ok(&self.splits[partition % self.splits.len()])
    }

    /// Returns the physical identity of `partition` under `data_dir`.
    pub fn index_id(&self, data_dir: &Path, partition: usize) -> Result<IndexId> {
        Ok(IndexId::new(data_dir.join(self.split_for(partition)?)))
    }

    /// Builds the LSM configuration, applying overrides to the runtime defaults.
    pub fn lsm_config(&self, storage: &StorageConfig) -> LsmIndexConfig {
        let base = match self.kind {
            IndexKind::BTree => {
                LsmIndexConfig::btree(self.type_traits.clone(), self.key_field_count)
            }
            IndexKind::RTree { dims } => LsmIndexConfig::rtree(self.type_traits.clone(), dims),
        };
        base.with_durable(self.durable)
            .with_fsync(storage.fsync_enabled)
            .with_memory_budget(self.memory_budget.unwrap_or(storage.memory_component_budget))
            .with_merge_policy(self.merge_policy.unwrap_or(storage.merge_policy))
    }
}
