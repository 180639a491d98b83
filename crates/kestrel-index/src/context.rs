//! Runtime services shared by every task of a storage node.

use crate::lifecycle::IndexLifecycleManager;
use kestrel_common::{Result, StorageConfig};
use kestrel_lsm::{IoScheduler, scheduler_for};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Storage services assembled once from configuration.
///
/// Owns the I/O scheduler every index schedules on and the registry of open
/// physical indexes. The scheduler policy cannot change after construction.
pub struct StorageRuntime {
    config: StorageConfig,
    scheduler: Arc<dyn IoScheduler>,
    lifecycle: IndexLifecycleManager,
}

impl fmt::Debug for StorageRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRuntime")
            .field("data_dir", &self.config.data_dir)
            .field("io_scheduler", &self.config.io_scheduler)
            .finish()
    }
}

impl StorageRuntime {
    /// Validates `config` and starts the configured scheduler.
    pub fn new(config: StorageConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let scheduler = scheduler_for(config.io_scheduler)?;
        info!(
            data_dir = %config.data_dir.display(),
            io_scheduler = %config.io_scheduler,
            memory_component_budget = config.memory_component_budget,
            "Started storage runtime"
        );
        Ok(Arc::new(Self {
            config,
            scheduler,
            lifecycle: IndexLifecycleManager::new(),
        }))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn IoScheduler> {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &IndexLifecycleManager {
        &self.lifecycle
    }

    /// Closes indexes still open and stops the scheduler.
    pub fn shutdown(&self) {
        let leaked = self.lifecycle.shutdown();
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "Storage runtime shut down with open indexes");
        }
        self.scheduler.shutdown();
        info!(data_dir = %self.config.data_dir.display(), "Stopped storage runtime");
    }
}

/// Identity of the task running a dataflow operator, plus its runtime.
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: String,
    task_name: String,
    runtime: Arc<StorageRuntime>,
}

impl TaskContext {
    pub fn new(
        job_id: impl Into<String>,
        task_name: impl Into<String>,
        runtime: Arc<StorageRuntime>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_name: task_name.into(),
            runtime,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn runtime(&self) -> &Arc<StorageRuntime> {
        &self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{MergePolicyConfig, SchedulerPolicy};
    use tempfile::tempdir;

    #[test]
    fn test_runtime_uses_configured_policy() {
        let dir = tempdir().unwrap();
        for policy in [SchedulerPolicy::Immediate, SchedulerPolicy::Sequential] {
            let runtime =
                StorageRuntime::new(StorageConfig::new(dir.path()).with_scheduler(policy)).unwrap();
            assert_eq!(runtime.scheduler().policy(), policy);
            runtime.shutdown();
            assert!(runtime.lifecycle().is_shut_down());
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        assert!(StorageRuntime::new(StorageConfig::new(dir.path()).with_memory_budget(0)).is_err());
        let policy = MergePolicyConfig::Constant { max_components: 0 };
        assert!(StorageRuntime::new(StorageConfig::new(dir.path()).with_merge_policy(policy)).is_err());
    }

    #[test]
    fn test_task_context_accessors() {
        let dir = tempdir().unwrap();
        let runtime = StorageRuntime::new(
            StorageConfig::new(dir.path()).with_scheduler(SchedulerPolicy::Immediate),
        )
        .unwrap();
        let ctx = TaskContext::new("job-1", "insert-op:0", Arc::clone(&runtime));
        assert_eq!(ctx.job_id(), "job-1");
        assert_eq!(ctx.task_name(), "insert-op:0");
        assert!(Arc::ptr_eq(ctx.runtime(), &runtime));
    }
}
