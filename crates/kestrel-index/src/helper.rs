//! Per-partition access to a shared physical index.

use crate::context::{StorageRuntime, TaskContext};
use crate::descriptor::IndexDescriptor;
use crate::handle::IndexHandle;
use kestrel_common::Result;
use kestrel_lsm::{IndexId, LsmIndex};
use std::sync::Arc;
use tracing::debug;

/// Binds an index descriptor to one partition of a running task.
///
/// Partitions whose splits coincide resolve to the same `IndexId` and share
/// one physical index through the runtime's lifecycle manager.
#[derive(Debug)]
pub struct IndexDataflowHelper {
    descriptor: IndexDescriptor,
    runtime: Arc<StorageRuntime>,
    task: String,
    partition: usize,
    id: IndexId,
}

impl IndexDataflowHelper {
    pub fn new(descriptor: IndexDescriptor, ctx: &TaskContext, partition: usize) -> Result<Self> {
        descriptor.validate()?;
        let runtime = Arc::clone(ctx.runtime());
        let id = descriptor.index_id(&runtime.config().data_dir, partition)?;
        Ok(Self {
            descriptor,
            runtime,
            task: format!("{}/{}", ctx.job_id(), ctx.task_name()),
            partition,
            id,
        })
    }

    pub fn id(&self) -> &IndexId {
        &self.id
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    fn build(&self) -> Result<Arc<LsmIndex>> {
        LsmIndex::new(
            self.id.clone(),
            self.descriptor.lsm_config(self.runtime.config()),
            Arc::clone(self.runtime.scheduler()),
        )
    }

    /// Creates the physical index on disk. Fails if it is open.
    pub fn create(&self) -> Result<()> {
        self.runtime
            .lifecycle()
            .while_closed(&self.id, || self.build()?.create())
    }

    /// Opens the physical index, sharing it with other open callers.
    pub fn open(&self) -> Result<IndexHandle> {
        let index = self.runtime.lifecycle().open(&self.id, || self.build())?;
        debug!(index = %self.id, task = %self.task, partition = self.partition, "Opened index handle");
        Ok(IndexHandle::new(self.id.clone(), self.partition, index))
    }

    /// Releases `handle`. The last close flushes (if durable) and deactivates the index.
    pub fn close(&self, handle: IndexHandle) -> Result<()> {
        let id = handle.release();
        self.runtime.lifecycle().close(&id)
    }

    /// Removes the physical index from disk. Fails if it is open.
    pub fn destroy(&self) -> Result<()> {
        self.runtime
            .lifecycle()
            .while_closed(&self.id, || self.build()?.destroy())
    }

    /// Returns how many handles to this partition's physical index are open.
    pub fn open_count(&self) -> usize {
        self.runtime.lifecycle().open_count(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{SchedulerPolicy, StorageConfig, TypeTrait};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path) -> TaskContext {
        let config = StorageConfig::new(dir).with_scheduler(SchedulerPolicy::Immediate);
        TaskContext::new("job", "op", StorageRuntime::new(config).unwrap())
    }

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::btree("pk", vec![TypeTrait::INT32, TypeTrait::UTF8], 1, false)
    }

    #[test]
    fn test_open_requires_create() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let helper = IndexDataflowHelper::new(descriptor(), &ctx, 0).unwrap();
        assert!(helper.open().is_err());
        assert_eq!(helper.open_count(), 0);

        helper.create().unwrap();
        let handle = helper.open().unwrap();
        assert!(handle.index().is_active());
        assert_eq!(handle.partition(), 0);
        helper.close(handle).unwrap();
    }

    #[test]
    fn test_destroy_refused_while_open() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let helper = IndexDataflowHelper::new(descriptor(), &ctx, 0).unwrap();
        helper.create().unwrap();

        let handle = helper.open().unwrap();
        assert!(helper.destroy().unwrap_err().is_lifecycle_error());
        assert!(helper.create().unwrap_err().is_lifecycle_error());
        helper.close(handle).unwrap();

        helper.destroy().unwrap();
        assert!(!helper.id().path().exists());
    }

    #[test]
    fn test_partitions_sharing_a_split_share_an_index() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let desc = descriptor().with_splits(vec![PathBuf::from("s0"), PathBuf::from("s1")]);
        let p0 = IndexDataflowHelper::new(desc.clone(), &ctx, 0).unwrap();
        let p1 = IndexDataflowHelper::new(desc.clone(), &ctx, 1).unwrap();
        let p2 = IndexDataflowHelper::new(desc, &ctx, 2).unwrap();
        assert_eq!(p0.id(), p2.id());
        assert_ne!(p0.id(), p1.id());

        p0.create().unwrap();
        let a = p0.open().unwrap();
        let b = p2.open().unwrap();
        assert_eq!(p0.open_count(), 2);
        assert_eq!(p1.open_count(), 0);
        p2.close(b).unwrap();
        p0.close(a).unwrap();
        assert_eq!(p0.open_count(), 0);
    }
}
