//! Tokens for outstanding opens of a physical index.

use kestrel_codec::{TupleReference, TupleWriter};
use kestrel_lsm::{IndexId, LsmIndex};
use std::sync::Arc;
use tracing::warn;

/// One caller's open of a physical index.
///
/// Not `Clone`: every handle stands for exactly one outstanding open and is
/// consumed by `IndexDataflowHelper::close`.
#[derive(Debug)]
pub struct IndexHandle {
    id: IndexId,
    partition: usize,
    index: Arc<LsmIndex>,
    closed: bool,
}

impl IndexHandle {
    pub(crate) fn new(id: IndexId, partition: usize, index: Arc<LsmIndex>) -> Self {
        Self {
            id,
            partition,
            index,
            closed: false,
        }
    }

    pub fn id(&self) -> &IndexId {
        &self.id
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn index(&self) -> &LsmIndex {
        &self.index
    }

    /// Returns a writer bound to the index's tuple schema.
    pub fn tuple_writer(&self) -> TupleWriter {
        TupleWriter::new(self.index.schema().to_vec())
    }

    /// Returns a reusable reader over tuples of this index.
    pub fn tuple_reference<'a>(&self) -> TupleReference<'a> {
        TupleReference::new(Arc::from(self.index.schema()))
    }

    /// Marks the handle as closed and returns its identity.
    pub(crate) fn release(mut self) -> IndexId {
        self.closed = true;
        self.id.clone()
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        if !self.closed {
            warn!(index = %self.id, partition = self.partition, "Index handle dropped without close");
        }
    }
}
