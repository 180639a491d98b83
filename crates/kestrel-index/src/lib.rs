//! Index lifecycle for KestrelDB dataflow operators.
//!
//! This crate provides:
//! - `StorageRuntime`, owning the configured I/O scheduler and open indexes
//! - `TaskContext`, identifying the task an operator runs in
//! - `IndexLifecycleManager`, the reference-counted registry of physical indexes
//! - `IndexDescriptor`, a serializable description of a partitioned index
//! - `IndexDataflowHelper` and `IndexHandle`, pairing every open with one close

mod context;
mod descriptor;
mod handle;
mod helper;
mod lifecycle;

pub use context::{StorageRuntime, TaskContext};
pub use descriptor::IndexDescriptor;
pub use handle::IndexHandle;
pub use helper::IndexDataflowHelper;
pub use lifecycle::IndexLifecycleManager;
