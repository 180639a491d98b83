//! LSM storage for KestrelDB indexes.
//!
//! This crate provides:
//! - Memory components, immutable disk components and a per-generation WAL
//! - Flush and merge I/O operations with waitable tickets
//! - Immediate and sequential I/O schedulers
//! - Merge policies selecting disk components to compact
//! - `LsmIndex`, tying the above into one B-tree or R-tree index

mod component;
mod entry;
mod index;
mod memory;
mod merge_policy;
mod operation;
mod scheduler;
mod wal;

pub use component::{DiskComponent, component_file_name, parse_component_file_name};
pub use entry::{Entry, KeyOrder, merge_runs};
pub use index::{
    DEFAULT_MEMORY_BUDGET, IndexKind, IndexStats, LsmIndex, LsmIndexConfig, MaintenanceFailure,
};
pub use memory::MemoryComponent;
pub use merge_policy::{
    ComponentInfo, ConstantMergePolicy, MergePolicy, NoMergePolicy, PrefixMergePolicy,
    merge_policy_for,
};
pub use operation::{
    ComponentId, IndexId, IoOperation, IoOperationKind, IoOperationTarget, OperationState,
    OperationTicket,
};
pub use scheduler::{ImmediateScheduler, IoScheduler, SequentialScheduler, scheduler_for};
pub use wal::{WalWriter, list_generations, read_wal, wal_file_name};
