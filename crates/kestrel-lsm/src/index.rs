//! LSM index over B-tree and R-tree tuple layouts.
//!
//! Writes go to a mutable memory component (logged to a WAL when durable).
//! A full memory component is frozen, stays readable, and is flushed to an
//! immutable disk component by a scheduled `Flush` operation. Completed
//! flushes consult the merge policy, which may schedule a `Merge`.
//!
//! Structural changes (installing a flushed or merged component) run under
//! the index's maintenance lock, so at most one happens at a time whatever
//! the scheduler policy. Readers take a snapshot of the component list and
//! never wait for maintenance.

use crate::component::{DiskComponent, TEMP_EXTENSION, parse_component_file_name};
use crate::entry::{Entry, KeyOrder, merge_runs};
use crate::memory::MemoryComponent;
use crate::merge_policy::{ComponentInfo, MergePolicy, merge_policy_for};
use crate::operation::{
    ComponentId, IndexId, IoOperation, IoOperationKind, IoOperationTarget, OperationTicket,
};
use crate::scheduler::IoScheduler;
use crate::wal::{self, WalWriter};
use bytes::{Bytes, BytesMut};
use kestrel_codec::{Mbr, RTreeTupleWriter, TupleReference, validate_tuple};
use kestrel_common::{KestrelError, MergePolicyConfig, Result, TypeTrait};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Default memory component budget (32 MB).
pub const DEFAULT_MEMORY_BUDGET: usize = 32 * 1024 * 1024;

/// Layout of the tuples an index stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexKind {
    /// Tuples ordered by their leading key fields.
    BTree,
    /// Tuples led by a `2 * dims` FLOAT64 bounding key; the whole tuple is the key.
    RTree { dims: usize },
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::BTree => write!(f, "btree"),
            IndexKind::RTree { dims } => write!(f, "rtree({})", dims),
        }
    }
}

/// Static configuration of one LSM index.
#[derive(Debug, Clone)]
pub struct LsmIndexConfig {
    pub kind: IndexKind,
    pub type_traits: Vec<TypeTrait>,
    /// Leading fields forming the key. Ignored for R-trees.
    pub key_field_count: usize,
    /// Log writes before acknowledging them and flush on deactivation.
    pub durable: bool,
    pub fsync_enabled: bool,
    /// Memory component size in bytes that triggers a flush.
    pub memory_budget: usize,
    pub merge_policy: MergePolicyConfig,
}

impl LsmIndexConfig {
    /// B-tree index keyed on the first `key_field_count` fields.
    pub fn btree(type_traits: Vec<TypeTrait>, key_field_count: usize) -> Self {
        Self {
            kind: IndexKind::BTree,
            type_traits,
            key_field_count,
            durable: true,
            fsync_enabled: true,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            merge_policy: MergePolicyConfig::default(),
        }
    }

    /// R-tree index with a `dims`-dimensional bounding key.
    pub fn rtree(type_traits: Vec<TypeTrait>, dims: usize) -> Self {
        let key_field_count = type_traits.len();
        Self {
            kind: IndexKind::RTree { dims },
            key_field_count,
            ..Self::btree(type_traits, key_field_count)
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_fsync(mut self, fsync_enabled: bool) -> Self {
        self.fsync_enabled = fsync_enabled;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.merge_policy = policy;
        self
    }
}

/// A maintenance problem recorded for the index owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceFailure {
    /// Operation that failed, or `None` for a component rejected while loading.
    pub operation: Option<IoOperationKind>,
    pub component: ComponentId,
    pub reason: String,
}

/// Point-in-time index statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub memory_bytes: usize,
    pub memory_entries: usize,
    pub frozen_components: usize,
    pub disk_components: usize,
    pub flushes_completed: u64,
    pub flushes_failed: u64,
    pub merges_completed: u64,
    pub merges_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes_completed: AtomicU64,
    flushes_failed: AtomicU64,
    merges_completed: AtomicU64,
    merges_failed: AtomicU64,
}

struct IndexState {
    active: bool,
    memory: Arc<MemoryComponent>,
    /// Frozen memory components awaiting flush, newest first.
    frozen: Vec<Arc<MemoryComponent>>,
    /// Installed disk components, newest first.
    disk: Vec<Arc<DiskComponent>>,
    wal: Option<WalWriter>,
    next_generation: u64,
    /// Generations with a flush scheduled or running.
    flushing: HashSet<u64>,
    merging: bool,
}

/// A readable component in a snapshot.
enum Source {
    Memory(Arc<MemoryComponent>),
    Disk(Arc<DiskComponent>),
}

impl Source {
    fn generation(&self) -> u64 {
        match self {
            Source::Memory(m) => m.generation(),
            Source::Disk(d) => d.id().max,
        }
    }

    fn get(&self, key: &[u8]) -> Option<Entry> {
        match self {
            Source::Memory(m) => m.get(key),
            Source::Disk(d) => d.get(key).cloned(),
        }
    }

    fn range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Vec<Entry> {
        match self {
            Source::Memory(m) => m.range(lo, hi),
            Source::Disk(d) => d.range(lo, hi).to_vec(),
        }
    }
}

/// A log-structured merge index stored in one directory.
pub struct LsmIndex {
    id: IndexId,
    config: LsmIndexConfig,
    schema: Arc<[TypeTrait]>,
    key_schema: Arc<[TypeTrait]>,
    rtree: Option<RTreeTupleWriter>,
    order: Arc<KeyOrder>,
    scheduler: Arc<dyn IoScheduler>,
    merge_policy: Box<dyn MergePolicy>,
    state: RwLock<IndexState>,
    /// Held by writers for their whole call; taken exclusively to deactivate.
    write_gate: RwLock<()>,
    /// Serializes structural changes.
    maintenance: Mutex<()>,
    tickets: Mutex<Vec<OperationTicket>>,
    failures: Mutex<Vec<MaintenanceFailure>>,
    counters: Counters,
    self_ref: Weak<LsmIndex>,
}

impl fmt::Debug for LsmIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LsmIndex")
            .field("id", &self.id)
            .field("kind", &self.config.kind)
            .field("durable", &self.config.durable)
            .field("policy", &self.scheduler.policy())
            .finish()
    }
}

impl LsmIndex {
    /// Creates an inactive index rooted at `id`'s directory.
    pub fn new(
        id: IndexId,
        mut config: LsmIndexConfig,
        scheduler: Arc<dyn IoScheduler>,
    ) -> Result<Arc<Self>> {
        if config.type_traits.is_empty() {
            return Err(KestrelError::ConfigError("index has no fields".to_string()));
        }
        if config.memory_budget == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "memory_budget".to_string(),
                value: "0".to_string(),
            });
        }
        config.merge_policy.validate()?;

        let schema: Arc<[TypeTrait]> = Arc::from(config.type_traits.clone());
        let rtree = match config.kind {
            IndexKind::BTree => {
                if config.key_field_count == 0 || config.key_field_count > schema.len() {
                    return Err(KestrelError::InvalidParameter {
                        name: "key_field_count".to_string(),
                        value: config.key_field_count.to_string(),
                    });
                }
                None
            }
            IndexKind::RTree { dims } => {
                config.key_field_count = schema.len();
                Some(RTreeTupleWriter::new(Arc::clone(&schema), dims)?)
            }
        };
        let key_schema: Arc<[TypeTrait]> = Arc::from(&schema[..config.key_field_count]);
        let order = Arc::new(KeyOrder::new(Arc::clone(&schema), config.key_field_count));
        let merge_policy = merge_policy_for(&config.merge_policy);

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            state: RwLock::new(IndexState {
                active: false,
                memory: Arc::new(MemoryComponent::new(1, Arc::clone(&order))),
                frozen: Vec::new(),
                disk: Vec::new(),
                wal: None,
                next_generation: 2,
                flushing: HashSet::new(),
                merging: false,
            }),
            config,
            schema,
            key_schema,
            rtree,
            order,
            scheduler,
            merge_policy,
            write_gate: RwLock::new(()),
            maintenance: Mutex::new(()),
            tickets: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn id(&self) -> &IndexId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        self.id.path()
    }

    pub fn kind(&self) -> IndexKind {
        self.config.kind
    }

    pub fn config(&self) -> &LsmIndexConfig {
        &self.config
    }

    pub fn schema(&self) -> &[TypeTrait] {
        &self.schema
    }

    pub fn key_schema(&self) -> &[TypeTrait] {
        &self.key_schema
    }

    pub fn is_durable(&self) -> bool {
        self.config.durable
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    fn check_active(&self, state: &IndexState) -> Result<()> {
        if !state.active {
            return Err(KestrelError::Lifecycle(format!(
                "index {} is not active",
                self.id
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Creates the index directory.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.dir())?;
        info!(index = %self.id, kind = %self.config.kind, durable = self.config.durable, "Created index");
        Ok(())
    }

    /// Returns true if the index directory exists.
    pub fn exists(&self) -> bool {
        self.dir().is_dir()
    }

    /// Loads disk components, replays the WAL and starts accepting operations.
    pub fn activate(&self) -> Result<()> {
        {
            let _maintenance = self.maintenance.lock();
            if self.state.read().active {
                return Err(KestrelError::Lifecycle(format!(
                    "index {} is already active",
                    self.id
                )));
            }
            if !self.exists() {
                return Err(KestrelError::IndexNotFound(self.id.to_string()));
            }

            let disk = self.load_disk_components()?;
            let mut max_generation = disk.first().map(|c| c.id().max).unwrap_or(0);

            let mut frozen = Vec::new();
            for (generation, path) in wal::list_generations(self.dir())? {
                max_generation = max_generation.max(generation);
                let flushed = disk
                    .iter()
                    .any(|c| c.id().covers(&ComponentId::flushed(generation)));
                if !self.config.durable || flushed {
                    debug!(index = %self.id, generation, "Removing obsolete WAL generation");
                    fs::remove_file(&path)?;
                    continue;
                }

                let entries = wal::read_wal(&path)?;
                if entries.is_empty() {
                    fs::remove_file(&path)?;
                    continue;
                }
                let memory = MemoryComponent::new(generation, Arc::clone(&self.order));
                let replayed = entries.len();
                for entry in entries {
                    memory.put(entry.bytes().clone(), entry);
                }
                info!(index = %self.id, generation, entries = replayed, "Replayed WAL generation");
                frozen.insert(0, Arc::new(memory));
            }

            let generation = max_generation + 1;
            let wal = if self.config.durable {
                Some(WalWriter::create(
                    self.dir(),
                    generation,
                    self.config.fsync_enabled,
                )?)
            } else {
                None
            };

            let disk_count = disk.len();
            let frozen_count = frozen.len();
            *self.state.write() = IndexState {
                active: true,
                memory: Arc::new(MemoryComponent::new(generation, Arc::clone(&self.order))),
                frozen,
                disk,
                wal,
                next_generation: generation + 1,
                flushing: HashSet::new(),
                merging: false,
            };
            info!(
                index = %self.id,
                disk_components = disk_count,
                recovered = frozen_count,
                "Activated index"
            );
        }

        self.retry_failed_flushes()?;
        self.maybe_schedule_merge();
        Ok(())
    }

    fn load_disk_components(&self) -> Result<Vec<Arc<DiskComponent>>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension() == Some(OsStr::new(TEMP_EXTENSION)) {
                warn!(index = %self.id, path = %path.display(), "Removing incomplete component file");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some(id) = parse_component_file_name(&entry.file_name().to_string_lossy()) {
                found.push((id, path));
            }
        }

        // Inputs of a merge that installed its output but did not finish cleanup.
        let ids: Vec<ComponentId> = found.iter().map(|(id, _)| *id).collect();
        let mut kept = Vec::with_capacity(found.len());
        for (id, path) in found {
            if ids.iter().any(|other| *other != id && other.covers(&id)) {
                debug!(index = %self.id, component = %id, "Removing merged component file");
                fs::remove_file(&path)?;
            } else {
                kept.push((id, path));
            }
        }
        kept.sort_by(|a, b| b.0.max.cmp(&a.0.max));

        let mut disk = Vec::with_capacity(kept.len());
        for (id, path) in kept {
            match DiskComponent::open(&path, id, Arc::clone(&self.order)) {
                Ok(component) => disk.push(Arc::new(component)),
                Err(e) => {
                    error!(index = %self.id, component = %id, error = %e, "Rejected disk component");
                    self.record_failure(None, id, &e);
                }
            }
        }
        Ok(disk)
    }

    /// Stops the index.
    ///
    /// Pending operations are cancelled and running ones waited for. A
    /// durable index then flushes every memory component; a non-durable one
    /// discards them.
    pub fn deactivate(&self) -> Result<()> {
        {
            let _gate = self.write_gate.write();
            let mut state = self.state.write();
            self.check_active(&state)?;
            state.active = false;
        }

        loop {
            self.scheduler.cancel_pending(&self.id);
            let tickets = std::mem::take(&mut *self.tickets.lock());
            if tickets.is_empty() {
                break;
            }
            for ticket in tickets {
                // Outcomes are recorded by the completion callbacks.
                let _ = ticket.wait();
            }
        }

        let _maintenance = self.maintenance.lock();
        let to_flush: Vec<u64> = {
            let mut state = self.state.write();
            if let Some(mut wal) = state.wal.take() {
                if let Err(e) = wal.sync() {
                    warn!(index = %self.id, error = %e, "Failed to sync WAL on deactivation");
                }
            }
            if self.config.durable {
                if !state.memory.is_empty() {
                    let next = Arc::new(MemoryComponent::new(
                        state.next_generation,
                        Arc::clone(&self.order),
                    ));
                    state.next_generation += 1;
                    let memory = std::mem::replace(&mut state.memory, next);
                    state.frozen.insert(0, memory);
                }
                state.frozen.iter().rev().map(|m| m.generation()).collect()
            } else {
                let discarded: usize = state.frozen.iter().map(|m| m.len()).sum::<usize>()
                    + state.memory.len();
                if discarded > 0 {
                    debug!(index = %self.id, entries = discarded, "Discarding non-durable memory components");
                }
                Vec::new()
            }
        };

        let mut result = Ok(());
        for generation in to_flush {
            match self.flush_generation(generation) {
                Ok(()) => {
                    self.counters.flushes_completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(index = %self.id, generation, error = %e, "Flush on deactivation failed");
                    self.counters.flushes_failed.fetch_add(1, Ordering::Relaxed);
                    self.record_failure(
                        Some(IoOperationKind::Flush),
                        ComponentId::flushed(generation),
                        &e,
                    );
                    result = Err(e);
                    break;
                }
            }
        }

        {
            let mut state = self.state.write();
            state.frozen.clear();
            state.disk.clear();
            state.flushing.clear();
            state.merging = false;
            state.memory = Arc::new(MemoryComponent::new(
                state.next_generation,
                Arc::clone(&self.order),
            ));
        }
        info!(index = %self.id, "Deactivated index");
        result
    }

    /// Removes the index directory. The index must be inactive.
    pub fn destroy(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock();
        if self.state.read().active {
            return Err(KestrelError::Lifecycle(format!(
                "cannot destroy active index {}",
                self.id
            )));
        }
        match fs::remove_dir_all(self.dir()) {
            Ok(()) => {
                info!(index = %self.id, "Destroyed index");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Inserts a tuple. Fails with `DuplicateKey` if its key is live.
    pub fn insert(&self, tuple: &[u8]) -> Result<()> {
        self.write_tuple(tuple, true)
    }

    /// Inserts a tuple, replacing any live tuple with the same key.
    pub fn upsert(&self, tuple: &[u8]) -> Result<()> {
        self.write_tuple(tuple, false)
    }

    fn write_tuple(&self, tuple: &[u8], unique: bool) -> Result<()> {
        validate_tuple(&self.schema, tuple)?;
        let _gate = self.write_gate.read();
        let flush = {
            let mut state = self.state.write();
            self.check_active(&state)?;
            if unique && Self::is_live(&Self::sources(&state), tuple) {
                return Err(KestrelError::DuplicateKey);
            }
            self.apply(&mut state, Entry::Tuple(Bytes::copy_from_slice(tuple)))?
        };
        if let Some(op) = flush {
            self.submit_flush(op);
        }
        Ok(())
    }

    /// Deletes the tuple stored under `key`. Returns false if none was live.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        validate_tuple(&self.key_schema, key)?;
        let _gate = self.write_gate.read();
        let flush = {
            let mut state = self.state.write();
            self.check_active(&state)?;
            if !Self::is_live(&Self::sources(&state), key) {
                return Ok(false);
            }
            self.apply(&mut state, Entry::Antimatter(Bytes::copy_from_slice(key)))?
        };
        if let Some(op) = flush {
            self.submit_flush(op);
        }
        Ok(true)
    }

    /// Logs and buffers one entry. Returns a flush when the budget is exceeded.
    fn apply(&self, state: &mut IndexState, entry: Entry) -> Result<Option<IoOperation>> {
        if let Some(wal) = state.wal.as_mut() {
            wal.append(&entry)?;
        }
        state.memory.put(entry.bytes().clone(), entry);
        if state.memory.size_bytes() < self.config.memory_budget {
            return Ok(None);
        }
        // The entry is durable and visible from here on; a failed freeze is
        // retried by the next write or flush instead of failing this one.
        let generation = state.memory.generation();
        match self.freeze(state) {
            Ok(op) => Ok(op),
            Err(e) => {
                error!(index = %self.id, generation, error = %e, "Failed to freeze memory component");
                self.record_failure(
                    Some(IoOperationKind::Flush),
                    ComponentId::flushed(generation),
                    &e,
                );
                Ok(None)
            }
        }
    }

    /// Freezes the memory component and starts a new WAL generation.
    fn freeze(&self, state: &mut IndexState) -> Result<Option<IoOperation>> {
        if state.memory.is_empty() {
            return Ok(None);
        }
        let frozen_generation = state.memory.generation();
        let op = self.operation(
            IoOperationKind::Flush,
            Vec::new(),
            ComponentId::flushed(frozen_generation),
        )?;

        let generation = state.next_generation;
        let wal = if self.config.durable {
            Some(WalWriter::create(
                self.dir(),
                generation,
                self.config.fsync_enabled,
            )?)
        } else {
            None
        };
        state.next_generation += 1;
        state.wal = wal;
        let next = Arc::new(MemoryComponent::new(generation, Arc::clone(&self.order)));
        let frozen = std::mem::replace(&mut state.memory, next);
        debug!(
            index = %self.id,
            generation = frozen_generation,
            entries = frozen.len(),
            bytes = frozen.size_bytes(),
            "Froze memory component"
        );
        state.frozen.insert(0, frozen);
        state.flushing.insert(frozen_generation);
        self.failures.lock().retain(|f| {
            !(f.operation == Some(IoOperationKind::Flush)
                && f.component == ComponentId::flushed(frozen_generation))
        });
        Ok(Some(op))
    }

    /// Freezes the memory component and schedules its flush.
    ///
    /// Returns `None` if the memory component is empty.
    pub fn flush(&self) -> Result<Option<OperationTicket>> {
        let _gate = self.write_gate.read();
        let op = {
            let mut state = self.state.write();
            self.check_active(&state)?;
            self.freeze(&mut state)?
        };
        let Some(op) = op else {
            return Ok(None);
        };
        let generation = op.output().max;
        match self.submit(op) {
            Ok(ticket) => Ok(Some(ticket)),
            Err(e) => {
                self.state.write().flushing.remove(&generation);
                self.record_failure(
                    Some(IoOperationKind::Flush),
                    ComponentId::flushed(generation),
                    &e,
                );
                Err(e)
            }
        }
    }

    /// Reschedules flushes for frozen components whose flush failed.
    ///
    /// Returns the number of flushes scheduled.
    pub fn retry_failed_flushes(&self) -> Result<usize> {
        let _gate = self.write_gate.read();
        let (generations, ops) = {
            let mut state = self.state.write();
            self.check_active(&state)?;
            let generations: Vec<u64> = state
                .frozen
                .iter()
                .rev()
                .map(|m| m.generation())
                .filter(|g| !state.flushing.contains(g))
                .collect();
            let mut ops = Vec::with_capacity(generations.len());
            for &generation in &generations {
                ops.push(self.operation(
                    IoOperationKind::Flush,
                    Vec::new(),
                    ComponentId::flushed(generation),
                )?);
                state.flushing.insert(generation);
            }
            (generations, ops)
        };

        self.failures.lock().retain(|f| {
            !(f.operation == Some(IoOperationKind::Flush)
                && generations.contains(&f.component.max))
        });
        let scheduled = ops.len();
        for op in ops {
            self.submit_flush(op);
        }
        if scheduled > 0 {
            info!(index = %self.id, scheduled, "Scheduled flushes for frozen components");
        }
        Ok(scheduled)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    fn sources(state: &IndexState) -> Vec<Source> {
        let mut sources: Vec<Source> = std::iter::once(&state.memory)
            .chain(state.frozen.iter())
            .map(|m| Source::Memory(Arc::clone(m)))
            .chain(state.disk.iter().map(|d| Source::Disk(Arc::clone(d))))
            .collect();
        sources.sort_by(|a, b| b.generation().cmp(&a.generation()));
        sources
    }

    fn snapshot(&self) -> Result<Vec<Source>> {
        let state = self.state.read();
        self.check_active(&state)?;
        Ok(Self::sources(&state))
    }

    fn is_live(sources: &[Source], key: &[u8]) -> bool {
        sources
            .iter()
            .find_map(|s| s.get(key))
            .is_some_and(|e| !e.is_antimatter())
    }

    /// Returns the newest tuple stored under `key`.
    pub fn search(&self, key: &[u8]) -> Result<Option<Bytes>> {
        validate_tuple(&self.key_schema, key)?;
        let sources = self.snapshot()?;
        Ok(sources
            .iter()
            .find_map(|s| s.get(key))
            .and_then(Entry::into_tuple))
    }

    /// Returns live tuples with keys in `[lo, hi]`, in key order. `None` is unbounded.
    pub fn range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<Vec<Bytes>> {
        for bound in lo.iter().chain(hi.iter()) {
            validate_tuple(&self.key_schema, bound)?;
        }
        let sources = self.snapshot()?;
        let runs = sources.iter().map(|s| s.range(lo, hi)).collect();
        Ok(merge_runs(&self.order, runs, true)
            .into_iter()
            .filter_map(Entry::into_tuple)
            .collect())
    }

    /// Returns every live tuple in key order.
    pub fn scan(&self) -> Result<Vec<Bytes>> {
        self.range(None, None)
    }

    /// Returns live tuples whose bounding key intersects `query`.
    pub fn search_rtree(&self, query: &Mbr) -> Result<Vec<Bytes>> {
        let rtree = self
            .rtree
            .as_ref()
            .ok_or_else(|| KestrelError::InvalidParameter {
                name: "kind".to_string(),
                value: self.config.kind.to_string(),
            })?;
        let mut hits = Vec::new();
        for tuple in self.scan()? {
            if rtree.bounding_key_of(&tuple)?.intersects(query) {
                hits.push(tuple);
            }
        }
        Ok(hits)
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    fn operation(
        &self,
        kind: IoOperationKind,
        inputs: Vec<ComponentId>,
        output: ComponentId,
    ) -> Result<IoOperation> {
        let target = self
            .self_ref
            .upgrade()
            .ok_or_else(|| KestrelError::Internal(format!("index {} dropped", self.id)))?;
        Ok(IoOperation::new(
            kind,
            self.id.clone(),
            inputs,
            output,
            target as Arc<dyn IoOperationTarget>,
        ))
    }

    fn submit(&self, op: IoOperation) -> Result<OperationTicket> {
        let ticket = op.ticket().clone();
        {
            let mut tickets = self.tickets.lock();
            tickets.retain(|t| !t.state().is_terminal());
            tickets.push(ticket.clone());
        }
        match self.scheduler.schedule(op) {
            Ok(ticket) => Ok(ticket),
            Err(e) => {
                ticket.cancel();
                Err(e)
            }
        }
    }

    fn submit_flush(&self, op: IoOperation) {
        let generation = op.output().max;
        if let Err(e) = self.submit(op) {
            error!(index = %self.id, generation, error = %e, "Failed to schedule flush");
            self.state.write().flushing.remove(&generation);
            self.record_failure(
                Some(IoOperationKind::Flush),
                ComponentId::flushed(generation),
                &e,
            );
        }
    }

    fn maybe_schedule_merge(&self) {
        let (inputs, output) = {
            let mut state = self.state.write();
            if !state.active || state.merging {
                return;
            }
            let infos: Vec<ComponentInfo> = state.disk.iter().map(|c| c.info()).collect();
            let Some(inputs) = self.merge_policy.select(&infos) else {
                return;
            };
            let Some(output) = ComponentId::merged(&inputs) else {
                return;
            };
            // A frozen generation inside the range would be ordered wrongly after the merge.
            let spans_frozen = state
                .frozen
                .iter()
                .any(|m| output.covers(&ComponentId::flushed(m.generation())));
            if inputs.len() < 2 || spans_frozen {
                return;
            }
            state.merging = true;
            (inputs, output)
        };

        debug!(index = %self.id, policy = self.merge_policy.name(), inputs = inputs.len(), output = %output, "Scheduling merge");
        let result = self
            .operation(IoOperationKind::Merge, inputs, output)
            .and_then(|op| self.submit(op));
        if let Err(e) = result {
            warn!(index = %self.id, error = %e, "Failed to schedule merge");
            self.state.write().merging = false;
        }
    }

    /// Writes a frozen memory component to disk and installs it.
    ///
    /// Caller holds the maintenance lock.
    fn flush_generation(&self, generation: u64) -> Result<()> {
        let (frozen, drop_antimatter) = {
            let state = self.state.read();
            let frozen = state
                .frozen
                .iter()
                .find(|m| m.generation() == generation)
                .cloned()
                .ok_or_else(|| {
                    KestrelError::Internal(format!(
                        "no frozen memory component for generation {}",
                        generation
                    ))
                })?;
            // Antimatter is only needed to hide versions in older components.
            let has_older = state.disk.iter().any(|c| c.id().min < generation)
                || state.frozen.iter().any(|m| m.generation() < generation);
            (frozen, !has_older)
        };

        let mut entries = frozen.entries();
        if drop_antimatter {
            entries.retain(|e| !e.is_antimatter());
        }
        let id = ComponentId::flushed(generation);
        let component = DiskComponent::write(
            self.dir(),
            id,
            entries,
            Arc::clone(&self.order),
            self.config.fsync_enabled,
        )?;

        {
            let mut state = self.state.write();
            state.frozen.retain(|m| m.generation() != generation);
            let pos = state.disk.partition_point(|c| c.id().max > generation);
            state.disk.insert(pos, Arc::new(component));
        }

        if self.config.durable {
            let wal_path = self.dir().join(wal::wal_file_name(generation));
            match fs::remove_file(&wal_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(index = %self.id, generation, error = %e, "Failed to delete WAL generation")
                }
            }
        }
        Ok(())
    }

    /// Merges disk components and swaps the output in for the inputs.
    ///
    /// Caller holds the maintenance lock.
    fn merge_components(&self, inputs: &[ComponentId], output: ComponentId) -> Result<()> {
        let (components, drop_antimatter) = {
            let state = self.state.read();
            let components = inputs
                .iter()
                .map(|id| {
                    state
                        .disk
                        .iter()
                        .find(|c| c.id() == *id)
                        .cloned()
                        .ok_or_else(|| {
                            KestrelError::Internal(format!("merge input {} not installed", id))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let includes_oldest = state.disk.last().map(|c| c.id()) == inputs.last().copied();
            let older_frozen = state.frozen.iter().any(|m| m.generation() < output.min);
            (components, includes_oldest && !older_frozen)
        };

        let runs = components.iter().map(|c| c.entries().to_vec()).collect();
        let mut merged = merge_runs(&self.order, runs, drop_antimatter);
        if let Some(writer) = &self.rtree {
            merged = self.copy_rtree_entries(writer, merged)?;
        }
        let component = DiskComponent::write(
            self.dir(),
            output,
            merged,
            Arc::clone(&self.order),
            self.config.fsync_enabled,
        )?;

        {
            let mut state = self.state.write();
            let start = state.disk.iter().position(|c| c.id() == inputs[0]);
            let contiguous = start.is_some_and(|s| {
                s + inputs.len() <= state.disk.len()
                    && state.disk[s..s + inputs.len()]
                        .iter()
                        .map(|c| c.id())
                        .eq(inputs.iter().copied())
            });
            match start {
                Some(s) if contiguous => {
                    state
                        .disk
                        .splice(s..s + inputs.len(), [Arc::new(component)]);
                }
                _ => {
                    drop(state);
                    if let Err(e) = component.delete_file() {
                        warn!(index = %self.id, component = %output, error = %e, "Failed to remove stale merge output");
                    }
                    return Err(KestrelError::Internal(format!(
                        "merge inputs of {} changed during merge",
                        output
                    )));
                }
            }
        }

        for c in components {
            if let Err(e) = c.delete_file() {
                warn!(index = %self.id, component = %c.id(), error = %e, "Failed to delete merged component");
            }
        }
        Ok(())
    }

    /// Re-encodes surviving R-tree tuples into one contiguous arena for the merge output.
    fn copy_rtree_entries(&self, writer: &RTreeTupleWriter, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let mut arena = BytesMut::with_capacity(entries.iter().map(|e| e.bytes().len()).sum());
        let mut copied = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Entry::Tuple(tuple) => {
                    let src = TupleReference::at(Arc::clone(&self.schema), &tuple, 0);
                    writer.write_copy(&src, &mut arena)?;
                    copied.push(Entry::Tuple(arena.split().freeze()));
                }
                antimatter => copied.push(antimatter),
            }
        }
        Ok(copied)
    }

    fn record_failure(&self, operation: Option<IoOperationKind>, component: ComponentId, e: &KestrelError) {
        self.failures.lock().push(MaintenanceFailure {
            operation,
            component,
            reason: e.to_string(),
        });
    }

    /// Returns recorded maintenance failures, oldest first.
    pub fn maintenance_failures(&self) -> Vec<MaintenanceFailure> {
        self.failures.lock().clone()
    }

    /// Blocks until every operation this index has scheduled is terminal.
    pub fn wait_for_maintenance(&self) {
        loop {
            let tickets: Vec<OperationTicket> = self
                .tickets
                .lock()
                .iter()
                .filter(|t| !t.state().is_terminal())
                .cloned()
                .collect();
            if tickets.is_empty() {
                return;
            }
            for ticket in tickets {
                let _ = ticket.wait();
            }
        }
    }

    /// Returns metadata of installed disk components, newest first.
    pub fn disk_components(&self) -> Vec<ComponentInfo> {
        self.state.read().disk.iter().map(|c| c.info()).collect()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            memory_bytes: state.memory.size_bytes(),
            memory_entries: state.memory.len(),
            frozen_components: state.frozen.len(),
            disk_components: state.disk.len(),
            flushes_completed: self.counters.flushes_completed.load(Ordering::Relaxed),
            flushes_failed: self.counters.flushes_failed.load(Ordering::Relaxed),
            merges_completed: self.counters.merges_completed.load(Ordering::Relaxed),
            merges_failed: self.counters.merges_failed.load(Ordering::Relaxed),
        }
    }
}

impl IoOperationTarget for LsmIndex {
    fn execute(&self, op: &IoOperation) -> Result<()> {
        let _maintenance = self.maintenance.lock();
        match op.kind() {
            IoOperationKind::Flush => self.flush_generation(op.output().max),
            IoOperationKind::Merge => self.merge_components(op.inputs(), op.output()),
        }
    }

    fn on_completion(&self, op: &IoOperation, result: &Result<()>) {
        match (op.kind(), result) {
            (IoOperationKind::Flush, Ok(())) => {
                self.counters.flushes_completed.fetch_add(1, Ordering::Relaxed);
                self.state.write().flushing.remove(&op.output().max);
                info!(index = %self.id, component = %op.output(), "Flushed memory component");
                self.maybe_schedule_merge();
            }
            (IoOperationKind::Flush, Err(e)) => {
                self.counters.flushes_failed.fetch_add(1, Ordering::Relaxed);
                self.state.write().flushing.remove(&op.output().max);
                self.record_failure(Some(IoOperationKind::Flush), op.output(), e);
            }
            (IoOperationKind::Merge, Ok(())) => {
                self.counters.merges_completed.fetch_add(1, Ordering::Relaxed);
                self.state.write().merging = false;
                info!(index = %self.id, component = %op.output(), inputs = op.inputs().len(), "Merged disk components");
                self.maybe_schedule_merge();
            }
            (IoOperationKind::Merge, Err(e)) => {
                self.counters.merges_failed.fetch_add(1, Ordering::Relaxed);
                self.state.write().merging = false;
                self.record_failure(Some(IoOperationKind::Merge), op.output(), e);
            }
        }
    }

    fn on_cancelled(&self, op: &IoOperation) {
        warn!(index = %self.id, op = op.id(), kind = %op.kind(), "Operation cancelled");
        let mut state = self.state.write();
        match op.kind() {
            IoOperationKind::Flush => {
                state.flushing.remove(&op.output().max);
            }
            IoOperationKind::Merge => state.merging = false,
        }
    }
}
