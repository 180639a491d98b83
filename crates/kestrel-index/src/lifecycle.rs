//! Reference-counted registry of open physical indexes.
//!
//! Every physical index is identified by its `IndexId`. The first `open` of an
//! identity builds and activates the index, later opens share it, and the
//! last `close` deactivates it. All transitions for one identity serialize on
//! that identity's slot lock; the registry map lock is only held to find or
//! insert a slot, so different identities never wait on each other.

use kestrel_common::{KestrelError, Result};
use kestrel_lsm::{IndexId, LsmIndex};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Default)]
struct SlotState {
    index: Option<Arc<LsmIndex>>,
    refcount: usize,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

/// Owns every open physical index and its open count.
#[derive(Default)]
pub struct IndexLifecycleManager {
    slots: Mutex<HashMap<IndexId, Arc<Slot>>>,
    shut_down: AtomicBool,
}

impl IndexLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &IndexId) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(id.clone()).or_default())
    }

    /// Drops the slot of `id` if it is closed and nobody else holds it.
    ///
    /// Never blocks on the slot lock while holding the map lock; a slot still
    /// shared with another caller is left for that caller to release.
    fn release_slot(&self, id: &IndexId, slot: Arc<Slot>) {
        let mut slots = self.slots.lock();
        // One reference in the map, one held here.
        if Arc::strong_count(&slot) != 2 {
            return;
        }
        let unused = slot
            .state
            .try_lock()
            .is_some_and(|state| state.refcount == 0);
        if unused {
            slots.remove(id);
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(KestrelError::Lifecycle(
                "index lifecycle manager is shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens `id`, building and activating it with `build` if it is not open yet.
    pub fn open<F>(&self, id: &IndexId, build: F) -> Result<Arc<LsmIndex>>
    where
        F: FnOnce() -> Result<Arc<LsmIndex>>,
    {
        self.check_running()?;
        let slot = self.slot(id);
        let result = {
            let mut state = slot.state.lock();
            // Shutdown may have closed this slot while we waited for it.
            if let Err(e) = self.check_running() {
                Err(e)
            } else if let Some(index) = state.index.clone() {
                state.refcount += 1;
                debug!(index = %id, refcount = state.refcount, "Shared open index");
                Ok(index)
            } else {
                match build().and_then(|index| index.activate().map(|()| index)) {
                    Ok(index) => {
                        state.index = Some(Arc::clone(&index));
                        state.refcount = 1;
                        debug!(index = %id, refcount = 1, "Opened index");
                        Ok(index)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        if result.is_err() {
            self.release_slot(id, slot);
        }
        result
    }

    /// Releases one open of `id`, deactivating the index on the last close.
    pub fn close(&self, id: &IndexId) -> Result<()> {
        let slot = self
            .slots
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| KestrelError::Lifecycle(format!("close of unopened index {}", id)))?;

        let result = {
            let mut state = slot.state.lock();
            if state.refcount == 0 {
                Err(KestrelError::Lifecycle(format!(
                    "close of unopened index {}",
                    id
                )))
            } else {
                state.refcount -= 1;
                debug!(index = %id, refcount = state.refcount, "Closed index handle");
                match state.index.take() {
                    Some(index) if state.refcount == 0 => index.deactivate(),
                    Some(index) => {
                        state.index = Some(index);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        };
        self.release_slot(id, slot);
        result
    }

    /// Runs `f` while holding `id`'s slot, failing if the index is open.
    ///
    /// Used for create and destroy so they cannot race an open.
    pub fn while_closed<T, F>(&self, id: &IndexId, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.check_running()?;
        let slot = self.slot(id);
        let result = {
            let state = slot.state.lock();
            if state.refcount > 0 {
                Err(KestrelError::Lifecycle(format!(
                    "index {} is open by {} caller(s)",
                    id, state.refcount
                )))
            } else {
                f()
            }
        };
        self.release_slot(id, slot);
        result
    }

    /// Returns how many opens of `id` are outstanding.
    pub fn open_count(&self, id: &IndexId) -> usize {
        let slot = self.slots.lock().get(id).cloned();
        slot.map(|s| s.state.lock().refcount).unwrap_or(0)
    }

    pub fn is_open(&self, id: &IndexId) -> bool {
        self.open_count(id) > 0
    }

    /// Returns the identities of all open indexes, sorted.
    pub fn open_indexes(&self) -> Vec<IndexId> {
        let slots: Vec<(IndexId, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        let mut open: Vec<IndexId> = slots
            .into_iter()
            .filter(|(_, slot)| slot.state.lock().refcount > 0)
            .map(|(id, _)| id)
            .collect();
        open.sort();
        open
    }

    /// Refuses further opens and force-closes every open index.
    ///
    /// Returns the identities that were still open.
    pub fn shutdown(&self) -> Vec<IndexId> {
        self.shut_down.store(true, Ordering::Release);
        let slots: Vec<(IndexId, Arc<Slot>)> = self.slots.lock().drain().collect();
        let mut closed = Vec::new();
        for (id, slot) in slots {
            let mut state = slot.state.lock();
            if let Some(index) = state.index.take() {
                warn!(index = %id, refcount = state.refcount, "Closing index still open at shutdown");
                if let Err(e) = index.deactivate() {
                    warn!(index = %id, error = %e, "Failed to deactivate index at shutdown");
                }
                closed.push(id);
            }
            state.refcount = 0;
        }
        closed.sort();
        closed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
