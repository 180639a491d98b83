//! In-memory write buffer of an LSM index.

use crate::entry::{Entry, KeyOrder};
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Bookkeeping charged per entry on top of its bytes.
const ENTRY_OVERHEAD: usize = 32;

/// Map key ordered by the index key order.
#[derive(Debug, Clone)]
struct OrderedKey {
    bytes: Bytes,
    order: Arc<KeyOrder>,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.compare(&self.bytes, &other.bytes)
    }
}

/// Sorted, mutable write buffer for one flush generation.
///
/// Frozen once it exceeds its budget; a frozen component stays readable
/// until its flushed disk component is installed.
#[derive(Debug)]
pub struct MemoryComponent {
    generation: u64,
    order: Arc<KeyOrder>,
    entries: RwLock<BTreeMap<OrderedKey, Entry>>,
    size: AtomicUsize,
}

impl MemoryComponent {
    pub fn new(generation: u64, order: Arc<KeyOrder>) -> Self {
        Self {
            generation,
            order,
            entries: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
        }
    }

    /// Returns the flush generation this buffer belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn key(&self, bytes: Bytes) -> OrderedKey {
        OrderedKey {
            bytes,
            order: Arc::clone(&self.order),
        }
    }

    /// Stores `entry` under `key`, replacing any previous version.
    pub fn put(&self, key: Bytes, entry: Entry) -> Option<Entry> {
        let key_len = key.len();
        let entry_len = entry.bytes().len();
        let previous = self.entries.write().insert(self.key(key), entry);
        match &previous {
            Some(prev) => {
                // Key bytes and overhead are already accounted for.
                self.size.fetch_add(entry_len, AtomicOrdering::Relaxed);
                self.size.fetch_sub(prev.bytes().len(), AtomicOrdering::Relaxed);
            }
            None => {
                self.size
                    .fetch_add(key_len + entry_len + ENTRY_OVERHEAD, AtomicOrdering::Relaxed);
            }
        }
        previous
    }

    /// Returns the newest version stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        let lookup = self.key(Bytes::copy_from_slice(key));
        self.entries.read().get(&lookup).cloned()
    }

    /// Returns entries with keys in `[lo, hi]`, in key order. `None` is unbounded.
    pub fn range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Vec<Entry> {
        let lo = match lo {
            Some(k) => Bound::Included(self.key(Bytes::copy_from_slice(k))),
            None => Bound::Unbounded,
        };
        let hi = match hi {
            Some(k) => Bound::Included(self.key(Bytes::copy_from_slice(k))),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(l), Bound::Included(h)) = (&lo, &hi) {
            if l > h {
                return Vec::new();
            }
        }
        self.entries
            .read()
            .range((lo, hi))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Returns every entry in key order.
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the approximate memory footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size.load(AtomicOrdering::Relaxed)
    }
}
