//! Index entries and the key order shared by every component.

use bytes::Bytes;
use kestrel_codec::compare_tuples;
use kestrel_common::{KestrelError, Result, TypeTrait};
use std::cmp::Ordering;
use std::sync::Arc;

/// Entry flag for a live tuple.
pub const ENTRY_TUPLE: u8 = 0;
/// Entry flag for antimatter.
pub const ENTRY_ANTIMATTER: u8 = 1;

/// One versioned entry of an LSM index.
///
/// A tuple entry holds the full encoded tuple. Antimatter holds only the
/// encoded key and hides older versions of that key in older components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Tuple(Bytes),
    Antimatter(Bytes),
}

impl Entry {
    /// Rebuilds an entry from its stored flag byte.
    pub fn from_flags(flags: u8, bytes: Bytes) -> Result<Self> {
        match flags {
            ENTRY_TUPLE => Ok(Entry::Tuple(bytes)),
            ENTRY_ANTIMATTER => Ok(Entry::Antimatter(bytes)),
            other => Err(KestrelError::Encoding(format!("unknown entry flag {}", other))),
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            Entry::Tuple(_) => ENTRY_TUPLE,
            Entry::Antimatter(_) => ENTRY_ANTIMATTER,
        }
    }

    /// Returns the stored bytes; their leading fields are the key.
    pub fn bytes(&self) -> &Bytes {
        match self {
            Entry::Tuple(b) | Entry::Antimatter(b) => b,
        }
    }

    pub fn is_antimatter(&self) -> bool {
        matches!(self, Entry::Antimatter(_))
    }

    /// Returns the tuple, or `None` for antimatter.
    pub fn into_tuple(self) -> Option<Bytes> {
        match self {
            Entry::Tuple(b) => Some(b),
            Entry::Antimatter(_) => None,
        }
    }
}

/// Orders entries by the leading key fields of a schema.
#[derive(Debug, Clone)]
pub struct KeyOrder {
    schema: Arc<[TypeTrait]>,
    key_fields: usize,
}

impl KeyOrder {
    pub fn new(schema: Arc<[TypeTrait]>, key_fields: usize) -> Self {
        Self { schema, key_fields }
    }

    pub fn schema(&self) -> &Arc<[TypeTrait]> {
        &self.schema
    }

    pub fn key_fields(&self) -> usize {
        self.key_fields
    }

    /// Compares the keys of two encoded tuples or keys.
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_tuples(&self.schema, a, b, self.key_fields)
    }
}

/// Merges runs of entries, newest run first, into one sorted run.
///
/// For equal keys the entry from the newest run wins. Antimatter survives
/// unless `drop_antimatter` is set.
pub fn merge_runs(order: &KeyOrder, runs: Vec<Vec<Entry>>, drop_antimatter: bool) -> Vec<Entry> {
    let mut ranked: Vec<(usize, Entry)> = runs
        .into_iter()
        .enumerate()
        .flat_map(|(rank, run)| run.into_iter().map(move |e| (rank, e)))
        .collect();
    ranked.sort_by(|(ra, a), (rb, b)| order.compare(a.bytes(), b.bytes()).then(ra.cmp(rb)));

    let mut merged: Vec<Entry> = Vec::with_capacity(ranked.len());
    let mut last_key: Option<Bytes> = None;
    for (_, entry) in ranked {
        if let Some(prev) = &last_key {
            if order.compare(prev, entry.bytes()) == Ordering::Equal {
                continue;
            }
        }
        last_key = Some(entry.bytes().clone());
        if !(drop_antimatter && entry.is_antimatter()) {
            merged.push(entry);
        }
    }
    merged
}
