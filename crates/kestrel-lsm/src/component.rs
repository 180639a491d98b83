//! Immutable on-disk components.
//!
//! File layout (big-endian):
//! ```text
//! +-------------+---------------+-------------------+-----------+---------+
//! | magic (4)   | version (2)   | entry_count (8)   | entries   | crc32   |
//! +-------------+---------------+-------------------+-----------+---------+
//! entry: [flags u8][len u32][tuple or key bytes]
//! ```
//! The checksum covers every byte before it.

use crate::entry::{Entry, KeyOrder};
use crate::merge_policy::ComponentInfo;
use crate::operation::ComponentId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{KestrelError, Result};
use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Magic number at the start of every component file ("KCMP").
pub const COMPONENT_MAGIC: u32 = 0x4B43_4D50;
/// Current component file format version.
pub const COMPONENT_VERSION: u16 = 1;
/// Extension of installed component files.
pub const COMPONENT_EXTENSION: &str = "cmp";
/// Extension of component files still being written.
pub const TEMP_EXTENSION: &str = "tmp";

const HEADER_SIZE: usize = 4 + 2 + 8;
const ENTRY_HEADER_SIZE: usize = 1 + 4;
const CHECKSUM_SIZE: usize = 4;

/// Returns the file name of a component.
pub fn component_file_name(id: ComponentId) -> String {
    format!("c-{:016}-{:016}.{}", id.min, id.max, COMPONENT_EXTENSION)
}

/// Parses a component file name back into its id.
pub fn parse_component_file_name(name: &str) -> Option<ComponentId> {
    let stem = name.strip_prefix("c-")?.strip_suffix(".cmp")?;
    let (min, max) = stem.split_once('-')?;
    let id = ComponentId {
        min: min.parse().ok()?,
        max: max.parse().ok()?,
    };
    (id.min <= id.max).then_some(id)
}

/// A sorted, immutable run of entries backed by one file.
///
/// The file is read once on open; entries are zero-copy slices of that buffer.
#[derive(Debug)]
pub struct DiskComponent {
    id: ComponentId,
    path: PathBuf,
    size_bytes: u64,
    order: Arc<KeyOrder>,
    entries: Vec<Entry>,
}

impl DiskComponent {
    /// Writes sorted `entries` as component `id` in `dir`.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// a failed write never leaves a partial component behind.
    pub fn write(
        dir: &Path,
        id: ComponentId,
        entries: Vec<Entry>,
        order: Arc<KeyOrder>,
        fsync: bool,
    ) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(
            HEADER_SIZE
                + entries
                    .iter()
                    .map(|e| ENTRY_HEADER_SIZE + e.bytes().len())
                    .sum::<usize>()
                + CHECKSUM_SIZE,
        );
        buf.put_u32(COMPONENT_MAGIC);
        buf.put_u16(COMPONENT_VERSION);
        buf.put_u64(entries.len() as u64);
        for entry in &entries {
            buf.put_u8(entry.flags());
            buf.put_u32(entry.bytes().len() as u32);
            buf.put_slice(entry.bytes());
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        let path = dir.join(component_file_name(id));
        let temp = path.with_extension(TEMP_EXTENSION);
        if let Err(e) = Self::write_file(&temp, &path, &buf, fsync) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        debug!(component = %id, entries = entries.len(), bytes = buf.len(), "Wrote disk component");

        Ok(Self {
            id,
            path,
            size_bytes: buf.len() as u64,
            order,
            entries,
        })
    }

    fn write_file(temp: &Path, path: &Path, data: &[u8], fsync: bool) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)?;
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        fs::rename(temp, path)?;
        if fsync {
            if let Some(parent) = path.parent() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    /// Opens and verifies the component file at `path`.
    pub fn open(path: &Path, id: ComponentId, order: Arc<KeyOrder>) -> Result<Self> {
        let data = Bytes::from(fs::read(path)?);
        let corrupted = |reason: String| KestrelError::ComponentCorrupted {
            path: path.display().to_string(),
            reason,
        };

        if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(corrupted(format!("file too short: {} bytes", data.len())));
        }
        let body_len = data.len() - CHECKSUM_SIZE;
        let stored = (&data[body_len..]).get_u32();
        let computed = crc32fast::hash(&data[..body_len]);
        if stored != computed {
            return Err(corrupted(format!(
                "checksum mismatch: stored={:#010x}, computed={:#010x}",
                stored, computed
            )));
        }

        let mut cursor = &data[..body_len];
        let magic = cursor.get_u32();
        if magic != COMPONENT_MAGIC {
            return Err(corrupted(format!("bad magic {:#010x}", magic)));
        }
        let version = cursor.get_u16();
        if version != COMPONENT_VERSION {
            return Err(corrupted(format!("unsupported version {}", version)));
        }
        let count = cursor.get_u64();

        let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut offset = HEADER_SIZE;
        for i in 0..count {
            if body_len - offset < ENTRY_HEADER_SIZE {
                return Err(corrupted(format!("entry {} header truncated", i)));
            }
            let flags = data[offset];
            let len = (&data[offset + 1..offset + ENTRY_HEADER_SIZE]).get_u32() as usize;
            let start = offset + ENTRY_HEADER_SIZE;
            if body_len - start < len {
                return Err(corrupted(format!("entry {} payload truncated", i)));
            }
            let entry = Entry::from_flags(flags, data.slice(start..start + len))
                .map_err(|e| corrupted(e.to_string()))?;
            entries.push(entry);
            offset = start + len;
        }
        if offset != body_len {
            return Err(corrupted(format!(
                "{} trailing bytes after {} entries",
                body_len - offset,
                count
            )));
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            size_bytes: data.len() as u64,
            order,
            entries,
        })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns metadata for merge policies.
    pub fn info(&self) -> ComponentInfo {
        ComponentInfo {
            id: self.id,
            size_bytes: self.size_bytes,
            entry_count: self.entries.len() as u64,
        }
    }

    /// Returns every entry in key order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns the entry stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| self.order.compare(e.bytes(), key))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Returns entries with keys in `[lo, hi]`. `None` is unbounded.
    pub fn range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> &[Entry] {
        let start = match lo {
            Some(lo) => self
                .entries
                .partition_point(|e| self.order.compare(e.bytes(), lo) == Ordering::Less),
            None => 0,
        };
        let end = match hi {
            Some(hi) => self
                .entries
                .partition_point(|e| self.order.compare(e.bytes(), hi) != Ordering::Greater),
            None => self.entries.len(),
        };
        if start >= end {
            return &[];
        }
        &self.entries[start..end]
    }

    /// Removes the component file.
    pub fn delete_file(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
