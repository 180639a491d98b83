//! Write-ahead log for durable memory components.
//!
//! Each memory component generation logs to its own file, `wal-<gen>.log`,
//! deleted once that generation's disk component is installed.
//!
//! Record layout (big-endian):
//! ```text
//! +-----------+-----------+-------------------+-----------+
//! | len (4)   | flags (1) | payload (len)     | crc32 (4) |
//! +-----------+-----------+-------------------+-----------+
//! ```
//! The checksum covers the flags byte and the payload.

use crate::entry::Entry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{KestrelError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the fixed record header (length + flags).
pub const RECORD_HEADER_SIZE: usize = 4 + 1;
/// Size of the record checksum.
pub const RECORD_CHECKSUM_SIZE: usize = 4;

/// Returns the file name of a WAL generation.
pub fn wal_file_name(generation: u64) -> String {
    format!("wal-{:016}.log", generation)
}

/// Parses a WAL file name back into its generation.
pub fn parse_wal_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()
}

/// Lists the WAL generations present in `dir`, oldest first.
pub fn list_generations(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut generations: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            parse_wal_file_name(&name.to_string_lossy()).map(|generation| (generation, e.path()))
        })
        .collect();
    generations.sort_by_key(|(generation, _)| *generation);
    Ok(generations)
}

fn encode_record(entry: &Entry) -> Bytes {
    let payload = entry.bytes();
    let mut buf =
        BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_CHECKSUM_SIZE);
    buf.put_u32(payload.len() as u32);
    buf.put_u8(entry.flags());
    buf.put_slice(payload);
    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32(checksum);
    buf.freeze()
}

/// Appends entries to one WAL generation.
#[derive(Debug)]
pub struct WalWriter {
    generation: u64,
    path: PathBuf,
    file: File,
    fsync_enabled: bool,
    bytes_written: u64,
}

impl WalWriter {
    /// Creates (or reopens for append) the log of `generation` in `dir`.
    pub fn create(dir: &Path, generation: u64, fsync_enabled: bool) -> Result<Self> {
        let path = dir.join(wal_file_name(generation));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();
        debug!(generation, path = %path.display(), "Opened WAL generation");
        Ok(Self {
            generation,
            path,
            file,
            fsync_enabled,
            bytes_written,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Appends one entry. Returns after the record is on disk when fsync is enabled.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let record = encode_record(entry);
        self.file.write_all(&record)?;
        if self.fsync_enabled {
            self.file.sync_data()?;
        }
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    /// Forces buffered records to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads every complete record of a WAL file.
///
/// A record cut short at the end of the file is a torn append and is ignored.
/// A checksum mismatch on a complete record is corruption.
pub fn read_wal(path: &Path) -> Result<Vec<Entry>> {
    let data = Bytes::from(fs::read(path)?);
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < RECORD_HEADER_SIZE {
            warn!(path = %path.display(), offset, "Ignoring truncated WAL record header");
            break;
        }
        let len = (&data[offset..offset + 4]).get_u32() as usize;
        let flags = data[offset + 4];
        let record_len = RECORD_HEADER_SIZE + len + RECORD_CHECKSUM_SIZE;
        if remaining < record_len {
            warn!(path = %path.display(), offset, "Ignoring truncated WAL record");
            break;
        }

        let payload_start = offset + RECORD_HEADER_SIZE;
        let payload_end = payload_start + len;
        let stored = (&data[payload_end..payload_end + RECORD_CHECKSUM_SIZE]).get_u32();
        let computed = crc32fast::hash(&data[offset + 4..payload_end]);
        if stored != computed {
            return Err(KestrelError::WalCorrupted {
                offset: offset as u64,
                reason: format!(
                    "checksum mismatch in {}: stored={:#010x}, computed={:#010x}",
                    path.display(),
                    stored,
                    computed
                ),
            });
        }

        let entry = Entry::from_flags(flags, data.slice(payload_start..payload_end)).map_err(
            |e| KestrelError::WalCorrupted {
                offset: offset as u64,
                reason: e.to_string(),
            },
        )?;
        entries.push(entry);
        offset += record_len;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries() -> Vec<Entry> {
        vec![
            Entry::Tuple(Bytes::from_static(b"\x00\x00\x00\x01payload")),
            Entry::Antimatter(Bytes::from_static(b"\x00\x00\x00\x02")),
            Entry::Tuple(Bytes::from_static(b"")),
        ]
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::create(dir.path(), 3, true).unwrap();
        for e in &entries() {
            wal.append(e).unwrap();
        }
        wal.sync().unwrap();
        assert_eq!(wal.generation(), 3);
        assert_eq!(read_wal(wal.path()).unwrap(), entries());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::create(dir.path(), 1, false).unwrap();
        wal.append(&entries()[0]).unwrap();
        let written = wal.bytes_written();
        drop(wal);

        let mut wal = WalWriter::create(dir.path(), 1, false).unwrap();
        assert_eq!(wal.bytes_written(), written);
        wal.append(&entries()[1]).unwrap();
        assert_eq!(read_wal(wal.path()).unwrap(), entries()[..2].to_vec());
    }

    #[test]
    fn test_truncated_tail_ignored() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::create(dir.path(), 1, false).unwrap();
        for e in &entries() {
            wal.append(e).unwrap();
        }
        let path = wal.path().to_path_buf();
        drop(wal);

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 2]).unwrap();
        assert_eq!(read_wal(&path).unwrap(), entries()[..2].to_vec());

        fs::write(&path, &raw[..3]).unwrap();
        assert!(read_wal(&path).unwrap().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::create(dir.path(), 1, false).unwrap();
        for e in &entries() {
            wal.append(e).unwrap();
        }
        let path = wal.path().to_path_buf();
        drop(wal);

        let mut raw = fs::read(&path).unwrap();
        raw[RECORD_HEADER_SIZE + 1] ^= 0x55;
        fs::write(&path, &raw).unwrap();
        let err = read_wal(&path).unwrap_err();
        assert!(matches!(err, KestrelError::WalCorrupted { offset: 0, .. }));
    }

    #[test]
    fn test_generation_listing() {
        let dir = tempdir().unwrap();
        for generation in [7, 2, 11] {
            WalWriter::create(dir.path(), generation, false).unwrap();
        }
        fs::write(dir.path().join("c-1-1.cmp"), b"").unwrap();
        let gens: Vec<u64> = list_generations(dir.path())
            .unwrap()
            .into_iter()
            .map(|(g, _)| g)
            .collect();
        assert_eq!(gens, vec![2, 7, 11]);
        assert_eq!(parse_wal_file_name(&wal_file_name(42)), Some(42));
    }
}
