//! Reference archive driver storing entries in a JSON document.
//!
//! Each file entry carries a checksum which is verified on read, so a
//! damaged entry surfaces as a "not an archive" failure the same way a
//! CRC mismatch would in a ZIP file.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use nestfs_vfs::{EntryMeta, FsError, FsResult, InputOptions};
use nestfs_zip::{stored_size, AesKeyStrength};
use serde::{Deserialize, Serialize};

use super::{ArchiveContainer, ArchiveDriver, DriverError};

/// Registered name of this driver.
pub const JSON_DRIVER: &str = "json";

/// Format tag in every container.
pub const FORMAT: &str = "nestfs-json-archive";

/// Current format version.
pub const VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredEntry {
    File {
        data: Vec<u8>,
        checksum: u64,
        modified_at: u64,
    },
    Directory {
        modified_at: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    format: String,
    version: u32,
    clock: u64,
    entries: BTreeMap<String, StoredEntry>,
}

/// FNV-1a, 64 bit.
fn checksum(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Driver for the JSON archive format.
#[derive(Clone, Debug, Default)]
pub struct JsonArchiveDriver {
    encryption: Option<AesKeyStrength>,
}

impl JsonArchiveDriver {
    /// Create a driver for unencrypted entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account entries as WinZip AES encrypted with the given strength.
    pub fn with_encryption(strength: AesKeyStrength) -> Self {
        Self {
            encryption: Some(strength),
        }
    }

    /// Encode a container holding the given files. Parent directories are
    /// implicit.
    pub fn build(&self, files: &[(&str, &[u8])]) -> FsResult<Vec<u8>> {
        let mut container = self.create();
        for (name, data) in files {
            container.write_entry(name, data)?;
        }
        container.commit_pending_changes()
    }
}

impl ArchiveDriver for JsonArchiveDriver {
    fn open(&self, container: Vec<u8>) -> Result<Box<dyn ArchiveContainer>, DriverError> {
        let doc: Document = serde_json::from_slice(&container)
            .map_err(|e| DriverError::not_an_archive(FsError::io(e.to_string())))?;
        if doc.format != FORMAT {
            return Err(DriverError::not_an_archive(FsError::io(format!(
                "unknown format tag '{}'",
                doc.format
            ))));
        }
        if doc.version != VERSION {
            return Err(DriverError::not_an_archive(FsError::io(format!(
                "unsupported version {}",
                doc.version
            ))));
        }
        Ok(Box::new(JsonContainer {
            committed: doc.entries,
            pending: BTreeMap::new(),
            clock: doc.clock,
            encryption: self.encryption,
        }))
    }

    fn create(&self) -> Box<dyn ArchiveContainer> {
        Box::new(JsonContainer {
            committed: BTreeMap::new(),
            pending: BTreeMap::new(),
            clock: 1,
            encryption: self.encryption,
        })
    }
}

struct JsonContainer {
    committed: BTreeMap<String, StoredEntry>,
    /// Staged changes; `None` stages a removal
    pending: BTreeMap<String, Option<StoredEntry>>,
    clock: u64,
    encryption: Option<AesKeyStrength>,
}

impl JsonContainer {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&self, name: &str) -> Option<&StoredEntry> {
        match self.pending.get(name) {
            Some(staged) => staged.as_ref(),
            None => self.committed.get(name),
        }
    }

    fn meta(&self, name: &str, entry: &StoredEntry) -> EntryMeta {
        match entry {
            StoredEntry::File {
                data, modified_at, ..
            } => {
                let size = data.len() as u64;
                EntryMeta::file(name, size, *modified_at)
                    .with_stored_size(stored_size(size, self.encryption))
            }
            StoredEntry::Directory { modified_at } => EntryMeta::directory(name, *modified_at),
        }
    }
}

impl ArchiveContainer for JsonContainer {
    fn list_entries(&self) -> Result<Vec<EntryMeta>, DriverError> {
        let mut merged: BTreeMap<&str, &StoredEntry> = self
            .committed
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        for (name, staged) in &self.pending {
            match staged {
                Some(entry) => {
                    merged.insert(name.as_str(), entry);
                }
                None => {
                    merged.remove(name.as_str());
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(name, entry)| self.meta(name, entry))
            .collect())
    }

    fn open_entry_for_read(
        &self,
        name: &str,
        _options: InputOptions,
    ) -> Result<Box<dyn Read + Send>, DriverError> {
        match self.lookup(name) {
            Some(StoredEntry::File { data, checksum: expected, .. }) => {
                if checksum(data) != *expected {
                    return Err(DriverError::not_an_archive(FsError::io(format!(
                        "checksum mismatch for entry '{}'",
                        name
                    ))));
                }
                Ok(Box::new(Cursor::new(data.clone())))
            }
            Some(StoredEntry::Directory { .. }) => Err(DriverError::Fs(FsError::NotAFile)),
            None => Err(DriverError::Fs(FsError::NotFound)),
        }
    }

    fn write_entry(&mut self, name: &str, data: &[u8]) -> FsResult<EntryMeta> {
        // The empty name is the root directory
        if name.is_empty() {
            return Err(FsError::NotAFile);
        }
        let modified_at = self.tick();
        let entry = StoredEntry::File {
            data: data.to_vec(),
            checksum: checksum(data),
            modified_at,
        };
        let meta = self.meta(name, &entry);
        self.pending.insert(String::from(name), Some(entry));
        Ok(meta)
    }

    fn create_directory(&mut self, name: &str) -> FsResult<EntryMeta> {
        let modified_at = self.tick();
        let entry = StoredEntry::Directory { modified_at };
        let meta = self.meta(name, &entry);
        self.pending.insert(String::from(name), Some(entry));
        Ok(meta)
    }

    fn remove_entry(&mut self, name: &str) -> FsResult<()> {
        if self.lookup(name).is_none() {
            return Err(FsError::NotFound);
        }
        self.pending.insert(String::from(name), None);
        Ok(())
    }

    fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    fn commit_pending_changes(&mut self) -> FsResult<Vec<u8>> {
        for (name, staged) in std::mem::take(&mut self.pending) {
            match staged {
                Some(entry) => {
                    self.committed.insert(name, entry);
                }
                None => {
                    self.committed.remove(&name);
                }
            }
        }
        let doc = Document {
            format: String::from(FORMAT),
            version: VERSION,
            clock: self.clock,
            entries: self.committed.clone(),
        };
        serde_json::to_vec(&doc).map_err(|e| FsError::io(e.to_string()))
    }

    fn abort_pending_changes(&mut self) {
        self.pending.clear();
    }
}
