//! In-memory plain file system.
//!
//! Provides a BTreeMap-based [`FileSystem`] that doesn't persist data. It
//! stands in for native storage at the root of a federation and in tests.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{FsError, FsResult};
use crate::path::{entry_parent, normalize_entry};
use crate::service::FileSystem;
use crate::types::EntryMeta;

struct Inner {
    /// Entry metadata (name -> meta)
    entries: BTreeMap<String, EntryMeta>,
    /// File content (name -> bytes)
    content: BTreeMap<String, Vec<u8>>,
    /// Logical clock
    now: u64,
    /// Reject all mutations with an I/O error
    read_only: bool,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        let current = self.now;
        self.now += 1;
        current
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::io("storage is read-only"));
        }
        Ok(())
    }

    fn check_parent_dir(&self, name: &str) -> FsResult<()> {
        let Some(parent) = entry_parent(name) else {
            return Err(FsError::AlreadyExists);
        };
        match self.entries.get(parent) {
            Some(p) if p.is_directory() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    fn has_children(&self, name: &str) -> bool {
        let prefix = format!("{}/", name);
        self.entries.keys().any(|k| {
            if name.is_empty() {
                !k.is_empty()
            } else {
                k.starts_with(&prefix)
            }
        })
    }
}

/// In-memory file system.
pub struct MemoryFs {
    inner: RwLock<Inner>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a new empty in-memory file system.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), EntryMeta::directory("", 1000));
        Self {
            inner: RwLock::new(Inner {
                entries,
                content: BTreeMap::new(),
                now: 1001,
                read_only: false,
            }),
        }
    }

    /// Make every subsequent mutation fail (for testing storage failures).
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.write().read_only = read_only;
    }

    /// Set the logical clock (for testing).
    pub fn set_now(&self, timestamp: u64) {
        self.inner.write().now = timestamp;
    }
}

impl FileSystem for MemoryFs {
    fn mkdir(&self, name: &str) -> FsResult<()> {
        let name = normalize_entry(name)?;
        let mut inner = self.inner.write();
        inner.check_writable()?;

        if inner.entries.contains_key(&name) {
            return Err(FsError::AlreadyExists);
        }
        inner.check_parent_dir(&name)?;

        let now = inner.tick();
        inner
            .entries
            .insert(name.clone(), EntryMeta::directory(name, now));
        Ok(())
    }

    fn mkdir_p(&self, name: &str) -> FsResult<()> {
        let name = normalize_entry(name)?;
        let mut inner = self.inner.write();
        inner.check_writable()?;

        let mut current = String::new();
        for component in name.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);

            match inner.entries.get(&current) {
                Some(e) if e.is_directory() => {}
                Some(_) => return Err(FsError::NotADirectory),
                None => {
                    let now = inner.tick();
                    inner
                        .entries
                        .insert(current.clone(), EntryMeta::directory(current.clone(), now));
                }
            }
        }
        Ok(())
    }

    fn readdir(&self, name: &str) -> FsResult<Vec<EntryMeta>> {
        let name = normalize_entry(name)?;
        let inner = self.inner.read();

        match inner.entries.get(&name) {
            Some(e) if e.is_directory() => {}
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }

        // Direct children only
        Ok(inner
            .entries
            .iter()
            .filter(|(k, _)| entry_parent(k) == Some(name.as_str()))
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    fn write_file(&self, name: &str, content: &[u8]) -> FsResult<()> {
        let name = normalize_entry(name)?;
        let mut inner = self.inner.write();
        inner.check_writable()?;

        if let Some(existing) = inner.entries.get(&name) {
            if existing.is_directory() {
                return Err(FsError::NotAFile);
            }
        }
        inner.check_parent_dir(&name)?;

        let now = inner.tick();
        inner.entries.insert(
            name.clone(),
            EntryMeta::file(name.clone(), content.len() as u64, now),
        );
        inner.content.insert(name, content.to_vec());
        Ok(())
    }

    fn read_file(&self, name: &str) -> FsResult<Vec<u8>> {
        let name = normalize_entry(name)?;
        let inner = self.inner.read();

        match inner.entries.get(&name) {
            Some(e) if e.is_file() => {}
            Some(_) => return Err(FsError::NotAFile),
            None => return Err(FsError::NotFound),
        }

        inner.content.get(&name).cloned().ok_or(FsError::NotFound)
    }

    fn remove(&self, name: &str) -> FsResult<()> {
        let name = normalize_entry(name)?;
        let mut inner = self.inner.write();
        inner.check_writable()?;

        if name.is_empty() {
            return Err(FsError::invalid_path("cannot remove the root"));
        }
        match inner.entries.get(&name) {
            Some(e) if e.is_directory() && inner.has_children(&name) => {
                return Err(FsError::DirectoryNotEmpty)
            }
            Some(_) => {}
            None => return Err(FsError::NotFound),
        }

        inner.entries.remove(&name);
        inner.content.remove(&name);
        Ok(())
    }

    fn stat(&self, name: &str) -> FsResult<EntryMeta> {
        let name = normalize_entry(name)?;
        self.inner
            .read()
            .entries
            .get(&name)
            .cloned()
            .ok_or(FsError::NotFound)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
