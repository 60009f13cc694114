//! In-memory model of a mounted archive file system.
//!
//! The model is the authority for entry existence and metadata between two
//! synchronizations. Entry data lives in the driver's container.

use std::collections::BTreeMap;

use nestfs_vfs::path::entry_parent;
use nestfs_vfs::{EntryMeta, FsError, FsResult};

/// Entry metadata of one mounted archive plus its dirty state.
#[derive(Debug)]
pub struct ArchiveFileSystem {
    /// Absolute path of the mount point
    mount_point: String,
    /// Entries by name; the root is the empty name
    entries: BTreeMap<String, EntryMeta>,
    /// Mutated since the last synchronization
    touched: bool,
}

impl ArchiveFileSystem {
    /// Build a clean model from a container listing. Missing parent
    /// directories are added implicitly.
    pub(crate) fn new(mount_point: &str, listing: Vec<EntryMeta>) -> Self {
        let mut fs = Self::empty(mount_point);
        for meta in listing {
            fs.add_parents(&meta.name, meta.modified_at);
            fs.entries.insert(meta.name.clone(), meta);
        }
        fs
    }

    /// A clean model with only the root directory.
    pub(crate) fn empty(mount_point: &str) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), EntryMeta::directory("", 0));
        Self {
            mount_point: String::from(mount_point),
            entries,
            touched: false,
        }
    }

    fn add_parents(&mut self, name: &str, modified_at: u64) {
        let mut parent = entry_parent(name);
        while let Some(dir) = parent {
            if dir.is_empty() || self.entries.contains_key(dir) {
                break;
            }
            self.entries
                .insert(String::from(dir), EntryMeta::directory(dir, modified_at));
            parent = entry_parent(dir);
        }
    }

    /// Absolute path of the mount point.
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Check if the model was mutated since the last synchronization.
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Number of entries, excluding the root.
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    /// Check if the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata of an entry.
    pub fn stat(&self, name: &str) -> FsResult<&EntryMeta> {
        self.entries.get(name).ok_or(FsError::NotFound)
    }

    /// Direct children of a directory.
    pub fn list(&self, name: &str) -> FsResult<Vec<EntryMeta>> {
        match self.entries.get(name) {
            Some(e) if e.is_directory() => {}
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }
        Ok(self
            .entries
            .iter()
            .filter(|(k, _)| entry_parent(k) == Some(name))
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    /// Check a file may be written at `name`.
    pub(crate) fn check_file_target(&self, name: &str) -> FsResult<()> {
        if let Some(existing) = self.entries.get(name) {
            if existing.is_directory() {
                return Err(FsError::NotAFile);
            }
        }
        self.check_parent(name)
    }

    /// Check a directory may be created at `name`.
    pub(crate) fn check_directory_target(&self, name: &str) -> FsResult<()> {
        if self.entries.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        self.check_parent(name)
    }

    /// Check the entry at `name` may be removed.
    pub(crate) fn check_remove(&self, name: &str) -> FsResult<()> {
        let entry = self.stat(name)?;
        if entry.is_directory() && self.has_children(name) {
            return Err(FsError::DirectoryNotEmpty);
        }
        Ok(())
    }

    fn check_parent(&self, name: &str) -> FsResult<()> {
        let Some(parent) = entry_parent(name) else {
            return Err(FsError::AlreadyExists);
        };
        match self.entries.get(parent) {
            Some(p) if p.is_directory() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    /// Check if a directory has any entries.
    pub(crate) fn has_children(&self, name: &str) -> bool {
        self.entries.keys().any(|k| entry_parent(k) == Some(name))
    }

    /// Insert or replace an entry.
    pub(crate) fn put(&mut self, meta: EntryMeta) {
        self.entries.insert(meta.name.clone(), meta);
    }

    /// Remove an entry.
    pub(crate) fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Mark the model dirty. Returns true on the clean to dirty transition.
    pub(crate) fn touch(&mut self) -> bool {
        !std::mem::replace(&mut self.touched, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ArchiveFileSystem {
        ArchiveFileSystem::new(
            "/a.nar",
            vec![
                EntryMeta::file("docs/readme.txt", 3, 5),
                EntryMeta::file("top.txt", 1, 6),
            ],
        )
    }

    #[test]
    fn test_implicit_parents() {
        let fs = model();
        assert!(fs.stat("docs").unwrap().is_directory());
        assert!(fs.stat("").unwrap().is_directory());
        assert_eq!(fs.len(), 3);
        assert!(!fs.is_touched());
    }

    #[test]
    fn test_list() {
        let fs = model();
        let root: Vec<String> = fs.list("").unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(root, vec!["docs", "top.txt"]);
        assert_eq!(fs.list("top.txt"), Err(FsError::NotADirectory));
        assert_eq!(fs.list("missing"), Err(FsError::NotFound));
    }

    #[test]
    fn test_targets() {
        let fs = model();
        assert!(fs.check_file_target("docs/new.txt").is_ok());
        assert_eq!(fs.check_file_target("docs"), Err(FsError::NotAFile));
        assert_eq!(fs.check_file_target("nope/new.txt"), Err(FsError::NotFound));
        assert_eq!(
            fs.check_file_target("top.txt/new.txt"),
            Err(FsError::NotADirectory)
        );
        assert_eq!(fs.check_directory_target("docs"), Err(FsError::AlreadyExists));
        assert_eq!(fs.check_remove("docs"), Err(FsError::DirectoryNotEmpty));
        assert!(fs.check_remove("top.txt").is_ok());
    }

    #[test]
    fn test_touch_transitions_once() {
        let mut fs = ArchiveFileSystem::empty("/a.nar");
        assert!(fs.is_empty());
        assert!(fs.touch());
        assert!(!fs.touch());
        assert!(fs.is_touched());
    }
}
