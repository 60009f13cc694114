//! Entry metadata types.

use serde::{Deserialize, Serialize};

/// Kind of a file system entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Metadata of one entry, as reported by `stat` and `list`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Name relative to the root of the file system that owns the entry
    pub name: String,

    /// File or directory
    pub entry_type: EntryType,

    /// Content size in bytes (0 for directories)
    pub size: u64,

    /// Predicted size of the entry once stored in its container.
    /// Equal to `size` for plain file systems.
    pub stored_size: u64,

    /// Modification timestamp (logical clock of the owning file system)
    pub modified_at: u64,
}

impl EntryMeta {
    /// Metadata for a file.
    pub fn file(name: impl Into<String>, size: u64, modified_at: u64) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::File,
            size,
            stored_size: size,
            modified_at,
        }
    }

    /// Metadata for a directory.
    pub fn directory(name: impl Into<String>, modified_at: u64) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Directory,
            size: 0,
            stored_size: 0,
            modified_at,
        }
    }

    /// Replace the predicted stored size.
    pub fn with_stored_size(mut self, stored_size: u64) -> Self {
        self.stored_size = stored_size;
        self
    }

    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    /// Check if this is a directory.
    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    /// Last component of the entry name.
    pub fn base_name(&self) -> &str {
        crate::path::filename(&self.name)
    }
}
