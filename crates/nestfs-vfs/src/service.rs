//! Service trait for plain file systems.
//!
//! A plain file system is the permanent storage at the root of a
//! federation. Archive file systems are layered on top of it by the
//! federation engine; they are not implementations of this trait.

use crate::error::{FsError, FsResult};
use crate::types::EntryMeta;

/// Plain file system interface.
///
/// All names are entry names relative to the file system root; the root
/// itself is the empty name.
pub trait FileSystem: Send + Sync {
    // ========== Directory Operations ==========

    /// Create a directory.
    fn mkdir(&self, name: &str) -> FsResult<()>;

    /// Create a directory and all parent directories.
    fn mkdir_p(&self, name: &str) -> FsResult<()>;

    /// List directory contents.
    fn readdir(&self, name: &str) -> FsResult<Vec<EntryMeta>>;

    // ========== File Operations ==========

    /// Write a file (create or overwrite).
    fn write_file(&self, name: &str, content: &[u8]) -> FsResult<()>;

    /// Read a file.
    fn read_file(&self, name: &str) -> FsResult<Vec<u8>>;

    /// Delete a file or an empty directory.
    fn remove(&self, name: &str) -> FsResult<()>;

    // ========== Metadata Operations ==========

    /// Get file/directory metadata.
    fn stat(&self, name: &str) -> FsResult<EntryMeta>;

    /// Check if an entry exists.
    fn exists(&self, name: &str) -> FsResult<bool> {
        match self.stat(name) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
