//! Archive driver boundary.
//!
//! A driver turns container bytes into an [`ArchiveContainer`] and back.
//! The federation consumes only the operations below from a driver; entry
//! layout, compression and encryption stay behind this boundary. While an
//! archive is mounted, its controller is the authority for entry existence
//! and metadata; the container only holds entry data and pending changes.

pub mod json;

use std::io::Read;

use nestfs_vfs::{EntryMeta, FsError, FsResult, InputOptions};

/// Failure raised by a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverError {
    /// The container is not a well-formed archive of this driver's format.
    NotAnArchive {
        /// The underlying failure
        cause: FsError,
        /// The failure may go away on its own (e.g. a lock conflict), so
        /// the classification must not be remembered.
        retryable: bool,
    },

    /// Any other failure.
    Fs(FsError),
}

impl DriverError {
    /// A persistent "not an archive" failure.
    pub fn not_an_archive(cause: FsError) -> Self {
        Self::NotAnArchive {
            cause,
            retryable: false,
        }
    }

    /// A "not an archive" failure that must be checked again next time.
    pub fn transient(cause: FsError) -> Self {
        Self::NotAnArchive {
            cause,
            retryable: true,
        }
    }
}

impl From<FsError> for DriverError {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnArchive { cause, retryable } => write!(
                f,
                "not an archive ({}): {}",
                if *retryable { "transient" } else { "persistent" },
                cause
            ),
            Self::Fs(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DriverError {}

/// Factory for archive containers of one format.
pub trait ArchiveDriver: Send + Sync {
    /// Parse container bytes.
    fn open(&self, container: Vec<u8>) -> Result<Box<dyn ArchiveContainer>, DriverError>;

    /// Create a new empty container.
    fn create(&self) -> Box<dyn ArchiveContainer>;
}

/// One opened archive: entry data plus pending changes.
pub trait ArchiveContainer: Send {
    /// List every entry (flat, all depths). Directories may be implicit.
    fn list_entries(&self) -> Result<Vec<EntryMeta>, DriverError>;

    /// Open an entry for reading, decompressing and verifying as needed.
    fn open_entry_for_read(
        &self,
        name: &str,
        options: InputOptions,
    ) -> Result<Box<dyn Read + Send>, DriverError>;

    /// Stage new content for a file entry.
    fn write_entry(&mut self, name: &str, data: &[u8]) -> FsResult<EntryMeta>;

    /// Stage a new directory entry.
    fn create_directory(&mut self, name: &str) -> FsResult<EntryMeta>;

    /// Stage removal of an entry.
    fn remove_entry(&mut self, name: &str) -> FsResult<()>;

    /// Check for staged changes.
    fn has_pending_changes(&self) -> bool;

    /// Apply staged changes and encode the whole container.
    fn commit_pending_changes(&mut self) -> FsResult<Vec<u8>>;

    /// Drop staged changes.
    fn abort_pending_changes(&mut self);
}
