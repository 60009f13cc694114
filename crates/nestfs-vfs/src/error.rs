//! Error types for the VFS layer.
//!
//! Every error a caller of the federation can observe is an [`FsError`].
//! "Not an archive" failures are not part of this taxonomy: they are
//! handled inside the federation engine and rerouted to the parent file
//! system.

use serde::{Deserialize, Serialize};

/// Errors from file system operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsError {
    /// Path not found
    NotFound,

    /// Path already exists
    AlreadyExists,

    /// Not a directory
    NotADirectory,

    /// Not a file
    NotAFile,

    /// Directory not empty
    DirectoryNotEmpty,

    /// Invalid path format
    InvalidPath(String),

    /// A close required by a synchronization could not complete because
    /// streams are still open and waiting was not requested.
    Busy {
        /// Open input streams at the time of the attempt
        inputs: usize,
        /// Open output streams at the time of the attempt
        outputs: usize,
    },

    /// The stream was closed by a forced synchronization.
    ForciblyClosed,

    /// Pending changes could not be committed to the parent file system.
    Sync(String),

    /// A touch listener re-entered the controller that notified it.
    Reentrant,

    /// The requested option combination is rejected by configuration.
    UnsupportedOptions(String),

    /// I/O error
    Io(String),
}

impl FsError {
    /// Create an I/O error with message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create an invalid path error with message.
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create a structural synchronization error with message.
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::NotAFile => write!(f, "not a file"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
            Self::InvalidPath(msg) => write!(f, "invalid path: {}", msg),
            Self::Busy { inputs, outputs } => write!(
                f,
                "busy: {} input and {} output streams still open",
                inputs, outputs
            ),
            Self::ForciblyClosed => write!(f, "stream forcibly closed by synchronization"),
            Self::Sync(msg) => write!(f, "synchronization failed: {}", msg),
            Self::Reentrant => write!(f, "touch listener re-entered its controller"),
            Self::UnsupportedOptions(msg) => write!(f, "unsupported options: {}", msg),
            Self::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl std::error::Error for FsError {}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        let kind = match &e {
            FsError::NotFound => std::io::ErrorKind::NotFound,
            FsError::AlreadyExists => std::io::ErrorKind::AlreadyExists,
            FsError::InvalidPath(_) => std::io::ErrorKind::InvalidInput,
            FsError::Busy { .. } => std::io::ErrorKind::WouldBlock,
            FsError::ForciblyClosed => std::io::ErrorKind::BrokenPipe,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        // Round-trip errors that were raised by this crate.
        if e.get_ref().is_some_and(|inner| inner.is::<FsError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(fs) = inner.downcast::<FsError>() {
                    return *fs;
                }
            }
            return FsError::io("unreadable error payload");
        }
        match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound,
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            _ => FsError::Io(e.to_string()),
        }
    }
}

/// Result type alias for file system operations
pub type FsResult<T> = Result<T, FsError>;
