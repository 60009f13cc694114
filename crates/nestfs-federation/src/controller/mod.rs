//! Controllers of the federation tree.
//!
//! The root of every federation is a [`HostController`] over plain
//! storage. Each mount point below it is served by a
//! [`FederationController`], which reroutes to its parent whenever its
//! container turns out not to be an archive.

pub mod archive;
pub mod host;
mod sync;

use std::fmt;
use std::sync::Arc;

use nestfs_vfs::{EntryMeta, EntryType, FsResult, InputOptions};
use serde::{Deserialize, Serialize};

use crate::federation::Federation;
use crate::stream::{EntryReader, EntryWriter};

pub use archive::FederationController;
pub use host::HostController;

/// Index of a controller in the federation's registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(pub(crate) usize);

/// Lifecycle state of a mount point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    /// No model loaded; the next operation loads the container.
    Unmounted,
    /// The container is being loaded.
    Mounting,
    /// The archive model is loaded.
    Mounted,
    /// Classified as not an archive until the next synchronization.
    FalsePositive,
}

/// A file system operation applied at a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Entry metadata
    Stat,
    /// Whole file content
    Read,
    /// Replace a file's content, creating the file if needed
    Write(Vec<u8>),
    /// Create a new, empty entry
    Create(EntryType),
    /// Remove a file or an empty directory
    Delete,
    /// Direct children of a directory
    List,
    /// Open a byte stream for reading
    OpenInput,
    /// Open a writer replacing a file's content
    OpenOutput,
}

/// Result of an [`Operation`].
pub enum Reply {
    Stat(EntryMeta),
    Data(Vec<u8>),
    Done,
    List(Vec<EntryMeta>),
    Input(EntryReader),
    Output(EntryWriter),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stat(meta) => f.debug_tuple("Stat").field(meta).finish(),
            Self::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Self::Done => f.write_str("Done"),
            Self::List(entries) => f.debug_tuple("List").field(entries).finish(),
            Self::Input(reader) => f.debug_tuple("Input").field(reader).finish(),
            Self::Output(writer) => f.debug_tuple("Output").field(writer).finish(),
        }
    }
}

/// A controller held by the registry.
#[derive(Clone)]
pub(crate) enum Node {
    Host(Arc<HostController>),
    Archive(Arc<FederationController>),
}

impl Node {
    pub(crate) fn apply(
        &self,
        fed: &Federation,
        entry: &str,
        op: &Operation,
        options: InputOptions,
    ) -> FsResult<Reply> {
        match self {
            Self::Host(host) => host.apply(entry, op),
            Self::Archive(controller) => controller.apply(fed, entry, op, options),
        }
    }

    pub(crate) fn mount_point(&self) -> &str {
        match self {
            Self::Host(_) => "/",
            Self::Archive(controller) => controller.mount_point(),
        }
    }

    pub(crate) fn status(&self) -> FsResult<ControllerStatus> {
        match self {
            Self::Host(_) => Ok(ControllerStatus::Mounted),
            Self::Archive(controller) => controller.status(),
        }
    }

    pub(crate) fn as_archive(&self) -> Option<&Arc<FederationController>> {
        match self {
            Self::Host(_) => None,
            Self::Archive(controller) => Some(controller),
        }
    }
}
