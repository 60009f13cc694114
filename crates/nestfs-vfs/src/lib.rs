//! nestfs Virtual Filesystem Vocabulary
//!
//! The shared vocabulary of the nestfs federation:
//!
//! - **Error**: `FsError`, the taxonomy every caller can observe
//! - **Path**: absolute path and entry name normalization
//! - **Types**: `EntryMeta` and `EntryType`
//! - **Service**: the `FileSystem` trait for plain (non-archive) storage
//! - **Memory**: `MemoryFs`, an in-memory plain file system
//! - **Options**: `OptionSet` with the input and sync option families
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    nestfs-federation                          │
//! │   controllers • rerouting • touch • cache • sync              │
//! └───────────────┬───────────────────────────────┬──────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────────┐  ┌───────────────────────────┐
//! │          nestfs-vfs           │  │        nestfs-zip         │
//! │ FileSystem • FsError • Options│  │ AES overhead accounting   │
//! └───────────────────────────────┘  └───────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod options;
pub mod path;
pub mod service;
pub mod types;

// Re-export main types
pub use error::{FsError, FsResult};
pub use memory::MemoryFs;
pub use options::{
    input_options, sync_options, InputOption, InputOptions, OptionFlag, OptionSet, SyncOption,
    SyncOptions,
};
pub use path::{join_entry, normalize_entry, normalize_path, parent_path, validate_path};
pub use service::FileSystem;
pub use types::{EntryMeta, EntryType};
