//! nestfs Federation Engine
//!
//! Mounts archive files found on a host file system as directories, nested
//! to any depth, and keeps their changes pending until synchronized:
//!
//! - **Federation**: path resolution and the public file system surface
//! - **Controller**: per mount point lifecycle, rerouting and synchronization
//! - **Driver**: the `ArchiveDriver` seam and the JSON reference format
//! - **Model**: in-memory entry metadata of a mounted archive
//! - **Touch**: notification on the first mutation after a synchronization
//! - **Cache**: opt-in buffering of entry content
//! - **Stream**: reader and writer handles that pin their controller
//!
//! # Architecture
//!
//! ```text
//! /docs/report.nar/data/inner.nar/file.txt
//! └── host ──┘└──── archive ────┘└─ archive ─┘
//!
//! ┌──────────────┐   parent   ┌──────────────────────┐   parent   ┌──────────────────────┐
//! │ Host         │◀───────────│ /docs/report.nar     │◀───────────│ .../data/inner.nar   │
//! │ FileSystem   │            │ FederationController │            │ FederationController │
//! └──────────────┘            └──────────────────────┘            └──────────────────────┘
//! ```
//!
//! A path component whose suffix maps to a driver is only a *candidate*
//! archive. When opening shows it is not one, the controller becomes a
//! false positive and every operation is rerouted to its parent, so the
//! entry behaves like a plain file or directory.

pub mod cache;
pub mod config;
pub mod controller;
pub mod driver;
pub mod federation;
pub mod model;
pub mod stream;
pub mod touch;

mod false_positive;
mod registry;

// Re-export main types
pub use cache::{CacheStats, SelectiveCache};
pub use config::{ConfigError, FederationConfig};
pub use controller::{ControllerStatus, FederationController, HostController, Operation, Reply};
pub use driver::json::JsonArchiveDriver;
pub use driver::{ArchiveContainer, ArchiveDriver, DriverError};
pub use federation::Federation;
pub use model::ArchiveFileSystem;
pub use stream::{EntryReader, EntryWriter, StreamKind};
pub use touch::{PendingSyncs, TouchEvent, TouchListener, TouchNotifier};
