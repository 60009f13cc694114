//! Controller of one archive mount point.
//!
//! # State machine
//!
//! ```text
//!   Unmounted ──load───▶ Mounting ──ok──▶ Mounted
//!       ▲                   │                │
//!       │               not an archive   not an archive
//!       │                   ▼                ▼
//!       └────── sync ── FalsePositive ◀──────┘
//! ```
//!
//! Transient classifications are never stored: the controller stays
//! `Unmounted` (or `Mounted`) and the next operation loads again. Every
//! synchronization returns the controller to `Unmounted`.
//!
//! # Locking
//!
//! Structural transitions happen under the controller's state mutex. Lock
//! order is always child before parent; the registry lock is never held
//! while a controller lock is acquired.

use std::io::{Cursor, Read};
use std::sync::Arc;

use nestfs_vfs::path::entry_parent;
use nestfs_vfs::{
    input_options, join_entry, EntryType, FsError, FsResult, InputOption, InputOptions,
};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use super::{ControllerId, ControllerStatus, Operation, Reply};
use crate::cache::{CacheStats, SelectiveCache};
use crate::driver::{ArchiveContainer, ArchiveDriver};
use crate::false_positive::{FalsePositive, Outcome};
use crate::federation::Federation;
use crate::model::ArchiveFileSystem;
use crate::stream::{EntryReader, EntryWriter, StreamKind, StreamSlot, StreamTable};
use crate::touch::{self, TouchEvent, TouchNotifier};

/// Unwrap an `Outcome`, returning early on reroute or failure.
macro_rules! attempt {
    ($e:expr) => {
        match Outcome::from($e) {
            Outcome::Ok(v) => v,
            Outcome::Reroute(fp) => return Outcome::Reroute(fp),
            Outcome::Fatal(e) => return Outcome::Fatal(e),
        }
    };
}

/// A loaded archive.
pub(super) struct Mount {
    pub(super) model: ArchiveFileSystem,
    pub(super) container: Box<dyn ArchiveContainer>,
    /// The container exists in the parent file system
    persisted: bool,
}

pub(super) enum MountState {
    Unmounted,
    Mounting,
    Mounted(Mount),
    FalsePositive(FalsePositive),
}

pub(super) struct ControllerState {
    pub(super) mount: MountState,
    pub(super) cache: SelectiveCache,
    pub(super) streams: StreamTable,
}

enum Ready {
    Loaded,
    /// A new empty archive was created by this operation
    Created,
}

enum Source {
    Cached(Arc<[u8]>),
    Container(Box<dyn Read + Send>),
}

/// Classify a failure to load the container from the parent.
fn classify_load_failure<T>(cause: FsError) -> Outcome<T> {
    match cause {
        FsError::Reentrant => Outcome::Fatal(cause),
        FsError::NotFound => Outcome::Reroute(FalsePositive::transient(cause)),
        cause if cause.is_retryable() => Outcome::Reroute(FalsePositive::transient(cause)),
        cause => Outcome::Reroute(FalsePositive::persistent(cause)),
    }
}

/// Controller of an archive mount point.
pub struct FederationController {
    mount_point: String,
    parent: ControllerId,
    /// Name of the container as an entry of the parent
    entry_in_parent: String,
    driver: Arc<dyn ArchiveDriver>,
    fixed_input_options: InputOptions,
    notifier: Arc<RwLock<TouchNotifier>>,
    pub(super) state: Mutex<ControllerState>,
    /// Signalled whenever a stream slot is released
    pub(super) streams_closed: Condvar,
}

impl FederationController {
    pub(crate) fn new(
        mount_point: String,
        parent: ControllerId,
        entry_in_parent: String,
        driver: Arc<dyn ArchiveDriver>,
        fixed_input_options: InputOptions,
        notifier: Arc<RwLock<TouchNotifier>>,
    ) -> Self {
        Self {
            mount_point,
            parent,
            entry_in_parent,
            driver,
            fixed_input_options,
            notifier,
            state: Mutex::new(ControllerState {
                mount: MountState::Unmounted,
                cache: SelectiveCache::new(),
                streams: StreamTable::default(),
            }),
            streams_closed: Condvar::new(),
        }
    }

    /// Absolute path of the mount point.
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub(crate) fn parent(&self) -> ControllerId {
        self.parent
    }

    pub(crate) fn entry_in_parent(&self) -> &str {
        &self.entry_in_parent
    }

    /// Current lifecycle state.
    ///
    /// Like every query that needs the exclusive scope, fails with
    /// `Reentrant` when called from a touch listener.
    pub fn status(&self) -> FsResult<ControllerStatus> {
        Ok(match &self.lock()?.mount {
            MountState::Unmounted => ControllerStatus::Unmounted,
            MountState::Mounting => ControllerStatus::Mounting,
            MountState::Mounted(_) => ControllerStatus::Mounted,
            MountState::FalsePositive(_) => ControllerStatus::FalsePositive,
        })
    }

    /// Check if the mounted model has changes not yet synchronized.
    pub fn is_touched(&self) -> FsResult<bool> {
        Ok(matches!(&self.lock()?.mount, MountState::Mounted(m) if m.model.is_touched()))
    }

    pub fn cache_stats(&self) -> FsResult<CacheStats> {
        Ok(self.lock()?.cache.stats())
    }

    /// Unmounted, cache-free and without streams. Never blocks: a busy
    /// controller is not reclaimable.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.state.try_lock().is_some_and(|s| {
            matches!(s.mount, MountState::Unmounted) && s.cache.is_empty() && s.streams.is_empty()
        })
    }

    /// Enter the exclusive scope.
    pub(super) fn lock(&self) -> FsResult<MutexGuard<'_, ControllerState>> {
        if touch::in_notification() {
            return Err(FsError::Reentrant);
        }
        Ok(self.state.lock())
    }

    /// Apply an operation, rerouting to the parent while the mount point
    /// is a false positive.
    pub(crate) fn apply(
        self: &Arc<Self>,
        fed: &Federation,
        entry: &str,
        op: &Operation,
        options: InputOptions,
    ) -> FsResult<Reply> {
        match self.apply_local(fed, entry, op, options) {
            Outcome::Ok(reply) => Ok(reply),
            Outcome::Fatal(e) => Err(e),
            Outcome::Reroute(fp) => {
                let target = join_entry(&self.entry_in_parent, entry);
                debug!(
                    mount_point = %self.mount_point,
                    entry = %target,
                    kind = ?fp.kind(),
                    cause = %fp.cause(),
                    "rerouting to parent"
                );
                fed.node(self.parent)?.apply(fed, &target, op, options)
            }
        }
    }

    fn apply_local(
        self: &Arc<Self>,
        fed: &Federation,
        entry: &str,
        op: &Operation,
        options: InputOptions,
    ) -> Outcome<Reply> {
        let mut state = attempt!(self.lock());
        if let Ready::Created = attempt!(self.ensure_mounted(fed, &mut state, entry, op)) {
            return Outcome::Ok(Reply::Done);
        }

        match op {
            Operation::Read | Operation::OpenInput => self.read_local(state, entry, op, options),
            Operation::Delete if entry.is_empty() => self.delete_archive(fed, &mut state),
            Operation::OpenOutput => {
                let ControllerState { mount, streams, .. } = &mut *state;
                let MountState::Mounted(mount) = mount else {
                    return Outcome::Fatal(FsError::io("archive is not mounted"));
                };
                attempt!(mount.model.check_file_target(entry));
                let slot = streams.register(StreamKind::Output, entry);
                Outcome::Ok(Reply::Output(EntryWriter::archive(Arc::clone(self), slot)))
            }
            _ => {
                let MountState::Mounted(mount) = &mut state.mount else {
                    return Outcome::Fatal(FsError::io("archive is not mounted"));
                };
                self.update(mount, entry, op).into()
            }
        }
    }

    /// Load the model unless already mounted.
    fn ensure_mounted(
        &self,
        fed: &Federation,
        state: &mut ControllerState,
        entry: &str,
        op: &Operation,
    ) -> Outcome<Ready> {
        match &state.mount {
            MountState::Mounted(_) => return Outcome::Ok(Ready::Loaded),
            MountState::FalsePositive(fp) => return Outcome::Reroute(fp.clone()),
            MountState::Unmounted | MountState::Mounting => {}
        }

        state.mount = MountState::Mounting;
        match self.load(fed) {
            Outcome::Ok(mount) => {
                debug!(
                    mount_point = %self.mount_point,
                    entries = mount.model.len(),
                    "mounted archive"
                );
                state.mount = MountState::Mounted(mount);
                Outcome::Ok(Ready::Loaded)
            }
            Outcome::Reroute(fp)
                if *fp.cause() == FsError::NotFound
                    && entry.is_empty()
                    && *op == Operation::Create(EntryType::Directory) =>
            {
                state.mount = MountState::Unmounted;
                attempt!(self.check_container_parent(fed));
                let mut mount = Mount {
                    model: ArchiveFileSystem::empty(&self.mount_point),
                    container: self.driver.create(),
                    persisted: false,
                };
                self.touch(&mut mount);
                debug!(mount_point = %self.mount_point, "created archive");
                state.mount = MountState::Mounted(mount);
                Outcome::Ok(Ready::Created)
            }
            Outcome::Reroute(fp) => {
                state.mount = if fp.is_persistent() {
                    debug!(
                        mount_point = %self.mount_point,
                        cause = %fp.cause(),
                        "classified as false positive"
                    );
                    MountState::FalsePositive(fp.clone())
                } else {
                    MountState::Unmounted
                };
                Outcome::Reroute(fp)
            }
            Outcome::Fatal(e) => {
                state.mount = MountState::Unmounted;
                Outcome::Fatal(e)
            }
        }
    }

    /// Read the container from the parent and build the model.
    fn load(&self, fed: &Federation) -> Outcome<Mount> {
        let parent = attempt!(fed.node(self.parent));
        let bytes = match parent.apply(
            fed,
            &self.entry_in_parent,
            &Operation::Read,
            input_options::NONE,
        ) {
            Ok(Reply::Data(bytes)) => bytes,
            Ok(other) => {
                return Outcome::Fatal(FsError::io(format!("unexpected reply {:?}", other)))
            }
            Err(e) => return classify_load_failure(e),
        };

        let container = attempt!(self.driver.open(bytes));
        let listing = attempt!(container.list_entries());
        Outcome::Ok(Mount {
            model: ArchiveFileSystem::new(&self.mount_point, listing),
            container,
            persisted: true,
        })
    }

    /// A new container can only be written where the parent has a
    /// directory to hold it.
    fn check_container_parent(&self, fed: &Federation) -> FsResult<()> {
        let Some(dir) = entry_parent(&self.entry_in_parent) else {
            return Err(FsError::AlreadyExists);
        };
        let parent = fed.node(self.parent)?;
        match parent.apply(fed, dir, &Operation::Stat, input_options::NONE)? {
            Reply::Stat(meta) if meta.is_directory() => Ok(()),
            Reply::Stat(_) => Err(FsError::NotADirectory),
            other => Err(FsError::io(format!("unexpected reply {:?}", other))),
        }
    }

    /// Queries and mutations that complete under the lock.
    fn update(&self, mount: &mut Mount, entry: &str, op: &Operation) -> FsResult<Reply> {
        match op {
            Operation::Stat => mount.model.stat(entry).cloned().map(Reply::Stat),
            Operation::List => mount.model.list(entry).map(Reply::List),
            Operation::Write(data) => {
                mount.model.check_file_target(entry)?;
                self.stage_file(mount, entry, data)?;
                Ok(Reply::Done)
            }
            Operation::Create(EntryType::File) => {
                if mount.model.stat(entry).is_ok() {
                    return Err(FsError::AlreadyExists);
                }
                mount.model.check_file_target(entry)?;
                self.stage_file(mount, entry, &[])?;
                Ok(Reply::Done)
            }
            Operation::Create(EntryType::Directory) => {
                mount.model.check_directory_target(entry)?;
                let meta = mount.container.create_directory(entry)?;
                mount.model.put(meta);
                self.touch(mount);
                Ok(Reply::Done)
            }
            Operation::Delete => {
                mount.model.check_remove(entry)?;
                mount.container.remove_entry(entry)?;
                mount.model.remove(entry);
                self.keep_parent(mount, entry)?;
                self.touch(mount);
                Ok(Reply::Done)
            }
            Operation::Read | Operation::OpenInput | Operation::OpenOutput => Err(FsError::io(
                format!("{:?} is not handled under the controller lock", op),
            )),
        }
    }

    /// Directories implied by their children exist only in the model. Stage
    /// one as a real entry once its last child is gone, so it survives the
    /// next commit and can be removed itself.
    fn keep_parent(&self, mount: &mut Mount, entry: &str) -> FsResult<()> {
        let Some(dir) = entry_parent(entry) else {
            return Ok(());
        };
        if dir.is_empty() || mount.model.has_children(dir) {
            return Ok(());
        }
        let meta = mount.container.create_directory(dir)?;
        mount.model.put(meta);
        Ok(())
    }

    /// Read an entry. The lock is released before entry data is consumed.
    fn read_local(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, ControllerState>,
        entry: &str,
        op: &Operation,
        options: InputOptions,
    ) -> Outcome<Reply> {
        let effective = input_options::effective(options, self.fixed_input_options);
        let caching = effective.contains(InputOption::Cache);

        let ControllerState {
            mount,
            cache,
            streams,
        } = &mut *state;
        let MountState::Mounted(mount) = mount else {
            return Outcome::Fatal(FsError::io("archive is not mounted"));
        };
        let meta = attempt!(mount.model.stat(entry));
        if !meta.is_file() {
            return Outcome::Fatal(FsError::NotAFile);
        }
        let stamp = meta.modified_at;

        let cached = if caching {
            cache.lookup(entry, stamp)
        } else {
            None
        };
        let source = match cached {
            Some(data) => {
                debug!(mount_point = %self.mount_point, entry, "cache hit");
                Source::Cached(data)
            }
            None => match Outcome::from(mount.container.open_entry_for_read(entry, effective)) {
                Outcome::Ok(reader) => Source::Container(reader),
                Outcome::Reroute(fp) => {
                    self.reclassify(&mut state, &fp);
                    return Outcome::Reroute(fp);
                }
                Outcome::Fatal(e) => return Outcome::Fatal(e),
            },
        };

        if *op == Operation::Read {
            drop(state);
            return match source {
                Source::Cached(data) => Outcome::Ok(Reply::Data(data.to_vec())),
                Source::Container(reader) => {
                    Outcome::from(self.fill(entry, stamp, reader, caching).map(Reply::Data))
                }
            };
        }

        let slot = streams.register(StreamKind::Input, entry);
        drop(state);
        let source: Box<dyn Read + Send> = match source {
            Source::Cached(data) => Box::new(Cursor::new(data)),
            Source::Container(reader) if caching => {
                match self.fill(entry, stamp, reader, true) {
                    Ok(data) => Box::new(Cursor::new(data)),
                    Err(e) => {
                        self.release_stream(&slot);
                        return Outcome::Fatal(e);
                    }
                }
            }
            Source::Container(reader) => reader,
        };
        Outcome::Ok(Reply::Input(EntryReader::attached(
            Arc::clone(self),
            slot,
            source,
        )))
    }

    /// Consume a container stream, buffering it in the cache if asked to.
    /// Called without the lock.
    fn fill(
        &self,
        entry: &str,
        stamp: u64,
        mut reader: Box<dyn Read + Send>,
        caching: bool,
    ) -> FsResult<Vec<u8>> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if !caching {
            return Ok(data);
        }

        // A sync may have run while the lock was released.
        let mut state = self.state.lock();
        let ControllerState { mount, cache, .. } = &mut *state;
        let current = match mount {
            MountState::Mounted(m) => m.model.stat(entry).ok().map(|meta| meta.modified_at),
            _ => None,
        };
        if current == Some(stamp) {
            debug!(mount_point = %self.mount_point, entry, "cache miss");
            cache.insert(entry, stamp, Arc::from(data.as_slice()));
        } else {
            debug!(mount_point = %self.mount_point, entry, "entry changed while reading, not cached");
        }
        Ok(data)
    }

    /// A mounted archive turned out to be damaged. Persistent
    /// classifications discard the model and close its streams.
    fn reclassify(&self, state: &mut ControllerState, fp: &FalsePositive) {
        if !fp.is_persistent() {
            return;
        }
        if let MountState::Mounted(mount) = &state.mount {
            if mount.model.is_touched() {
                warn!(
                    mount_point = %self.mount_point,
                    "discarding pending changes of damaged archive"
                );
            }
        }
        let mut closed = 0;
        for kind in [StreamKind::Input, StreamKind::Output] {
            for slot in state.streams.drain(kind) {
                slot.close();
                closed += 1;
            }
        }
        if closed > 0 {
            warn!(
                mount_point = %self.mount_point,
                streams = closed,
                "forcibly closed streams of damaged archive"
            );
            self.streams_closed.notify_all();
        }
        debug!(
            mount_point = %self.mount_point,
            cause = %fp.cause(),
            "reclassified as false positive"
        );
        state.mount = MountState::FalsePositive(fp.clone());
    }

    /// Remove an empty archive from its parent.
    fn delete_archive(&self, fed: &Federation, state: &mut ControllerState) -> Outcome<Reply> {
        let MountState::Mounted(mount) = &state.mount else {
            return Outcome::Fatal(FsError::io("archive is not mounted"));
        };
        if !mount.model.is_empty() {
            return Outcome::Fatal(FsError::DirectoryNotEmpty);
        }
        if !state.streams.is_empty() {
            return Outcome::Fatal(FsError::Busy {
                inputs: state.streams.count(StreamKind::Input),
                outputs: state.streams.count(StreamKind::Output),
            });
        }
        if mount.persisted {
            let parent = attempt!(fed.node(self.parent));
            attempt!(parent.apply(
                fed,
                &self.entry_in_parent,
                &Operation::Delete,
                input_options::NONE
            ));
        }
        debug!(mount_point = %self.mount_point, "deleted archive");
        state.mount = MountState::Unmounted;
        Outcome::Ok(Reply::Done)
    }

    /// Stage file content and mark the model dirty.
    pub(super) fn stage_file(&self, mount: &mut Mount, entry: &str, data: &[u8]) -> FsResult<()> {
        let meta = mount.container.write_entry(entry, data)?;
        mount.model.put(meta);
        self.touch(mount);
        Ok(())
    }

    /// Mark the model dirty, notifying listeners on the first mutation.
    fn touch(&self, mount: &mut Mount) {
        if mount.model.touch() {
            debug!(mount_point = %self.mount_point, "archive touched");
            let notifier = self.notifier.read().clone();
            notifier.notify(&TouchEvent::new(&mount.model));
        }
    }

    /// Commit an output stream.
    pub(crate) fn finish_output(&self, slot: &StreamSlot) -> FsResult<()> {
        let mut state = self.lock()?;
        let released = state.streams.release(slot.id());
        self.streams_closed.notify_all();
        if released.is_none() {
            return Err(FsError::ForciblyClosed);
        }
        let data = slot.close();
        let MountState::Mounted(mount) = &mut state.mount else {
            return Err(FsError::ForciblyClosed);
        };
        mount.model.check_file_target(slot.name())?;
        self.stage_file(mount, slot.name(), &data)
    }

    /// Give up an input stream slot.
    pub(crate) fn release_stream(&self, slot: &StreamSlot) {
        let mut state = self.state.lock();
        state.streams.release(slot.id());
        self.streams_closed.notify_all();
    }
}

impl std::fmt::Debug for FederationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationController")
            .field("mount_point", &self.mount_point)
            .field("parent", &self.parent)
            .field("entry_in_parent", &self.entry_in_parent)
            .finish_non_exhaustive()
    }
}
