//! Entry streams and their accounting.
//!
//! Every stream opened on an entry of a mounted archive occupies a slot in
//! its controller's [`StreamTable`]. Synchronization consults the table to
//! decide whether it must fail with `Busy`, wait, or close streams by
//! force. Reading and writing never take the controller lock; only opening
//! and closing do.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use nestfs_vfs::{FileSystem, FsError, FsResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::controller::archive::FederationController;

/// Direction of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Input,
    Output,
}

/// Shared state of one open stream.
pub(crate) struct StreamSlot {
    id: u64,
    kind: StreamKind,
    owner: ThreadId,
    name: String,
    closed: AtomicBool,
    /// Output written so far; always empty for input streams
    buffer: Mutex<Vec<u8>>,
}

impl StreamSlot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Entry name within the owning archive.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Append output. Fails once the slot was closed.
    fn append(&self, data: &[u8]) -> FsResult<()> {
        let mut buffer = self.buffer.lock();
        if self.is_closed() {
            return Err(FsError::ForciblyClosed);
        }
        buffer.extend_from_slice(data);
        Ok(())
    }

    /// Close the slot and take the output written so far.
    pub(crate) fn close(&self) -> Vec<u8> {
        let mut buffer = self.buffer.lock();
        self.closed.store(true, Ordering::SeqCst);
        std::mem::take(&mut *buffer)
    }
}

impl fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open streams of one controller.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    next_id: u64,
    open: BTreeMap<u64, Arc<StreamSlot>>,
}

impl StreamTable {
    /// Register a stream opened by the current thread.
    pub(crate) fn register(&mut self, kind: StreamKind, name: &str) -> Arc<StreamSlot> {
        self.next_id += 1;
        let slot = Arc::new(StreamSlot {
            id: self.next_id,
            kind,
            owner: thread::current().id(),
            name: String::from(name),
            closed: AtomicBool::new(false),
            buffer: Mutex::new(Vec::new()),
        });
        self.open.insert(slot.id, slot.clone());
        slot
    }

    /// Remove a slot. Returns `None` if it was already drained.
    pub(crate) fn release(&mut self, id: u64) -> Option<Arc<StreamSlot>> {
        self.open.remove(&id)
    }

    pub(crate) fn count(&self, kind: StreamKind) -> usize {
        self.open.values().filter(|s| s.kind == kind).count()
    }

    /// Streams of `kind` opened by `owner`.
    pub(crate) fn count_owned_by(&self, kind: StreamKind, owner: ThreadId) -> usize {
        self.open
            .values()
            .filter(|s| s.kind == kind && s.owner == owner)
            .count()
    }

    /// Remove and return every slot of `kind`.
    pub(crate) fn drain(&mut self, kind: StreamKind) -> Vec<Arc<StreamSlot>> {
        let ids: Vec<u64> = self
            .open
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.open.remove(&id))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

// ============================================================================
// Input
// ============================================================================

struct InputGuard {
    controller: Arc<FederationController>,
    slot: Arc<StreamSlot>,
}

impl Drop for InputGuard {
    fn drop(&mut self) {
        self.controller.release_stream(&self.slot);
    }
}

/// Byte stream over one entry.
///
/// Reading fails with `ForciblyClosed` once a forced synchronization closed
/// the stream.
pub struct EntryReader {
    source: Box<dyn Read + Send>,
    guard: Option<InputGuard>,
}

impl EntryReader {
    /// A stream with no slot, used for plain host entries.
    pub(crate) fn detached(source: Box<dyn Read + Send>) -> Self {
        Self {
            source,
            guard: None,
        }
    }

    /// A stream accounted in `controller`'s stream table.
    pub(crate) fn attached(
        controller: Arc<FederationController>,
        slot: Arc<StreamSlot>,
        source: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            source,
            guard: Some(InputGuard { controller, slot }),
        }
    }

    /// Mount point of the archive serving this stream, if any.
    pub fn mount_point(&self) -> Option<&str> {
        self.guard.as_ref().map(|g| g.controller.mount_point())
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(guard) = &self.guard {
            if guard.slot.is_closed() {
                return Err(FsError::ForciblyClosed.into());
            }
        }
        self.source.read(buf)
    }
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("mount_point", &self.mount_point())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Output
// ============================================================================

enum Sink {
    Host {
        fs: Arc<dyn FileSystem>,
        name: String,
        buffer: Vec<u8>,
    },
    Archive {
        controller: Arc<FederationController>,
        slot: Arc<StreamSlot>,
    },
}

/// Writer replacing the content of one file entry.
///
/// Data is committed to the owning file system on [`close`](Self::close),
/// or on drop with failures logged. A forced synchronization commits the
/// data written so far and fails later writes with `ForciblyClosed`.
pub struct EntryWriter {
    sink: Option<Sink>,
}

impl EntryWriter {
    pub(crate) fn host(fs: Arc<dyn FileSystem>, name: &str) -> Self {
        Self {
            sink: Some(Sink::Host {
                fs,
                name: String::from(name),
                buffer: Vec::new(),
            }),
        }
    }

    pub(crate) fn archive(controller: Arc<FederationController>, slot: Arc<StreamSlot>) -> Self {
        Self {
            sink: Some(Sink::Archive { controller, slot }),
        }
    }

    /// Commit the written data.
    pub fn close(mut self) -> FsResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> FsResult<()> {
        match self.sink.take() {
            None => Ok(()),
            Some(Sink::Host { fs, name, buffer }) => fs.write_file(&name, &buffer),
            Some(Sink::Archive { controller, slot }) => controller.finish_output(&slot),
        }
    }
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Some(Sink::Host { buffer, .. }) => buffer.extend_from_slice(buf),
            Some(Sink::Archive { slot, .. }) => slot.append(buf)?,
            None => return Err(FsError::io("stream already closed").into()),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        match self.finish() {
            Ok(()) => {}
            Err(FsError::ForciblyClosed) => debug!("output stream was closed by synchronization"),
            Err(e) => warn!(error = %e, "failed to commit output stream on drop"),
        }
    }
}

impl fmt::Debug for EntryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.sink {
            Some(Sink::Host { name, .. }) => Some(name.as_str()),
            Some(Sink::Archive { slot, .. }) => Some(slot.name()),
            None => None,
        };
        f.debug_struct("EntryWriter")
            .field("entry", &target)
            .finish_non_exhaustive()
    }
}
