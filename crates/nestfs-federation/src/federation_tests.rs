//! End-to-end tests for the federation engine.

use super::*;
use crate::driver::{ArchiveContainer, DriverError};
use crate::touch::{PendingSyncs, TouchEvent};
use nestfs_vfs::{FsError, InputOption, MemoryFs};
use nestfs_zip::AesKeyStrength;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Weak};
use std::thread;
use std::time::Duration;

fn federation() -> (Arc<MemoryFs>, Federation) {
    let host = Arc::new(MemoryFs::new());
    let fed = Federation::new(host.clone(), FederationConfig::default());
    (host, fed)
}

fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    JsonArchiveDriver::new().build(files).unwrap()
}

/// Break the checksum of one entry so reading it fails.
fn damage(container: &[u8], entry: &str) -> Vec<u8> {
    let mut doc: serde_json::Value = serde_json::from_slice(container).unwrap();
    doc["entries"][entry]["checksum"] = serde_json::json!(0);
    serde_json::to_vec(&doc).unwrap()
}

fn names(entries: Vec<EntryMeta>) -> Vec<String> {
    entries.into_iter().map(|m| m.name).collect()
}

fn cache() -> InputOptions {
    input_options::of(&[InputOption::Cache])
}

// ============================================================================
// False positives
// ============================================================================

#[test]
fn test_damaged_nested_archive_reads_as_plain_entry() {
    let (host, fed) = federation();
    let inner = damage(
        &archive(&[("a.txt", &b"alpha"[..]), ("b.txt", &b"beta"[..])]),
        "b.txt",
    );
    host.write_file(
        "outer.nar",
        &archive(&[("readme.txt", &b"outer"[..]), ("inner.nar", &inner[..])]),
    )
    .unwrap();

    // The inner archive mounts and serves its healthy entry.
    assert_eq!(
        fed.read("/outer.nar/inner.nar/a.txt", cache()).unwrap(),
        b"alpha"
    );
    assert_eq!(
        fed.status("/outer.nar/inner.nar").unwrap(),
        Some(ControllerStatus::Mounted)
    );

    // The damaged entry reclassifies the inner archive. The rerouted read
    // finds no such entry in the outer archive.
    assert_eq!(
        fed.read("/outer.nar/inner.nar/b.txt", input_options::NONE),
        Err(FsError::NotFound)
    );
    assert_eq!(
        fed.status("/outer.nar/inner.nar").unwrap(),
        Some(ControllerStatus::FalsePositive)
    );

    // The inner path is now a plain file of the outer archive.
    assert_eq!(
        fed.read("/outer.nar/inner.nar", input_options::NONE).unwrap(),
        inner
    );
    assert!(fed.stat("/outer.nar/inner.nar").unwrap().is_file());
    assert_eq!(
        fed.read("/outer.nar/readme.txt", input_options::NONE).unwrap(),
        b"outer"
    );
    assert_eq!(
        names(fed.list("/outer.nar").unwrap()),
        vec!["inner.nar", "readme.txt"]
    );

    // Unmounting clears caches and releases every controller.
    assert_eq!(
        fed.cache_stats("/outer.nar/inner.nar").unwrap().unwrap().entries,
        1
    );
    fed.sync("/outer.nar", sync_options::UNMOUNT).unwrap();
    assert_eq!(fed.controller_count(), 0);
    assert_eq!(fed.status("/outer.nar/inner.nar").unwrap(), None);
}

#[test]
fn test_garbage_container_behaves_like_plain_file() {
    let (host, fed) = federation();
    host.write_file("notes.nar", b"just some text").unwrap();

    assert_eq!(
        fed.read("/notes.nar", input_options::NONE).unwrap(),
        b"just some text"
    );
    assert!(fed.stat("/notes.nar").unwrap().is_file());
    assert_eq!(
        fed.list("/notes.nar").map(|_| ()),
        Err(FsError::NotADirectory)
    );

    fed.write("/notes.nar", b"replaced").unwrap();
    assert_eq!(host.read_file("notes.nar").unwrap(), b"replaced");

    fed.delete("/notes.nar").unwrap();
    assert!(!host.exists("notes.nar").unwrap());
}

/// Counts container opens; optionally fails them all as transient.
struct CountingDriver {
    inner: JsonArchiveDriver,
    opens: AtomicUsize,
    transient: bool,
}

impl CountingDriver {
    fn new(transient: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: JsonArchiveDriver::new(),
            opens: AtomicUsize::new(0),
            transient,
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ArchiveDriver for CountingDriver {
    fn open(&self, container: Vec<u8>) -> Result<Box<dyn ArchiveContainer>, DriverError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            return Err(DriverError::transient(FsError::io("container locked")));
        }
        self.inner.open(container)
    }

    fn create(&self) -> Box<dyn ArchiveContainer> {
        self.inner.create()
    }
}

fn counting_federation(driver: Arc<CountingDriver>) -> (Arc<MemoryFs>, Federation) {
    let host = Arc::new(MemoryFs::new());
    let config = FederationConfig::default().with_suffix("cnt", "counting");
    let fed = Federation::new(host.clone(), config).with_driver("counting", driver);
    (host, fed)
}

#[test]
fn test_persistent_false_positive_is_cached_until_sync() {
    let driver = CountingDriver::new(false);
    let (host, fed) = counting_federation(driver.clone());
    host.write_file("plain.cnt", b"hello").unwrap();

    for _ in 0..3 {
        assert_eq!(
            fed.read("/plain.cnt", input_options::NONE).unwrap(),
            b"hello"
        );
    }
    assert_eq!(driver.opens(), 1);
    assert_eq!(
        fed.status("/plain.cnt").unwrap(),
        Some(ControllerStatus::FalsePositive)
    );

    fed.sync("/plain.cnt", sync_options::NONE).unwrap();
    assert_eq!(
        fed.status("/plain.cnt").unwrap(),
        Some(ControllerStatus::Unmounted)
    );
    fed.stat("/plain.cnt").unwrap();
    assert_eq!(driver.opens(), 2);
}

#[test]
fn test_transient_false_positive_is_reopened() {
    let driver = CountingDriver::new(true);
    let (host, fed) = counting_federation(driver.clone());
    let bytes = archive(&[("a.txt", &b"alpha"[..])]);
    host.write_file("locked.cnt", &bytes).unwrap();

    for expected in 1..=3 {
        assert_eq!(fed.read("/locked.cnt", input_options::NONE).unwrap(), bytes);
        assert_eq!(driver.opens(), expected);
    }
    assert_eq!(
        fed.status("/locked.cnt").unwrap(),
        Some(ControllerStatus::Unmounted)
    );
}

#[test]
fn test_missing_container_is_transient() {
    let (host, fed) = federation();
    assert_eq!(fed.stat("/later.nar"), Err(FsError::NotFound));
    assert_eq!(
        fed.status("/later.nar").unwrap(),
        Some(ControllerStatus::Unmounted)
    );

    host.write_file("later.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    assert_eq!(names(fed.list("/later.nar").unwrap()), vec!["a.txt"]);
}

#[test]
fn test_directory_named_like_archive() {
    let (host, fed) = federation();
    host.mkdir("dir.nar").unwrap();
    host.write_file("dir.nar/x.txt", b"x").unwrap();

    assert_eq!(
        fed.read("/dir.nar/x.txt", input_options::NONE).unwrap(),
        b"x"
    );
    assert_eq!(
        fed.status("/dir.nar").unwrap(),
        Some(ControllerStatus::FalsePositive)
    );
}

// ============================================================================
// Archive lifecycle
// ============================================================================

#[test]
fn test_create_archive_and_sync() {
    let (host, fed) = federation();
    fed.create("/new.nar", EntryType::Directory).unwrap();
    fed.create("/new.nar/docs", EntryType::Directory).unwrap();
    fed.write("/new.nar/docs/a.txt", b"alpha").unwrap();
    assert!(!host.exists("new.nar").unwrap());

    fed.sync_all(sync_options::SYNC).unwrap();
    let bytes = host.read_file("new.nar").unwrap();
    let container = JsonArchiveDriver::new().open(bytes).unwrap();
    assert_eq!(
        names(container.list_entries().unwrap()),
        vec!["docs", "docs/a.txt"]
    );

    assert_eq!(
        fed.create("/new.nar", EntryType::Directory),
        Err(FsError::AlreadyExists)
    );
}

#[test]
fn test_delete_archive() {
    let (host, fed) = federation();
    host.write_file("full.nar", &archive(&[("a.txt", &b"a"[..])]))
        .unwrap();
    assert_eq!(fed.delete("/full.nar"), Err(FsError::DirectoryNotEmpty));

    fed.delete("/full.nar/a.txt").unwrap();
    fed.delete("/full.nar").unwrap();
    assert!(!host.exists("full.nar").unwrap());

    // Never written to the host, so nothing to remove there.
    fed.create("/scratch.nar", EntryType::Directory).unwrap();
    fed.delete("/scratch.nar").unwrap();
    fed.sync_all(sync_options::SYNC).unwrap();
    assert!(!host.exists("scratch.nar").unwrap());
}

#[test]
fn test_entry_errors_inside_archive() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("docs/a.txt", &b"a"[..])]))
        .unwrap();

    assert_eq!(
        fed.read("/a.nar/docs", input_options::NONE),
        Err(FsError::NotAFile)
    );
    assert_eq!(fed.write("/a.nar/docs", b"x"), Err(FsError::NotAFile));
    assert_eq!(fed.write("/a.nar/none/x.txt", b"x"), Err(FsError::NotFound));
    assert_eq!(
        fed.create("/a.nar/docs/a.txt", EntryType::File),
        Err(FsError::AlreadyExists)
    );
    assert_eq!(fed.delete("/a.nar/docs"), Err(FsError::DirectoryNotEmpty));
    assert!(fed.stat("/a.nar").unwrap().is_directory());
}

#[test]
fn test_implicit_directory_outlives_last_child() {
    let (host, fed) = federation();
    host.write_file(
        "a.nar",
        &archive(&[("docs/a.txt", &b"a"[..]), ("docs/b.txt", &b"b"[..])]),
    )
    .unwrap();

    fed.delete("/a.nar/docs/a.txt").unwrap();
    fed.delete("/a.nar/docs/b.txt").unwrap();
    fed.sync("/a.nar", sync_options::SYNC).unwrap();

    let reopened = Federation::new(host.clone(), FederationConfig::default());
    assert!(reopened.stat("/a.nar/docs").unwrap().is_directory());
    assert!(reopened.list("/a.nar/docs").unwrap().is_empty());
}

#[test]
fn test_delete_emptied_implicit_directory() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("docs/a.txt", &b"a"[..])]))
        .unwrap();

    fed.delete("/a.nar/docs/a.txt").unwrap();
    fed.delete("/a.nar/docs").unwrap();
    assert_eq!(fed.stat("/a.nar/docs"), Err(FsError::NotFound));

    fed.sync("/a.nar", sync_options::SYNC).unwrap();
    let container = JsonArchiveDriver::new()
        .open(host.read_file("a.nar").unwrap())
        .unwrap();
    assert!(container.list_entries().unwrap().is_empty());
}

#[test]
fn test_create_archive_needs_parent_directory() {
    let (host, fed) = federation();
    host.write_file("plain.txt", b"x").unwrap();
    host.write_file("a.nar", &archive(&[("a.txt", &b"a"[..])]))
        .unwrap();

    assert_eq!(
        fed.create("/nodir/x.nar", EntryType::Directory),
        Err(FsError::NotFound)
    );
    assert_eq!(
        fed.create("/plain.txt/x.nar", EntryType::Directory),
        Err(FsError::NotADirectory)
    );
    assert_eq!(
        fed.create("/a.nar/missing/x.nar", EntryType::Directory),
        Err(FsError::NotFound)
    );
    assert_eq!(
        fed.status("/nodir/x.nar").unwrap(),
        Some(ControllerStatus::Unmounted)
    );

    // A nested archive inside an existing archive directory is fine.
    fed.create("/a.nar/sub", EntryType::Directory).unwrap();
    fed.create("/a.nar/sub/x.nar", EntryType::Directory).unwrap();
    fed.sync_all(sync_options::SYNC).unwrap();
    assert!(!host.exists("nodir").unwrap());
}

#[test]
fn test_reset_discards_changes() {
    let (host, fed) = federation();
    let original = archive(&[("a.txt", &b"a"[..])]);
    host.write_file("a.nar", &original).unwrap();

    fed.write("/a.nar/b.txt", b"b").unwrap();
    fed.sync("/a.nar", sync_options::RESET).unwrap();

    assert_eq!(host.read_file("a.nar").unwrap(), original);
    assert_eq!(
        fed.read("/a.nar/b.txt", input_options::NONE),
        Err(FsError::NotFound)
    );
}

#[test]
fn test_structural_failure_keeps_changes() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[])).unwrap();
    fed.write("/a.nar/new.txt", b"pending").unwrap();

    host.set_read_only(true);
    let err = fed.sync("/a.nar", sync_options::SYNC).unwrap_err();
    assert!(matches!(err, FsError::Sync(_)));
    assert!(!err.is_retryable());

    let controller = fed.controller("/a.nar").unwrap().unwrap();
    assert!(controller.is_touched().unwrap());
    assert_eq!(controller.status().unwrap(), ControllerStatus::Mounted);

    host.set_read_only(false);
    fed.sync("/a.nar", sync_options::SYNC).unwrap();
    assert!(!controller.is_touched().unwrap());
    let fresh = Federation::new(host.clone(), FederationConfig::default());
    assert_eq!(
        fresh.read("/a.nar/new.txt", input_options::NONE).unwrap(),
        b"pending"
    );
}

#[test]
fn test_sync_all_reports_first_failure_after_trying_all() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[])).unwrap();
    host.write_file("b.nar", &archive(&[])).unwrap();
    fed.write("/a.nar/x", b"1").unwrap();
    fed.write("/b.nar/y", b"2").unwrap();

    host.set_read_only(true);
    assert!(matches!(
        fed.sync_all(sync_options::SYNC),
        Err(FsError::Sync(_))
    ));
    for mount_point in ["/a.nar", "/b.nar"] {
        assert!(fed.controller(mount_point).unwrap().unwrap().is_touched().unwrap());
    }
}

#[test]
fn test_nested_sync_writes_inner_first() {
    let (host, fed) = federation();
    host.write_file(
        "outer.nar",
        &archive(&[("inner.nar", &archive(&[("a.txt", &b"a"[..])])[..])]),
    )
    .unwrap();
    let pending = Arc::new(PendingSyncs::new());
    fed.add_touch_listener(pending.clone());

    fed.write("/outer.nar/inner.nar/new.txt", b"nested").unwrap();
    assert_eq!(pending.take(), vec!["/outer.nar/inner.nar"]);

    fed.sync("/outer.nar", sync_options::SYNC).unwrap();
    // Committing the inner archive touched the outer one.
    assert_eq!(pending.take(), vec!["/outer.nar"]);

    let fresh = Federation::new(host.clone(), FederationConfig::default());
    assert_eq!(
        fresh
            .read("/outer.nar/inner.nar/new.txt", input_options::NONE)
            .unwrap(),
        b"nested"
    );
    assert_eq!(
        fresh
            .read("/outer.nar/inner.nar/a.txt", input_options::NONE)
            .unwrap(),
        b"a"
    );
}

// ============================================================================
// Touch notification
// ============================================================================

#[derive(Default)]
struct Counter(AtomicUsize);

impl TouchListener for Counter {
    fn touched(&self, _event: &TouchEvent<'_>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_touch_once_per_dirty_transition() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"a"[..])]))
        .unwrap();
    let counter = Arc::new(Counter::default());
    assert!(fed.add_touch_listener(counter.clone()));
    assert!(!fed.add_touch_listener(counter.clone()));

    fed.read("/a.nar/a.txt", input_options::NONE).unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);

    fed.write("/a.nar/b.txt", b"b").unwrap();
    fed.create("/a.nar/dir", EntryType::Directory).unwrap();
    fed.delete("/a.nar/a.txt").unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    fed.sync("/a.nar", sync_options::SYNC).unwrap();
    fed.write("/a.nar/c.txt", b"c").unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);

    let listener: Arc<dyn TouchListener> = counter.clone();
    assert!(fed.remove_touch_listener(&listener));
    fed.sync("/a.nar", sync_options::SYNC).unwrap();
    fed.write("/a.nar/d.txt", b"d").unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);
}

/// Calls back into the federation from the notification.
struct Reenter {
    fed: Mutex<Weak<Federation>>,
    archive_result: Mutex<Option<FsResult<EntryMeta>>>,
    root_result: Mutex<Option<FsResult<EntryMeta>>>,
}

impl TouchListener for Reenter {
    fn touched(&self, _event: &TouchEvent<'_>) {
        let Some(fed) = self.fed.lock().upgrade() else {
            return;
        };
        *self.archive_result.lock() = Some(fed.stat("/a.nar/a.txt"));
        *self.root_result.lock() = Some(fed.stat("/a.nar"));
    }
}

#[test]
fn test_reentrant_listener_is_rejected() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"a"[..])]))
        .unwrap();
    let fed = Arc::new(fed);
    let listener = Arc::new(Reenter {
        fed: Mutex::new(Arc::downgrade(&fed)),
        archive_result: Mutex::new(None),
        root_result: Mutex::new(None),
    });
    fed.add_touch_listener(listener.clone());

    fed.write("/a.nar/b.txt", b"b").unwrap();
    assert_eq!(*listener.archive_result.lock(), Some(Err(FsError::Reentrant)));
    // The archive root resolves to the same controller.
    assert_eq!(*listener.root_result.lock(), Some(Err(FsError::Reentrant)));

    // Outside the notification everything works again.
    assert!(fed.stat("/a.nar/b.txt").unwrap().is_file());
}

/// Inspects the touched archive through the query API.
#[derive(Default)]
struct Inspect {
    fed: Mutex<Weak<Federation>>,
    status: Mutex<Option<FsResult<Option<ControllerStatus>>>>,
    cache_stats: Mutex<Option<FsResult<Option<CacheStats>>>>,
    is_touched: Mutex<Option<FsResult<bool>>>,
}

impl TouchListener for Inspect {
    fn touched(&self, event: &TouchEvent<'_>) {
        let Some(fed) = self.fed.lock().upgrade() else {
            return;
        };
        let mount_point = event.source().mount_point();
        *self.status.lock() = Some(fed.status(mount_point));
        *self.cache_stats.lock() = Some(fed.cache_stats(mount_point));
        if let Ok(Some(controller)) = fed.controller(mount_point) {
            *self.is_touched.lock() = Some(controller.is_touched());
        }
    }
}

#[test]
fn test_listener_queries_are_rejected() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"a"[..])]))
        .unwrap();
    let fed = Arc::new(fed);
    let listener = Arc::new(Inspect::default());
    *listener.fed.lock() = Arc::downgrade(&fed);
    fed.add_touch_listener(listener.clone());

    let (tx, rx) = mpsc::channel();
    let worker = {
        let fed = fed.clone();
        thread::spawn(move || {
            tx.send(fed.write("/a.nar/b.txt", b"b")).unwrap();
        })
    };
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(Ok(())));
    worker.join().unwrap();

    assert_eq!(*listener.status.lock(), Some(Err(FsError::Reentrant)));
    assert_eq!(*listener.cache_stats.lock(), Some(Err(FsError::Reentrant)));
    assert_eq!(*listener.is_touched.lock(), Some(Err(FsError::Reentrant)));

    assert_eq!(
        fed.status("/a.nar").unwrap(),
        Some(ControllerStatus::Mounted)
    );
    let controller = fed.controller("/a.nar").unwrap().unwrap();
    assert!(controller.is_touched().unwrap());
}

// ============================================================================
// Streams and synchronization options
// ============================================================================

#[test]
fn test_open_stream_makes_sync_busy() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    let reader = fed.input("/a.nar/a.txt", input_options::NONE).unwrap();
    assert_eq!(reader.mount_point(), Some("/a.nar"));

    let err = fed.sync("/a.nar", sync_options::NONE).unwrap_err();
    assert_eq!(
        err,
        FsError::Busy {
            inputs: 1,
            outputs: 0
        }
    );
    assert!(err.is_retryable());

    // Waiting for a stream this thread holds would never finish.
    assert!(matches!(
        fed.sync("/a.nar", sync_options::SYNC),
        Err(FsError::Busy { .. })
    ));

    drop(reader);
    fed.sync("/a.nar", sync_options::NONE).unwrap();
}

#[test]
fn test_force_close_fails_in_flight_io() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    let mut reader = fed.input("/a.nar/a.txt", input_options::NONE).unwrap();
    let mut writer = fed.output("/a.nar/out.txt").unwrap();
    writer.write_all(b"partial").unwrap();

    fed.sync("/a.nar", sync_options::UNMOUNT).unwrap();

    let mut buf = Vec::new();
    let err = reader.read_to_end(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    assert_eq!(FsError::from(err), FsError::ForciblyClosed);

    assert!(writer.write_all(b" more").is_err());
    assert_eq!(writer.close(), Err(FsError::ForciblyClosed));

    // Output written before the forced close was committed.
    let fresh = Federation::new(host.clone(), FederationConfig::default());
    assert_eq!(
        fresh.read("/a.nar/out.txt", input_options::NONE).unwrap(),
        b"partial"
    );

    // The reader still pins the controller.
    assert_eq!(fed.controller_count(), 1);
    drop(reader);
    fed.sync_all(sync_options::UNMOUNT).unwrap();
    assert_eq!(fed.controller_count(), 0);
}

#[test]
fn test_wait_blocks_until_other_thread_closes() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    let fed = Arc::new(fed);
    let mut reader = fed.input("/a.nar/a.txt", input_options::NONE).unwrap();

    let syncer = {
        let fed = fed.clone();
        thread::spawn(move || fed.sync("/a.nar", sync_options::SYNC))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!syncer.is_finished());

    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert_eq!(text, "alpha");
    drop(reader);

    syncer.join().unwrap().unwrap();
    assert_eq!(
        fed.status("/a.nar").unwrap(),
        Some(ControllerStatus::Unmounted)
    );
}

#[test]
fn test_writer_commits_on_close() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[])).unwrap();

    let mut writer = fed.output("/a.nar/log.txt").unwrap();
    writer.write_all(b"line 1\n").unwrap();
    writer.write_all(b"line 2\n").unwrap();
    assert_eq!(
        fed.stat("/a.nar/log.txt"),
        Err(FsError::NotFound)
    );
    writer.close().unwrap();

    assert_eq!(
        fed.read("/a.nar/log.txt", input_options::NONE).unwrap(),
        b"line 1\nline 2\n"
    );
    assert_eq!(fed.output("/a.nar").map(|_| ()), Err(FsError::NotAFile));

    // Host paths get plain writers.
    let mut plain = fed.output("/plain.txt").unwrap();
    plain.write_all(b"plain").unwrap();
    drop(plain);
    assert_eq!(host.read_file("plain.txt").unwrap(), b"plain");
}

#[test]
fn test_wait_with_clear_cache() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[])).unwrap();
    let risky = sync_options::SYNC.with(SyncOption::ClearCache);
    fed.sync("/a.nar", risky).unwrap();

    let strict = FederationConfig {
        reject_wait_with_clear: true,
        ..FederationConfig::default()
    };
    let fed = Federation::new(host.clone(), strict);
    assert!(matches!(
        fed.sync("/a.nar", risky),
        Err(FsError::UnsupportedOptions(_))
    ));
    fed.sync("/a.nar", sync_options::UNMOUNT).unwrap();
}

#[test]
fn test_concurrent_writers() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[])).unwrap();
    let fed = Arc::new(fed);

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let fed = fed.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let path = format!("/a.nar/t{}_{}.txt", t, i);
                    fed.write(&path, path.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fed.list("/a.nar").unwrap().len(), 40);
    fed.sync_all(sync_options::SYNC).unwrap();

    let fresh = Federation::new(host.clone(), FederationConfig::default());
    assert_eq!(
        fresh.read("/a.nar/t3_9.txt", input_options::NONE).unwrap(),
        b"/a.nar/t3_9.txt"
    );
}

// ============================================================================
// Selective cache and size accounting
// ============================================================================

#[test]
fn test_selective_cache() {
    let (host, fed) = federation();
    host.write_file("a.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();

    assert_eq!(fed.read("/a.nar/a.txt", cache()).unwrap(), b"alpha");
    assert_eq!(fed.read("/a.nar/a.txt", cache()).unwrap(), b"alpha");
    fed.read("/a.nar/a.txt", input_options::NONE).unwrap();
    assert_eq!(
        fed.cache_stats("/a.nar").unwrap(),
        Some(CacheStats {
            hits: 1,
            misses: 1,
            entries: 1
        })
    );

    // A rewrite changes the stamp, so the stale copy is not served.
    fed.write("/a.nar/a.txt", b"changed").unwrap();
    assert_eq!(fed.read("/a.nar/a.txt", cache()).unwrap(), b"changed");

    // The buffered copy survives the container being replaced.
    let controller = fed.controller("/a.nar").unwrap().unwrap();
    fed.sync("/a.nar", sync_options::SYNC).unwrap();
    assert_eq!(fed.read("/a.nar/a.txt", cache()).unwrap(), b"changed");
    assert_eq!(controller.cache_stats().unwrap().hits, 2);

    let mut reader = fed.input("/a.nar/a.txt", cache()).unwrap();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert_eq!(text, "changed");
    drop(reader);
    assert_eq!(controller.cache_stats().unwrap().hits, 3);

    // Only CLEAR_CACHE empties it; the held controller is not reclaimed.
    fed.sync("/a.nar", sync_options::of(&[SyncOption::ClearCache]))
        .unwrap();
    assert_eq!(controller.cache_stats().unwrap().entries, 0);
    assert_eq!(fed.controller_count(), 1);
}

/// Lets a test hold the first entry read of a container mid-stream.
#[derive(Default)]
struct Gate {
    started: Mutex<Option<mpsc::Sender<()>>>,
    proceed: Mutex<Option<mpsc::Receiver<()>>>,
}

struct GatedDriver {
    inner: JsonArchiveDriver,
    gate: Arc<Gate>,
}

struct GatedContainer {
    inner: Box<dyn ArchiveContainer>,
    gate: Arc<Gate>,
}

struct GatedReader {
    inner: Box<dyn Read + Send>,
    gate: Option<Arc<Gate>>,
}

impl ArchiveDriver for GatedDriver {
    fn open(&self, container: Vec<u8>) -> Result<Box<dyn ArchiveContainer>, DriverError> {
        Ok(Box::new(GatedContainer {
            inner: self.inner.open(container)?,
            gate: self.gate.clone(),
        }))
    }

    fn create(&self) -> Box<dyn ArchiveContainer> {
        Box::new(GatedContainer {
            inner: self.inner.create(),
            gate: self.gate.clone(),
        })
    }
}

impl ArchiveContainer for GatedContainer {
    fn list_entries(&self) -> Result<Vec<EntryMeta>, DriverError> {
        self.inner.list_entries()
    }

    fn open_entry_for_read(
        &self,
        name: &str,
        options: InputOptions,
    ) -> Result<Box<dyn Read + Send>, DriverError> {
        Ok(Box::new(GatedReader {
            inner: self.inner.open_entry_for_read(name, options)?,
            gate: Some(self.gate.clone()),
        }))
    }

    fn write_entry(&mut self, name: &str, data: &[u8]) -> FsResult<EntryMeta> {
        self.inner.write_entry(name, data)
    }

    fn create_directory(&mut self, name: &str) -> FsResult<EntryMeta> {
        self.inner.create_directory(name)
    }

    fn remove_entry(&mut self, name: &str) -> FsResult<()> {
        self.inner.remove_entry(name)
    }

    fn has_pending_changes(&self) -> bool {
        self.inner.has_pending_changes()
    }

    fn commit_pending_changes(&mut self) -> FsResult<Vec<u8>> {
        self.inner.commit_pending_changes()
    }

    fn abort_pending_changes(&mut self) {
        self.inner.abort_pending_changes()
    }
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            if let Some(started) = gate.started.lock().take() {
                let _ = started.send(());
            }
            let proceed = gate.proceed.lock().take();
            if let Some(proceed) = proceed {
                let _ = proceed.recv();
            }
        }
        self.inner.read(buf)
    }
}

#[test]
fn test_unmount_during_cached_read_leaves_cache_empty() {
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let gate = Arc::new(Gate {
        started: Mutex::new(Some(started_tx)),
        proceed: Mutex::new(Some(proceed_rx)),
    });
    let driver = Arc::new(GatedDriver {
        inner: JsonArchiveDriver::new(),
        gate,
    });
    let host = Arc::new(MemoryFs::new());
    host.write_file("a.gate", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    let config = FederationConfig::default().with_suffix("gate", "gated");
    let fed = Arc::new(Federation::new(host, config).with_driver("gated", driver));

    let reader = {
        let fed = fed.clone();
        thread::spawn(move || fed.read("/a.gate/a.txt", cache()))
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The read holds no lock while it drains the entry.
    let controller = fed.controller("/a.gate").unwrap().unwrap();
    fed.sync("/a.gate", sync_options::UNMOUNT).unwrap();
    proceed_tx.send(()).unwrap();

    assert_eq!(reader.join().unwrap().unwrap(), b"alpha");
    assert_eq!(controller.cache_stats().unwrap().entries, 0);
    assert_eq!(controller.status().unwrap(), ControllerStatus::Unmounted);
}

#[test]
fn test_fixed_options_cannot_force_caching() {
    let host = Arc::new(MemoryFs::new());
    host.write_file("a.nar", &archive(&[("a.txt", &b"alpha"[..])]))
        .unwrap();
    let config = FederationConfig {
        fixed_input_options: cache(),
        ..FederationConfig::default()
    };
    let fed = Federation::new(host, config);

    fed.read("/a.nar/a.txt", input_options::NONE).unwrap();
    assert_eq!(
        fed.cache_stats("/a.nar").unwrap(),
        Some(CacheStats::default())
    );
}

#[test]
fn test_encrypted_stored_size() {
    let host = Arc::new(MemoryFs::new());
    let driver = Arc::new(JsonArchiveDriver::with_encryption(AesKeyStrength::Bits256));
    let bytes = driver.build(&[("key.txt", &b"12345"[..])]).unwrap();
    host.write_file("vault.enc", &bytes).unwrap();
    let config = FederationConfig::default().with_suffix("enc", "aes");
    let fed = Federation::new(host, config).with_driver("aes", driver);

    let meta = fed.stat("/vault.enc/key.txt").unwrap();
    assert_eq!(meta.size, 5);
    assert_eq!(meta.stored_size, 5 + 28);

    fed.write("/vault.enc/blob.bin", &[0u8; 100]).unwrap();
    assert_eq!(fed.stat("/vault.enc/blob.bin").unwrap().stored_size, 128);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever is written into an archive survives a sync and a fresh mount
    #[test]
    fn synced_writes_survive_remount(
        files in prop::collection::btree_map("[a-z]{1,8}\\.txt", prop::collection::vec(any::<u8>(), 0..64), 1..8)
    ) {
        let (host, fed) = federation();
        fed.create("/p.nar", EntryType::Directory).unwrap();
        for (name, data) in &files {
            fed.write(&format!("/p.nar/{}", name), data).unwrap();
        }
        fed.sync_all(sync_options::UNMOUNT).unwrap();
        prop_assert_eq!(fed.controller_count(), 0);

        let fresh = Federation::new(host, FederationConfig::default());
        let listed: BTreeMap<String, Vec<u8>> = names(fresh.list("/p.nar").unwrap())
            .into_iter()
            .map(|name| {
                let data = fresh.read(&format!("/p.nar/{}", name), input_options::NONE).unwrap();
                (name, data)
            })
            .collect();
        prop_assert_eq!(listed, files);
    }
}
