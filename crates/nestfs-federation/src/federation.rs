//! The federated file system.
//!
//! [`Federation`] resolves absolute paths to the controller of the deepest
//! mount point on the path, creating controllers on first access. A path
//! component is a mount point when its suffix maps to a registered driver;
//! whether it really is an archive is only decided when the controller
//! loads its container.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use nestfs_federation::{Federation, FederationConfig};
//! use nestfs_vfs::{input_options, sync_options, EntryType, MemoryFs};
//!
//! let fed = Federation::new(Arc::new(MemoryFs::new()), FederationConfig::default());
//! fed.create("/photos.nar", EntryType::Directory).unwrap();
//! fed.write("/photos.nar/cat.txt", b"meow").unwrap();
//! fed.sync_all(sync_options::SYNC).unwrap();
//!
//! assert_eq!(fed.read("/photos.nar/cat.txt", input_options::NONE).unwrap(), b"meow");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use nestfs_vfs::path::{components, join_path};
use nestfs_vfs::{
    input_options, join_entry, normalize_path, sync_options, EntryMeta, EntryType, FileSystem,
    FsError, FsResult, InputOptions, SyncOption, SyncOptions,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::CacheStats;
use crate::config::FederationConfig;
use crate::controller::{
    ControllerId, ControllerStatus, FederationController, HostController, Node, Operation, Reply,
};
use crate::driver::json::{JsonArchiveDriver, JSON_DRIVER};
use crate::driver::ArchiveDriver;
use crate::registry::ControllerRegistry;
use crate::stream::{EntryReader, EntryWriter};
use crate::touch::{TouchListener, TouchNotifier};

fn unexpected(reply: Reply) -> FsError {
    FsError::io(format!("unexpected reply {:?}", reply))
}

/// A tree of mount points over one host file system.
pub struct Federation {
    config: FederationConfig,
    drivers: RwLock<HashMap<String, Arc<dyn ArchiveDriver>>>,
    registry: RwLock<ControllerRegistry>,
    notifier: Arc<RwLock<TouchNotifier>>,
}

impl Federation {
    /// Create a federation over `host`. The JSON reference driver is
    /// registered under its default name.
    pub fn new(host: Arc<dyn FileSystem>, config: FederationConfig) -> Self {
        let mut drivers: HashMap<String, Arc<dyn ArchiveDriver>> = HashMap::new();
        drivers.insert(String::from(JSON_DRIVER), Arc::new(JsonArchiveDriver::new()));
        let root = Node::Host(Arc::new(HostController::new(host)));
        Self {
            config,
            drivers: RwLock::new(drivers),
            registry: RwLock::new(ControllerRegistry::new(root)),
            notifier: Arc::new(RwLock::new(TouchNotifier::new())),
        }
    }

    /// Register a driver, builder style.
    pub fn with_driver(self, name: &str, driver: Arc<dyn ArchiveDriver>) -> Self {
        self.register_driver(name, driver);
        self
    }

    /// Register or replace a driver. Existing controllers keep the driver
    /// they were created with.
    pub fn register_driver(&self, name: &str, driver: Arc<dyn ArchiveDriver>) {
        self.drivers.write().insert(String::from(name), driver);
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    // ========== Path resolution ==========

    pub(crate) fn node(&self, id: ControllerId) -> FsResult<Node> {
        self.registry
            .read()
            .get(id)
            .ok_or_else(|| FsError::io(format!("no controller {:?}", id)))
    }

    fn driver_for(&self, component: &str) -> Option<Arc<dyn ArchiveDriver>> {
        let name = self.config.driver_for(component)?;
        let driver = self.drivers.read().get(name).cloned();
        if driver.is_none() {
            debug!(component, driver = name, "no driver registered, treating as plain entry");
        }
        driver
    }

    /// Controller of the deepest mount point on `path`, and the remaining
    /// entry name within it.
    fn resolve(&self, path: &str) -> FsResult<(Node, String)> {
        let path = normalize_path(path)?;
        let mut current = self.registry.read().root();
        let mut mount_point = String::from("/");
        let mut entry = String::new();

        for component in components(&path) {
            entry = join_entry(&entry, component);
            let Some(driver) = self.driver_for(component) else {
                continue;
            };
            let child = join_path(&mount_point, &entry);
            current = self.mount(current.0, &child, &entry, driver);
            mount_point = child;
            entry.clear();
        }
        Ok((current.1, entry))
    }

    /// Find or create the controller of a mount point.
    fn mount(
        &self,
        parent: ControllerId,
        mount_point: &str,
        entry_in_parent: &str,
        driver: Arc<dyn ArchiveDriver>,
    ) -> (ControllerId, Node) {
        if let Some(found) = self.registry.read().lookup(mount_point) {
            return found;
        }
        let mut registry = self.registry.write();
        if let Some(found) = registry.lookup(mount_point) {
            return found;
        }
        debug!(mount_point, "new mount point");
        registry.insert_archive(FederationController::new(
            String::from(mount_point),
            parent,
            String::from(entry_in_parent),
            driver,
            self.config.fixed_input_options,
            self.notifier.clone(),
        ))
    }

    // ========== Operations ==========

    /// Apply an operation at `path`.
    pub fn apply(&self, path: &str, op: Operation, options: InputOptions) -> FsResult<Reply> {
        let (node, entry) = self.resolve(path)?;
        node.apply(self, &entry, &op, options)
    }

    pub fn stat(&self, path: &str) -> FsResult<EntryMeta> {
        match self.apply(path, Operation::Stat, input_options::NONE)? {
            Reply::Stat(meta) => Ok(meta),
            other => Err(unexpected(other)),
        }
    }

    /// Read a whole file.
    pub fn read(&self, path: &str, options: InputOptions) -> FsResult<Vec<u8>> {
        match self.apply(path, Operation::Read, options)? {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Create or replace a file.
    pub fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.apply(path, Operation::Write(data.to_vec()), input_options::NONE)
            .map(|_| ())
    }

    /// Create an empty file or directory. Creating a directory at an
    /// archive path whose container does not exist creates a new archive.
    pub fn create(&self, path: &str, entry_type: EntryType) -> FsResult<()> {
        self.apply(path, Operation::Create(entry_type), input_options::NONE)
            .map(|_| ())
    }

    pub fn delete(&self, path: &str) -> FsResult<()> {
        self.apply(path, Operation::Delete, input_options::NONE)
            .map(|_| ())
    }

    pub fn list(&self, path: &str) -> FsResult<Vec<EntryMeta>> {
        match self.apply(path, Operation::List, input_options::NONE)? {
            Reply::List(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Open a file for streaming reads.
    pub fn input(&self, path: &str, options: InputOptions) -> FsResult<EntryReader> {
        match self.apply(path, Operation::OpenInput, options)? {
            Reply::Input(reader) => Ok(reader),
            other => Err(unexpected(other)),
        }
    }

    /// Open a writer replacing a file's content.
    pub fn output(&self, path: &str) -> FsResult<EntryWriter> {
        match self.apply(path, Operation::OpenOutput, input_options::NONE)? {
            Reply::Output(writer) => Ok(writer),
            other => Err(unexpected(other)),
        }
    }

    // ========== Synchronization ==========

    /// Synchronize every archive at or below `mount_point`, deepest first,
    /// so nested archives land in their parents before the parents are
    /// written. All controllers are tried; the first failure is returned.
    ///
    /// With `CLEAR_CACHE` or `ABORT_CHANGES`, controllers left idle are
    /// reclaimed.
    pub fn sync(&self, mount_point: &str, options: SyncOptions) -> FsResult<()> {
        let mount_point = normalize_path(mount_point)?;
        if sync_options::waits_and_clears(options) {
            if self.config.reject_wait_with_clear {
                return Err(FsError::UnsupportedOptions(format!(
                    "{:?} waits for streams and clears the cache",
                    options
                )));
            }
            warn!(
                options = ?options,
                "clearing the cache while waiting for streams may deadlock"
            );
        }

        let targets = self.registry.read().subtree_deepest_first(&mount_point);
        let ids: Vec<ControllerId> = targets.iter().map(|(id, _)| *id).collect();
        let mut first_error = None;
        for (_, controller) in targets {
            if let Err(e) = controller.sync(self, options) {
                warn!(
                    mount_point = %controller.mount_point(),
                    error = %e,
                    "synchronization failed"
                );
                first_error.get_or_insert(e);
            }
        }

        let releasing = sync_options::of(&[SyncOption::ClearCache, SyncOption::AbortChanges]);
        if options.intersects(releasing) {
            let mut registry = self.registry.write();
            let reclaimed = ids.into_iter().filter(|id| registry.try_reclaim(*id)).count();
            debug!(mount_point = %mount_point, reclaimed, "reclaimed controllers");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Synchronize every archive of the federation.
    pub fn sync_all(&self, options: SyncOptions) -> FsResult<()> {
        self.sync("/", options)
    }

    // ========== Inspection ==========

    /// The controller of a mount point, if one exists. Holding it keeps the
    /// controller from being reclaimed.
    pub fn controller(&self, mount_point: &str) -> FsResult<Option<Arc<FederationController>>> {
        let mount_point = normalize_path(mount_point)?;
        Ok(self
            .registry
            .read()
            .lookup(&mount_point)
            .and_then(|(_, node)| node.as_archive().cloned()))
    }

    /// Lifecycle state of a mount point. `None` if no controller exists.
    /// Fails with `Reentrant` from inside a touch listener.
    pub fn status(&self, mount_point: &str) -> FsResult<Option<ControllerStatus>> {
        let mount_point = normalize_path(mount_point)?;
        let node = self.registry.read().lookup(&mount_point);
        node.map(|(_, node)| node.status()).transpose()
    }

    pub fn cache_stats(&self, mount_point: &str) -> FsResult<Option<CacheStats>> {
        self.controller(mount_point)?
            .map(|c| c.cache_stats())
            .transpose()
    }

    /// Mount points with a live controller.
    pub fn mount_points(&self) -> Vec<String> {
        self.registry.read().mount_points()
    }

    /// Number of archive controllers.
    pub fn controller_count(&self) -> usize {
        self.registry.read().archive_count()
    }

    // ========== Touch listeners ==========

    /// Register a listener for every archive of the federation. Returns
    /// false if it was already registered.
    pub fn add_touch_listener(&self, listener: Arc<dyn TouchListener>) -> bool {
        self.notifier.write().register(listener)
    }

    pub fn remove_touch_listener(&self, listener: &Arc<dyn TouchListener>) -> bool {
        self.notifier.write().unregister(listener)
    }
}

impl std::fmt::Debug for Federation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federation")
            .field("config", &self.config)
            .field("mount_points", &self.mount_points())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "federation_tests.rs"]
mod federation_tests;
