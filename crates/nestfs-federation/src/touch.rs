//! Touch notification.
//!
//! The first mutation of a clean archive model raises exactly one
//! [`TouchEvent`], delivered synchronously to every registered listener
//! before the mutating call returns. Later mutations raise nothing until a
//! synchronization makes the model clean again.
//!
//! Listeners run while the controller's exclusive scope is held. A listener
//! that calls back into an archive controller gets `FsError::Reentrant`;
//! operations on plain host paths are still allowed.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::ArchiveFileSystem;

/// Notification that an archive model just became dirty.
pub struct TouchEvent<'a> {
    source: &'a ArchiveFileSystem,
}

impl<'a> TouchEvent<'a> {
    pub(crate) fn new(source: &'a ArchiveFileSystem) -> Self {
        Self { source }
    }

    /// The model that transitioned.
    pub fn source(&self) -> &ArchiveFileSystem {
        self.source
    }
}

/// Observer of touch events.
pub trait TouchListener: Send + Sync {
    /// Called once per clean to dirty transition.
    fn touched(&self, event: &TouchEvent<'_>);
}

fn same_listener(a: &Arc<dyn TouchListener>, b: &Arc<dyn TouchListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

thread_local! {
    static NOTIFYING: Cell<bool> = const { Cell::new(false) };
}

/// Check if the current thread is delivering a touch event.
pub(crate) fn in_notification() -> bool {
    NOTIFYING.with(Cell::get)
}

/// Marks the current thread as notifying until dropped.
struct NotificationScope {
    outer: bool,
}

impl NotificationScope {
    fn enter() -> Self {
        Self {
            outer: NOTIFYING.with(|n| n.replace(true)),
        }
    }
}

impl Drop for NotificationScope {
    fn drop(&mut self) {
        NOTIFYING.with(|n| n.set(self.outer));
    }
}

/// Listener set shared by the controllers of one federation.
#[derive(Clone, Default)]
pub struct TouchNotifier {
    listeners: Vec<Arc<dyn TouchListener>>,
}

impl TouchNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns false if the same listener object is
    /// already registered.
    pub fn register(&mut self, listener: Arc<dyn TouchListener>) -> bool {
        if self.listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&mut self, listener: &Arc<dyn TouchListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Check if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver an event to every listener, in registration order.
    pub fn notify(&self, event: &TouchEvent<'_>) {
        let _scope = NotificationScope::enter();
        for listener in &self.listeners {
            listener.touched(event);
        }
    }
}

/// Listener recording which mount points have pending changes, so a
/// scheduler can synchronize only touched archives.
#[derive(Debug, Default)]
pub struct PendingSyncs {
    touched: Mutex<BTreeSet<String>>,
}

impl PendingSyncs {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a mount point was touched since the last [`take`](Self::take).
    pub fn contains(&self, mount_point: &str) -> bool {
        self.touched.lock().contains(mount_point)
    }

    /// Number of touched mount points.
    pub fn len(&self) -> usize {
        self.touched.lock().len()
    }

    /// Check if nothing was touched.
    pub fn is_empty(&self) -> bool {
        self.touched.lock().is_empty()
    }

    /// Drain the touched mount points, deepest first.
    pub fn take(&self) -> Vec<String> {
        let mut drained: Vec<String> = std::mem::take(&mut *self.touched.lock())
            .into_iter()
            .collect();
        drained.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        drained
    }
}

impl TouchListener for PendingSyncs {
    fn touched(&self, event: &TouchEvent<'_>) {
        self.touched
            .lock()
            .insert(String::from(event.source().mount_point()));
    }
}
