//! Controller arena.
//!
//! Controllers live in a [`Slab`]; a child refers to its parent by
//! [`ControllerId`], never by pointer, so a child cannot extend its
//! parent's lifetime. The registry counts children per slot and refuses to
//! reclaim a controller that still has children or is referenced from
//! outside the registry.

use std::collections::HashMap;
use std::sync::Arc;

use slab::Slab;

use crate::controller::{ControllerId, FederationController, Node};

struct Slot {
    node: Node,
    parent: Option<ControllerId>,
    children: usize,
}

pub(crate) struct ControllerRegistry {
    slots: Slab<Slot>,
    by_path: HashMap<String, ControllerId>,
    root: ControllerId,
}

/// Depth of a normalized mount point.
fn depth(mount_point: &str) -> usize {
    mount_point.matches('/').count()
}

impl ControllerRegistry {
    /// Create a registry holding only the root controller.
    pub(crate) fn new(root: Node) -> Self {
        let mut slots = Slab::new();
        let mount_point = String::from(root.mount_point());
        let root = ControllerId(slots.insert(Slot {
            node: root,
            parent: None,
            children: 0,
        }));
        let mut by_path = HashMap::new();
        by_path.insert(mount_point, root);
        Self {
            slots,
            by_path,
            root,
        }
    }

    pub(crate) fn root(&self) -> (ControllerId, Node) {
        (self.root, self.slots[self.root.0].node.clone())
    }

    pub(crate) fn get(&self, id: ControllerId) -> Option<Node> {
        self.slots.get(id.0).map(|slot| slot.node.clone())
    }

    pub(crate) fn lookup(&self, mount_point: &str) -> Option<(ControllerId, Node)> {
        let id = *self.by_path.get(mount_point)?;
        self.get(id).map(|node| (id, node))
    }

    /// Register an archive controller below its parent.
    pub(crate) fn insert_archive(&mut self, controller: FederationController) -> (ControllerId, Node) {
        let parent = controller.parent();
        let mount_point = String::from(controller.mount_point());
        let node = Node::Archive(Arc::new(controller));
        let id = ControllerId(self.slots.insert(Slot {
            node: node.clone(),
            parent: Some(parent),
            children: 0,
        }));
        if let Some(slot) = self.slots.get_mut(parent.0) {
            slot.children += 1;
        }
        self.by_path.insert(mount_point, id);
        (id, node)
    }

    /// Archive controllers at or below `mount_point`, deepest first.
    pub(crate) fn subtree_deepest_first(
        &self,
        mount_point: &str,
    ) -> Vec<(ControllerId, Arc<FederationController>)> {
        let prefix = if mount_point == "/" {
            String::from("/")
        } else {
            format!("{}/", mount_point)
        };
        let mut found: Vec<(ControllerId, Arc<FederationController>)> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| {
                let controller = slot.node.as_archive()?;
                let path = controller.mount_point();
                (path == mount_point || path.starts_with(&prefix))
                    .then(|| (ControllerId(key), Arc::clone(controller)))
            })
            .collect();
        found.sort_by(|(_, a), (_, b)| {
            depth(b.mount_point())
                .cmp(&depth(a.mount_point()))
                .then_with(|| a.mount_point().cmp(b.mount_point()))
        });
        found
    }

    /// Remove a controller if nothing needs it anymore.
    pub(crate) fn try_reclaim(&mut self, id: ControllerId) -> bool {
        let Some(slot) = self.slots.get(id.0) else {
            return false;
        };
        let Some(controller) = slot.node.as_archive() else {
            return false;
        };
        if slot.children > 0
            || Arc::strong_count(controller) > 1
            || !controller.is_reclaimable()
        {
            return false;
        }

        let slot = self.slots.remove(id.0);
        self.by_path.remove(slot.node.mount_point());
        if let Some(parent) = slot.parent.and_then(|p| self.slots.get_mut(p.0)) {
            parent.children = parent.children.saturating_sub(1);
        }
        true
    }

    /// Mount points of every archive controller.
    pub(crate) fn mount_points(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .slots
            .iter()
            .filter_map(|(_, slot)| slot.node.as_archive())
            .map(|c| String::from(c.mount_point()))
            .collect();
        paths.sort();
        paths
    }

    /// Number of archive controllers.
    pub(crate) fn archive_count(&self) -> usize {
        self.slots.len() - 1
    }
}
