//! Automatic-pull registry.
//!
//! Pull nodes are driven every quantum even though nothing downstream pulls
//! them (meters with unconnected outputs, for example). The live set is
//! edited under the graph lock by either thread. The audio thread only ever
//! iterates the rendering snapshot, which is republished through `ArcSwap`
//! when the live set has changed since the last rebuild.
//!
//! Both collections are reserved up front. A rebuild refills the snapshot
//! buffer the audio thread retired last time, so steady-state maintenance
//! does not allocate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::Graph;
use super::node::{Node, NodeId};

type Snapshot = Arc<Vec<Arc<Node>>>;

/// Live pull set plus the snapshot rendered from.
pub struct PullRegistry {
    live: Mutex<HashMap<NodeId, Weak<Node>>>,
    needs_rebuild: AtomicBool,
    snapshot: ArcSwap<Vec<Arc<Node>>>,
    /// Retired snapshot with no readers left, refilled by the next rebuild.
    spare: Mutex<Option<Snapshot>>,
}

impl Default for PullRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PullRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty registry that holds `capacity` pull nodes before
    /// either collection grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            live: Mutex::new(HashMap::with_capacity(capacity)),
            needs_rebuild: AtomicBool::new(false),
            snapshot: ArcSwap::from_pointee(Vec::with_capacity(capacity)),
            spare: Mutex::new(Some(Arc::new(Vec::with_capacity(capacity)))),
        }
    }

    /// Adds `node` to the live set. Returns true if membership changed.
    pub(crate) fn add(&self, node: &Arc<Node>) -> bool {
        let mut live = self.live.lock();
        if live.contains_key(&node.id()) {
            return false;
        }
        live.insert(node.id(), Arc::downgrade(node));
        self.needs_rebuild.store(true, Ordering::Release);
        true
    }

    /// Removes `id` from the live set. Returns true if membership changed.
    pub(crate) fn remove(&self, id: NodeId) -> bool {
        let removed = self.live.lock().remove(&id).is_some();
        if removed {
            self.needs_rebuild.store(true, Ordering::Release);
        }
        removed
    }

    /// Copies the live set into the snapshot if it changed. Returns true if
    /// a new snapshot was published.
    pub(crate) fn rebuild_snapshot(&self) -> bool {
        if !self.needs_rebuild.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mut next: Snapshot = self.spare.lock().take().unwrap_or_default();
        if let Some(nodes) = Arc::get_mut(&mut next) {
            nodes.clear();
            nodes.extend(self.live.lock().values().filter_map(Weak::upgrade));
        }

        let mut retired = self.snapshot.swap(next);
        if let Some(nodes) = Arc::get_mut(&mut retired) {
            nodes.clear();
            *self.spare.lock() = Some(retired);
        }
        true
    }

    /// Returns true if the live set changed since the last rebuild.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    /// Returns the ids in the live set, in id order.
    pub fn live_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.live.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the ids in the rendering snapshot, in id order.
    pub fn snapshot_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.snapshot.load().iter().map(|node| node.id()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true if a retired snapshot buffer is waiting to be reused.
    pub fn has_spare_snapshot(&self) -> bool {
        self.spare.lock().is_some()
    }

    /// Number of nodes in the live set.
    pub fn live_len(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns true if `id` is in the live set.
    pub fn contains(&self, id: NodeId) -> bool {
        self.live.lock().contains_key(&id)
    }

    pub(crate) fn clear(&self) {
        self.live.lock().clear();
        self.needs_rebuild.store(false, Ordering::Release);
        self.snapshot.store(Arc::new(Vec::new()));
    }
}

impl Graph {
    /// Adds `node` to the live pull set. Requires lock ownership.
    pub fn add_pull_node(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "add_pull_node without the graph lock");
        self.pull.add(node);
    }

    /// Removes `node` from the live pull set. Requires lock ownership.
    pub fn remove_pull_node(&self, node: &Node) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "remove_pull_node without the graph lock");
        self.pull.remove(node.id());
    }

    /// Republishes the rendering snapshot if the live set changed.
    /// Requires lock ownership.
    pub fn rebuild_pull_snapshot(&self) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "rebuild_pull_snapshot without the graph lock");
        self.pull.rebuild_snapshot();
    }

    /// Drives every node in the rendering snapshot for the current quantum.
    ///
    /// Audio thread only. Takes no lock; the snapshot load is wait-free.
    pub fn process_pull_snapshot(&self, frames: usize) {
        let quantum = self.current_quantum();
        let snapshot = self.pull.snapshot.load();
        for node in snapshot.iter() {
            node.process_if_necessary(self, quantum, frames);
        }
    }

    /// Keeps pull membership of `node` in step with its connections: a node
    /// that pulls when unconnected is a pull node exactly while none of its
    /// outputs has a downstream edge. Requires lock ownership.
    pub(crate) fn refresh_pull_membership(&self, node: &Arc<Node>) {
        if !node.pulls_when_unconnected() || node.is_marked_for_deletion() {
            return;
        }
        if node.has_downstream() {
            self.remove_pull_node(node);
        } else {
            self.add_pull_node(node);
        }
    }

    /// Returns the pull registry.
    pub fn pull(&self) -> &PullRegistry {
        &self.pull
    }
}
