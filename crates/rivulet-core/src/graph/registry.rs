//! Node registry: keep-alive references, finished nodes and deferred deletion.
//!
//! Disposal runs in stages so the audio thread never destroys a node:
//!
//! ```text
//! Active -> (finished | disconnected) -> Marked -> Ready -> Destroyed
//! ```
//!
//! Every stage except the last needs the graph lock. `Marked -> Ready`
//! happens during the audio thread's post-render pass, which posts a single
//! [`ControlTask::DeleteReadyNodes`]; the control thread then destroys the
//! ready nodes in [`Graph::run_deletion_flush`]. Once the audio thread has
//! finished for good, marked nodes go straight to the ready queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::Graph;
use super::node::{Node, NodeId, RefKind};
use crate::control::ControlTask;

/// A release posted while the lock was unavailable.
pub(crate) struct DeferredRelease {
    node: Arc<Node>,
    kind: RefKind,
}

/// Nodes the engine holds for lifecycle reasons.
pub struct NodeRegistry {
    /// Nodes with autonomous scheduled work, one entry per keep-alive ref.
    referenced: Mutex<Vec<Arc<Node>>>,
    /// Nodes the audio thread saw finish. Audio thread only.
    finished: Mutex<Vec<Arc<Node>>>,
    /// Releases waiting for the lock. Audio thread only.
    deferred: Mutex<Vec<DeferredRelease>>,
    marked: Mutex<Vec<Arc<Node>>>,
    ready: Mutex<Vec<Arc<Node>>>,
    deletion_in_flight: AtomicBool,
}

impl NodeRegistry {
    /// Creates a registry whose audio-thread lists can hold `capacity`
    /// entries before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            referenced: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::with_capacity(capacity)),
            deferred: Mutex::new(Vec::with_capacity(capacity)),
            marked: Mutex::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
            deletion_in_flight: AtomicBool::new(false),
        }
    }

    /// Number of keep-alive entries.
    pub fn referenced_count(&self) -> usize {
        self.referenced.lock().len()
    }

    /// Returns true if `id` holds a keep-alive entry.
    pub fn is_referenced(&self, id: NodeId) -> bool {
        self.referenced.lock().iter().any(|node| node.id() == id)
    }

    /// Number of finished nodes awaiting their final release.
    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Number of releases waiting for the lock.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Number of nodes marked for deletion.
    pub fn marked_count(&self) -> usize {
        self.marked.lock().len()
    }

    /// Number of nodes ready to be destroyed.
    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    /// Returns true while a deletion flush is scheduled or running.
    pub fn is_deletion_in_flight(&self) -> bool {
        self.deletion_in_flight.load(Ordering::Acquire)
    }

    /// Returns true if every list is empty.
    pub fn is_idle(&self) -> bool {
        self.finished_count() == 0
            && self.deferred_count() == 0
            && self.marked_count() == 0
            && self.ready_count() == 0
    }

    /// Removes every keep-alive entry.
    pub(crate) fn take_referenced(&self) -> Vec<Arc<Node>> {
        std::mem::take(&mut *self.referenced.lock())
    }
}

impl Graph {
    /// Takes a keep-alive reference on `node` for scheduled work.
    ///
    /// Control thread. Acquires the lock if the caller does not hold it.
    pub fn keep_alive(&self, node: &Arc<Node>) {
        let _guard = self.lock.lock_graph();
        self.add_ref(node, RefKind::KeptAlive);
        self.registry.referenced.lock().push(Arc::clone(node));
    }

    /// Drops one keep-alive reference on `node`. Requires lock ownership.
    pub fn release_kept_alive(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "release_kept_alive without the graph lock");
        let entry = {
            let mut referenced = self.registry.referenced.lock();
            referenced
                .iter()
                .position(|n| Arc::ptr_eq(n, node))
                .map(|index| referenced.swap_remove(index))
        };
        let Some(entry) = entry else {
            return;
        };
        self.finish_release(node, RefKind::KeptAlive);
        // A node that reached zero is owned by the deletion queue by now.
        drop(entry);
    }

    /// Records that `node` has finished its scheduled work.
    ///
    /// Audio thread only. Reference counts are left untouched until
    /// [`flush_finished`](Self::flush_finished) runs under the lock.
    pub fn notify_finished(&self, node: Arc<Node>) {
        debug_assert!(
            self.lock.is_audio_thread() || self.lock.is_audio_thread_finished(),
            "notify_finished called off the audio thread"
        );
        self.registry.finished.lock().push(node);
    }

    /// Releases the keep-alive reference of every finished node and clears
    /// the finished list. Requires lock ownership.
    pub fn flush_finished(&self) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "flush_finished without the graph lock");
        let mut finished = self.registry.finished.lock();
        for node in finished.drain(..) {
            self.release_kept_alive(&node);
        }
    }

    /// Completes releases that were posted while the lock was busy.
    /// Requires lock ownership.
    pub fn flush_deferred_releases(&self) {
        debug_assert!(
            self.lock.is_owned_by_current_thread(),
            "flush_deferred_releases without the graph lock"
        );
        let mut deferred = self.registry.deferred.lock();
        for release in deferred.drain(..) {
            self.apply_release(&release.node, release.kind);
        }
    }

    /// Queues `node` for deletion and drops it from the pull registry.
    /// Requires lock ownership.
    pub fn mark_for_deletion(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "mark_for_deletion without the graph lock");
        if !node.set_marked() {
            return;
        }
        self.pull.remove(node.id());
        if self.lock.is_audio_thread_finished() {
            self.registry.ready.lock().push(Arc::clone(node));
        } else {
            self.registry.marked.lock().push(Arc::clone(node));
        }
        #[cfg(feature = "tracing")]
        tracing::trace!("mark_for_deletion: node {} ({})", node.id(), node.label());
    }

    /// Moves marked nodes to the ready queue and posts one deletion task.
    ///
    /// Does nothing while a flush is already in flight. If the task cannot
    /// be queued the flag is cleared and the ready nodes wait for the next
    /// pass. Requires lock ownership. Returns true if a task was posted.
    pub fn schedule_deletion_flush(&self) -> bool {
        debug_assert!(
            self.lock.is_owned_by_current_thread(),
            "schedule_deletion_flush without the graph lock"
        );
        if self.registry.deletion_in_flight.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut marked = self.registry.marked.lock();
            let mut ready = self.registry.ready.lock();
            if marked.is_empty() && ready.is_empty() {
                return false;
            }
            ready.append(&mut marked);
        }

        self.registry.deletion_in_flight.store(true, Ordering::Release);
        if self.control.post(ControlTask::DeleteReadyNodes) {
            true
        } else {
            self.registry.deletion_in_flight.store(false, Ordering::Release);
            self.stats.control_task_dropped();
            false
        }
    }

    /// Runs a posted [`ControlTask::DeleteReadyNodes`]. Control thread only.
    ///
    /// Destroys the ready nodes, then ends the in-flight flush so the next
    /// post-render pass may schedule another. Only the task path clears the
    /// flag; calling this without a task taken from the queue would let a
    /// second task be posted while the first is still queued.
    pub fn run_deletion_flush(&self) -> usize {
        let _guard = self.lock.lock_graph();
        let destroyed = self.delete_ready_nodes();
        self.registry.deletion_in_flight.store(false, Ordering::Release);
        self.stats.deletion_flushed();
        destroyed
    }

    /// Destroys every node in the ready queue. Control thread only.
    ///
    /// The queue is re-checked after each node, since destroying a node
    /// releases its upstream connections and can make more nodes ready.
    /// A scheduled flush stays in flight. Returns the number of nodes
    /// destroyed here.
    pub fn delete_ready_nodes(&self) -> usize {
        debug_assert!(!self.lock.is_audio_thread() || self.lock.is_audio_thread_finished());
        let _guard = self.lock.lock_graph();
        let mut destroyed = 0;
        loop {
            let Some(node) = self.registry.ready.lock().pop() else {
                break;
            };
            self.destroy_node(node);
            destroyed += 1;
        }
        #[cfg(feature = "tracing")]
        if destroyed > 0 {
            tracing::debug!("delete_ready_nodes: {destroyed} nodes");
        }
        destroyed
    }

    fn destroy_node(&self, node: Arc<Node>) {
        self.disconnect_inputs(&node);
        self.dirty.purge(node.id());
        self.pull.remove(node.id());
        for junction in &node.inputs {
            junction.clear_rendering_state();
        }
        #[cfg(feature = "tracing")]
        if Arc::strong_count(&node) > 1 {
            tracing::trace!(
                "destroy_node: node {} still referenced by {} rendering views",
                node.id(),
                Arc::strong_count(&node) - 1
            );
        }
        drop(node);
    }

    /// Releases one `kind` reference on `node` from any thread.
    ///
    /// The control thread blocks for the lock. The audio thread only tries;
    /// if the lock is busy the release is deferred to the next post-render
    /// pass. Once the audio thread has finished, nodes this release makes
    /// ready are destroyed before returning.
    pub fn release(&self, node: &Arc<Node>, kind: RefKind) {
        let outcome = if self.lock.is_audio_thread() && !self.lock.is_audio_thread_finished() {
            self.lock.try_acquire()
        } else {
            self.lock.acquire()
        };
        if !outcome.is_acquired() {
            self.registry.deferred.lock().push(DeferredRelease {
                node: Arc::clone(node),
                kind,
            });
            self.stats.release_deferred();
            return;
        }

        self.apply_release(node, kind);
        if outcome.must_release() {
            self.lock.release();
            if self.lock.is_audio_thread_finished() && self.registry.ready_count() > 0 {
                self.delete_ready_nodes();
            }
        }
    }

    fn apply_release(&self, node: &Arc<Node>, kind: RefKind) {
        match kind {
            RefKind::KeptAlive => self.release_kept_alive(node),
            RefKind::Client | RefKind::Connection => self.finish_release(node, kind),
        }
    }

    /// Decrements `kind` and settles the node's fate. Requires lock ownership.
    ///
    /// With no connection or keep-alive refs left the node is marked for
    /// deletion if no client holds it, and goes dormant otherwise.
    pub(crate) fn finish_release(&self, node: &Arc<Node>, kind: RefKind) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "finish_release without the graph lock");
        let counts = node.remove_ref(kind);
        if counts.is_active() {
            return;
        }
        if counts.client == 0 {
            self.mark_for_deletion(node);
        } else if kind != RefKind::Client {
            self.disable_outputs(node);
        }
    }

    /// Returns the node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Final teardown pass. Control thread, after the audio thread has
    /// finished for good.
    ///
    /// Releases every keep-alive entry, disconnects the destination, then
    /// repeats maintenance and deletion until nothing is left to flush.
    /// Finally clears the dirty sets and the pull registry.
    pub(crate) fn flush_for_teardown(&self) {
        debug_assert!(self.lock.is_audio_thread_finished(), "teardown flush while the audio thread is live");
        {
            let _guard = self.lock.lock_graph();
            for node in self.registry.take_referenced() {
                self.finish_release(&node, RefKind::KeptAlive);
            }
            self.disconnect_inputs(self.destination());
        }

        let mut passes = 0;
        loop {
            {
                let _guard = self.lock.lock_graph();
                self.flush_deferred_releases();
                self.flush_finished();
                self.flush_dirty_junctions();
                self.flush_dirty_outputs();
                self.rebuild_pull_snapshot();
                let mut marked = self.registry.marked.lock();
                self.registry.ready.lock().append(&mut marked);
            }
            let mut flush_posted = false;
            while let Some(task) = self.take_control_task() {
                flush_posted |= task == ControlTask::DeleteReadyNodes;
            }
            if flush_posted {
                self.run_deletion_flush();
            } else {
                self.delete_ready_nodes();
            }

            passes += 1;
            let settled = self.registry.is_idle() && self.dirty.is_empty() && !self.pull.needs_rebuild();
            if settled || passes >= TEARDOWN_PASS_LIMIT {
                break;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("teardown flush settled after {passes} passes");

        let _guard = self.lock.lock_graph();
        self.dirty.clear();
        self.pull.clear();
    }
}

/// Upper bound on teardown maintenance passes. Each pass either deletes
/// nodes or settles dirty state, so a real graph converges long before.
const TEARDOWN_PASS_LIMIT: usize = 64;
