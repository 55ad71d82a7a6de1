//! Dirty-propagation sets for junctions and outputs.
//!
//! Topology edits only mark the affected ports. Their cached rendering state
//! is recomputed during the next maintenance pass that gets the graph lock.
//! Entries are keyed by [`PortKey`] so marking is idempotent, and hold a
//! `Weak` back-reference so membership never keeps a node alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Graph;
use super::node::{ChannelMode, Node, NodeId};
use super::port::PortKind;

/// Identity of one port in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortKey {
    /// Owning node.
    pub node: NodeId,
    /// Input junction or output.
    pub kind: PortKind,
    /// Port index on the node.
    pub index: usize,
}

type Entries = HashMap<PortKey, Weak<Node>>;

/// Ports whose rendering state must be recomputed.
#[derive(Default)]
pub struct DirtySet {
    junctions: Mutex<Entries>,
    outputs: Mutex<Entries>,
}

impl DirtySet {
    /// Creates empty sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty sets that each hold `capacity` ports before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            junctions: Mutex::new(Entries::with_capacity(capacity)),
            outputs: Mutex::new(Entries::with_capacity(capacity)),
        }
    }

    /// Ports each set holds before it has to grow.
    pub fn capacity(&self) -> usize {
        self.junctions.lock().capacity().min(self.outputs.lock().capacity())
    }

    fn entries(&self, kind: PortKind) -> &Mutex<Entries> {
        match kind {
            PortKind::Input => &self.junctions,
            PortKind::Output => &self.outputs,
        }
    }

    /// Inserts a port. Returns false if it was already present.
    pub(crate) fn mark(&self, node: &Arc<Node>, kind: PortKind, index: usize) -> bool {
        let key = PortKey {
            node: node.id(),
            kind,
            index,
        };
        let mut entries = self.entries(kind).lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::downgrade(node));
        true
    }

    /// Removes every port of `node` from both sets.
    pub(crate) fn purge(&self, node: NodeId) {
        self.junctions.lock().retain(|key, _| key.node != node);
        self.outputs.lock().retain(|key, _| key.node != node);
    }

    /// Returns true if any port of `node` is in either set.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.junctions.lock().keys().any(|key| key.node == node)
            || self.outputs.lock().keys().any(|key| key.node == node)
    }

    /// Returns true if `key` is in its set.
    pub fn contains(&self, key: &PortKey) -> bool {
        self.entries(key.kind).lock().contains_key(key)
    }

    /// Number of dirty junctions.
    pub fn junction_count(&self) -> usize {
        self.junctions.lock().len()
    }

    /// Number of dirty outputs.
    pub fn output_count(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Returns true if both sets are empty.
    pub fn is_empty(&self) -> bool {
        self.junction_count() == 0 && self.output_count() == 0
    }

    pub(crate) fn clear(&self) {
        self.junctions.lock().clear();
        self.outputs.lock().clear();
    }
}

impl Graph {
    /// Marks input `index` of `node` dirty. Requires lock ownership.
    pub fn mark_junction_dirty(&self, node: &Arc<Node>, index: usize) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "mark_junction_dirty without the graph lock");
        self.dirty.mark(node, PortKind::Input, index);
    }

    /// Marks output `index` of `node` dirty. Requires lock ownership.
    pub fn mark_output_dirty(&self, node: &Arc<Node>, index: usize) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "mark_output_dirty without the graph lock");
        self.dirty.mark(node, PortKind::Output, index);
    }

    /// Recomputes every dirty junction and clears the set.
    ///
    /// A junction whose channel count changed dirties the outputs of its
    /// node when they follow the inputs, so the output flush that follows
    /// in the same pass picks them up.
    pub fn flush_dirty_junctions(&self) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "flush_dirty_junctions without the graph lock");
        let mut junctions = self.dirty.junctions.lock();
        for (key, node) in junctions.drain() {
            let Some(node) = node.upgrade() else {
                continue;
            };
            let Some(junction) = node.inputs.get(key.index) else {
                continue;
            };
            let changed = junction.update_rendering_state();
            if changed && key.index == 0 && node.channel_mode() == ChannelMode::FollowInputs {
                for output in 0..node.number_of_outputs() {
                    self.dirty.mark(&node, PortKind::Output, output);
                }
            }
        }
    }

    /// Recomputes every dirty output and clears the set.
    ///
    /// An output whose state changed dirties its downstream junctions. They
    /// are recomputed on the next pass.
    pub fn flush_dirty_outputs(&self) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "flush_dirty_outputs without the graph lock");
        let mut outputs = self.dirty.outputs.lock();
        for (key, node) in outputs.drain() {
            let Some(node) = node.upgrade() else {
                continue;
            };
            let Some(output) = node.outputs.get(key.index) else {
                continue;
            };
            let channels = node.desired_output_channels();
            if output.update_rendering_state(channels, !node.is_disabled()) {
                output.for_each_target(|target, input| {
                    self.dirty.mark(target, PortKind::Input, input);
                });
            }
        }
    }

    /// Returns the dirty sets.
    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }
}
