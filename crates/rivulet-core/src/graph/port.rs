//! Input junctions and node outputs.
//!
//! Both keep two views of their connections. The *live* view is edited by
//! the control thread under the graph lock. The *rendering* view is a cached
//! copy the audio thread reads while rendering, recomputed only when the
//! port has been marked dirty (see [`DirtySet`](super::dirty::DirtySet)).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Graph;
use super::bus::AudioBus;
use super::node::Node;

/// Which port of a node a dirty-set entry refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// An input junction.
    Input,
    /// An output.
    Output,
}

/// One upstream edge into a junction.
///
/// Holding the `Arc` is what the upstream node's connection ref accounts for.
#[derive(Clone)]
pub(crate) struct Connection {
    pub node: Arc<Node>,
    pub output: usize,
}

impl Connection {
    fn is(&self, node: &Arc<Node>, output: usize) -> bool {
        Arc::ptr_eq(&self.node, node) && self.output == output
    }
}

/// One downstream edge out of an output.
pub(crate) struct Target {
    pub node: Weak<Node>,
    pub input: usize,
}

/// Summing point for every connection into one node input.
pub(crate) struct InputJunction {
    live: Mutex<Vec<Connection>>,
    rendering: Mutex<Vec<Connection>>,
    rendering_channels: AtomicUsize,
}

impl InputJunction {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            rendering: Mutex::new(Vec::new()),
            rendering_channels: AtomicUsize::new(1),
        }
    }

    /// Adds a live connection. Returns false if it already existed.
    pub fn connect(&self, node: &Arc<Node>, output: usize) -> bool {
        let mut live = self.live.lock();
        if live.iter().any(|c| c.is(node, output)) {
            return false;
        }
        live.push(Connection {
            node: Arc::clone(node),
            output,
        });
        true
    }

    /// Removes a live connection. Returns false if it was not present.
    pub fn disconnect(&self, node: &Arc<Node>, output: usize) -> bool {
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|c| !c.is(node, output));
        live.len() != before
    }

    /// Removes and returns every live connection.
    pub fn take_live(&self) -> Vec<Connection> {
        std::mem::take(&mut *self.live.lock())
    }

    pub fn live_connection_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn rendering_connection_count(&self) -> usize {
        self.rendering.try_lock().map_or(0, |r| r.len())
    }

    #[inline]
    pub fn rendering_channels(&self) -> usize {
        self.rendering_channels.load(Ordering::Acquire)
    }

    /// Rebuilds the rendering view from live connections whose outputs are
    /// enabled. Returns true if the effective channel count changed.
    pub fn update_rendering_state(&self) -> bool {
        let live = self.live.lock();
        let mut rendering = self.rendering.lock();
        rendering.clear();
        let mut channels = 1;
        for connection in live.iter() {
            let Some(output) = connection.node.outputs.get(connection.output) else {
                continue;
            };
            if !output.is_enabled() {
                continue;
            }
            channels = channels.max(output.rendering_channels());
            rendering.push(connection.clone());
        }
        self.rendering_channels.swap(channels, Ordering::AcqRel) != channels
    }

    /// Drops the rendering view. Used at teardown.
    pub fn clear_rendering_state(&self) {
        self.rendering.lock().clear();
    }

    /// Processes every rendering connection for `quantum` and sums their
    /// outputs into `bus`.
    pub fn pull(&self, graph: &Graph, quantum: u64, frames: usize, bus: &mut AudioBus) {
        bus.set_frames(frames);
        bus.set_channels(self.rendering_channels());
        bus.zero();

        let Some(rendering) = self.rendering.try_lock() else {
            return;
        };
        for connection in rendering.iter() {
            connection.node.process_if_necessary(graph, quantum, frames);
        }
        for connection in rendering.iter() {
            if let Some(outputs) = connection.node.output_buses_for_read() {
                if let Some(source) = outputs.get(connection.output) {
                    bus.sum_from(source);
                }
            }
        }
    }
}

/// One output of a node and its downstream edges.
pub(crate) struct NodeOutput {
    targets: Mutex<Vec<Target>>,
    rendering_channels: AtomicUsize,
    enabled: AtomicBool,
}

impl NodeOutput {
    pub fn new(channels: usize) -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
            rendering_channels: AtomicUsize::new(channels),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn add_target(&self, node: &Arc<Node>, input: usize) {
        self.targets.lock().push(Target {
            node: Arc::downgrade(node),
            input,
        });
    }

    /// Removes the edge to `node`'s input `input`.
    pub fn remove_target(&self, node: &Node, input: usize) {
        self.targets
            .lock()
            .retain(|t| !(std::ptr::eq(t.node.as_ptr(), node) && t.input == input));
    }

    /// Removes and returns every downstream edge.
    pub fn take_targets(&self) -> Vec<Target> {
        std::mem::take(&mut *self.targets.lock())
    }

    /// Calls `f` for every downstream edge whose node is still alive.
    pub fn for_each_target(&self, mut f: impl FnMut(&Arc<Node>, usize)) {
        for target in self.targets.lock().iter() {
            if let Some(node) = target.node.upgrade() {
                f(&node, target.input);
            }
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        !self.targets.lock().is_empty()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn rendering_channels(&self) -> usize {
        self.rendering_channels.load(Ordering::Acquire)
    }

    /// Applies new rendering state. Returns true if anything changed.
    pub fn update_rendering_state(&self, channels: usize, enabled: bool) -> bool {
        let channels_changed = self.rendering_channels.swap(channels, Ordering::AcqRel) != channels;
        let enabled_changed = self.enabled.swap(enabled, Ordering::AcqRel) != enabled;
        channels_changed || enabled_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{TestProcessor, detached_node};

    #[test]
    fn test_junction_connect_is_idempotent() {
        let source = detached_node(TestProcessor::default(), 0, 1);
        let junction = InputJunction::new();
        assert!(junction.connect(&source, 0));
        assert!(!junction.connect(&source, 0));
        assert_eq!(junction.live_connection_count(), 1);
        assert!(junction.disconnect(&source, 0));
        assert!(!junction.disconnect(&source, 0));
    }

    #[test]
    fn test_rendering_state_skips_disabled_outputs() {
        let a = detached_node(TestProcessor::default(), 0, 1);
        let b = detached_node(TestProcessor::default(), 0, 1);
        b.outputs[0].update_rendering_state(2, true);
        a.outputs[0].update_rendering_state(1, false);

        let junction = InputJunction::new();
        junction.connect(&a, 0);
        junction.connect(&b, 0);
        assert!(junction.update_rendering_state());
        assert_eq!(junction.rendering_connection_count(), 1);
        assert_eq!(junction.rendering_channels(), 2);
        assert!(!junction.update_rendering_state());
    }

    #[test]
    fn test_rendering_view_is_stale_until_updated() {
        let a = detached_node(TestProcessor::default(), 0, 1);
        let junction = InputJunction::new();
        junction.connect(&a, 0);
        assert_eq!(junction.rendering_connection_count(), 0);
        junction.update_rendering_state();
        assert_eq!(junction.rendering_connection_count(), 1);
    }

    #[test]
    fn test_output_targets() {
        let a = detached_node(TestProcessor::default(), 0, 1);
        let b = detached_node(TestProcessor::default(), 1, 1);
        a.outputs[0].add_target(&b, 0);
        assert!(a.outputs[0].is_connected());
        let mut seen = 0;
        a.outputs[0].for_each_target(|node, input| {
            assert!(Arc::ptr_eq(node, &b));
            assert_eq!(input, 0);
            seen += 1;
        });
        assert_eq!(seen, 1);
        a.outputs[0].remove_target(&b, 0);
        assert!(!a.outputs[0].is_connected());
    }

    #[test]
    fn test_output_rendering_state_change_detection() {
        let output = NodeOutput::new(1);
        assert!(!output.update_rendering_state(1, true));
        assert!(output.update_rendering_state(2, true));
        assert!(output.update_rendering_state(2, false));
        assert!(!output.is_enabled());
    }
}
