//! The audio graph and its bookkeeping.
//!
//! [`Graph`] owns every collection the control thread and the audio thread
//! share: the [`GraphLock`], the node registry, the dirty sets and the pull
//! registry. Topology edits take the lock and only mark ports dirty. The
//! rendering views the audio thread reads are recomputed during maintenance
//! passes (see [`crate::driver`]).
//!
//! Each collection sits behind its own `parking_lot::Mutex`, but every
//! access happens while the graph lock is held, or from the audio thread on
//! a collection only it touches, so those mutexes are never contended.
//!
//! ```text
//! source ──► junction ──► gain ──► junction ──► destination ──► device
//!                                       ▲
//!                 meter (pull node) ────┘ (or unconnected, driven by pull)
//! ```

pub mod bus;
pub mod dirty;
pub mod node;
pub mod port;
pub mod pull;
pub mod registry;

pub use bus::AudioBus;
pub use dirty::{DirtySet, PortKey};
pub use node::{ChannelMode, Node, NodeId, NodeProcessor, ProcessIo, RefCounts, RefKind};
pub use port::PortKind;
pub use pull::PullRegistry;
pub use registry::NodeRegistry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::control::{ControlQueue, ControlTask};
use crate::error::GraphError;
use crate::lock::GraphLock;
use crate::processors::Destination;
use crate::stats::{EngineStats, StatsCounters};
use node::NodeInit;

/// Fixed parameters of a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphConfig {
    /// Identifier of the owning context. Nodes from different contexts
    /// cannot be connected.
    pub context_id: u64,
    /// Sample rate in Hz.
    pub sample_rate: f32,
    /// Frames per render quantum.
    pub quantum_frames: usize,
    /// Largest channel count any bus may carry.
    pub max_channels: usize,
    /// Channel count of the destination.
    pub output_channels: usize,
    /// Capacity of the control task queue.
    pub control_queue_depth: usize,
    /// Pre-allocated capacity of the lists and sets maintenance touches on
    /// the audio thread: finished nodes, deferred releases, dirty ports and
    /// pull nodes.
    pub audio_list_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            context_id: 0,
            sample_rate: 48000.0,
            quantum_frames: 128,
            max_channels: 8,
            output_channels: 2,
            control_queue_depth: 64,
            audio_list_capacity: 256,
        }
    }
}

/// Parameters for a new node.
pub struct NodeSpec {
    /// Human-readable label for logs and diagnostics.
    pub label: String,
    /// Number of input junctions.
    pub inputs: usize,
    /// Number of outputs.
    pub outputs: usize,
    /// Configured channel count.
    pub channels: usize,
    /// How output channel counts are derived.
    pub channel_mode: ChannelMode,
    /// The DSP side of the node.
    pub processor: Box<dyn NodeProcessor>,
}

impl NodeSpec {
    /// A spec with one input, one output, and outputs following the inputs.
    pub fn new(label: impl Into<String>, processor: impl NodeProcessor + 'static) -> Self {
        Self {
            label: label.into(),
            inputs: 1,
            outputs: 1,
            channels: 1,
            channel_mode: ChannelMode::FollowInputs,
            processor: Box::new(processor),
        }
    }

    /// Sets the port counts.
    pub fn ports(mut self, inputs: usize, outputs: usize) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self
    }

    /// Fixes the output channel count.
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self.channel_mode = ChannelMode::Explicit;
        self
    }
}

/// The shared audio graph.
pub struct Graph {
    pub(crate) lock: GraphLock,
    pub(crate) registry: NodeRegistry,
    pub(crate) dirty: DirtySet,
    pub(crate) pull: PullRegistry,
    pub(crate) control: ControlQueue,
    pub(crate) stats: Arc<StatsCounters>,
    config: GraphConfig,
    destination: Arc<Node>,
    quantum: AtomicU64,
    current_frame: AtomicU64,
    playing: AtomicBool,
    muted: Arc<AtomicBool>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("context_id", &self.config.context_id)
            .field("quantum", &self.current_quantum())
            .field("destination", &self.destination.id())
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Creates a graph with its destination node.
    pub fn new(config: GraphConfig) -> Self {
        let stats = Arc::new(StatsCounters::default());
        let muted = Arc::new(AtomicBool::new(false));
        let destination = Arc::new(Node::new(NodeInit {
            context: config.context_id,
            label: "destination".to_string(),
            inputs: 1,
            outputs: 1,
            channels: config.output_channels,
            channel_mode: ChannelMode::Explicit,
            max_channels: config.max_channels,
            quantum_frames: config.quantum_frames,
            sample_rate: config.sample_rate,
            processor: Box::new(Destination::new(Arc::clone(&muted))),
            stats: Arc::clone(&stats),
        }));
        // The graph itself is the destination's client.
        destination.add_ref(RefKind::Client);

        Self {
            lock: GraphLock::new(),
            registry: NodeRegistry::with_capacity(config.audio_list_capacity),
            dirty: DirtySet::with_capacity(config.audio_list_capacity),
            pull: PullRegistry::with_capacity(config.audio_list_capacity),
            control: ControlQueue::new(config.control_queue_depth),
            stats,
            destination,
            quantum: AtomicU64::new(0),
            current_frame: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            muted,
            config,
        }
    }

    /// Returns the graph lock.
    pub fn lock(&self) -> &GraphLock {
        &self.lock
    }

    /// Returns the fixed graph parameters.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns the destination node.
    pub fn destination(&self) -> &Arc<Node> {
        &self.destination
    }

    /// Index of the quantum being rendered, or to be rendered next.
    #[inline]
    pub fn current_quantum(&self) -> u64 {
        self.quantum.load(Ordering::Acquire)
    }

    /// Frames rendered so far.
    #[inline]
    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / f64::from(self.config.sample_rate)
    }

    pub(crate) fn advance_clock(&self, frames: usize) {
        self.quantum.fetch_add(1, Ordering::AcqRel);
        self.current_frame.fetch_add(frames as u64, Ordering::AcqRel);
    }

    /// Returns true if the destination produced audible output last quantum.
    pub fn is_playing_audio(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Mutes or unmutes the destination. Takes effect from the next
    /// quantum; a muted graph never reports itself as playing audio.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Returns true while the destination is muted.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Records whether the destination was audible and posts a control task
    /// when that changes. Audio thread.
    pub(crate) fn update_playing(&self, audible: bool) {
        if self.playing.swap(audible, Ordering::AcqRel) == audible {
            return;
        }
        if !self.control.post(ControlTask::PlayingAudioChanged(audible)) {
            self.stats.control_task_dropped();
        }
    }

    /// Pops the next control task, if any. For control loops that do not
    /// go through [`AudioContext::pump_control_tasks`](crate::AudioContext::pump_control_tasks).
    pub fn take_control_task(&self) -> Option<ControlTask> {
        self.control.next()
    }

    /// Number of queued control tasks.
    pub fn pending_control_tasks(&self) -> usize {
        self.control.len()
    }

    /// Returns a copy of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Creates a node in this graph.
    ///
    /// The node starts with no references; the caller takes the first one.
    /// Pull nodes are registered straight away.
    pub fn create_node(&self, spec: NodeSpec) -> Arc<Node> {
        let node = Arc::new(Node::new(NodeInit {
            context: self.config.context_id,
            label: spec.label,
            inputs: spec.inputs,
            outputs: spec.outputs,
            channels: spec.channels,
            channel_mode: spec.channel_mode,
            max_channels: self.config.max_channels,
            quantum_frames: self.config.quantum_frames,
            sample_rate: self.config.sample_rate,
            processor: spec.processor,
            stats: Arc::clone(&self.stats),
        }));
        if node.pulls_when_unconnected() {
            let _guard = self.lock.lock_graph();
            self.add_pull_node(&node);
        }
        #[cfg(feature = "tracing")]
        tracing::trace!("create_node: node {} ({})", node.id(), node.label());
        node
    }

    /// Takes one `kind` reference on `node`.
    ///
    /// A connection or keep-alive reference re-enables a dormant node, which
    /// requires lock ownership. Client references need no lock.
    pub fn add_ref(&self, node: &Arc<Node>, kind: RefKind) {
        node.add_ref(kind);
        if kind != RefKind::Client && node.is_disabled() {
            self.enable_outputs(node);
        }
    }

    /// Excludes `node`'s outputs from rendering. Requires lock ownership.
    pub fn disable_outputs(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "disable_outputs without the graph lock");
        if node.set_disabled(true) {
            self.mark_outputs_dirty(node);
            #[cfg(feature = "tracing")]
            tracing::trace!("disable_outputs: node {} is dormant", node.id());
        }
    }

    /// Re-includes `node`'s outputs in rendering. The processor is reset
    /// before its next quantum. Requires lock ownership.
    pub fn enable_outputs(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "enable_outputs without the graph lock");
        if node.set_disabled(false) {
            self.mark_outputs_dirty(node);
            #[cfg(feature = "tracing")]
            tracing::trace!("enable_outputs: node {} re-enabled", node.id());
        }
    }

    fn mark_outputs_dirty(&self, node: &Arc<Node>) {
        for index in 0..node.number_of_outputs() {
            self.mark_output_dirty(node, index);
        }
    }

    fn check_ports(&self, from: &Node, output: usize, to: &Node, input: usize) -> Result<(), GraphError> {
        if output >= from.number_of_outputs() {
            return Err(GraphError::OutputOutOfRange {
                index: output,
                count: from.number_of_outputs(),
            });
        }
        if input >= to.number_of_inputs() {
            return Err(GraphError::InputOutOfRange {
                index: input,
                count: to.number_of_inputs(),
            });
        }
        if from.context_id() != self.config.context_id || to.context_id() != self.config.context_id {
            return Err(GraphError::ContextMismatch);
        }
        Ok(())
    }

    /// Connects output `output` of `from` to input `input` of `to`.
    ///
    /// Connecting an existing edge again is a no-op. The new edge takes a
    /// connection ref on `from` and dirties the junction.
    pub fn connect_nodes(&self, from: &Arc<Node>, output: usize, to: &Arc<Node>, input: usize) -> Result<(), GraphError> {
        self.check_ports(from, output, to, input)?;
        let _guard = self.lock.lock_graph();
        if !to.inputs[input].connect(from, output) {
            return Ok(());
        }
        from.outputs[output].add_target(to, input);
        self.add_ref(from, RefKind::Connection);
        self.mark_junction_dirty(to, input);
        self.refresh_pull_membership(from);
        #[cfg(feature = "tracing")]
        tracing::debug!("connect: {}:{} -> {}:{}", from.id(), output, to.id(), input);
        Ok(())
    }

    /// Removes every edge leaving output `output` of `from`. Returns the
    /// number of edges removed.
    pub fn disconnect_output(&self, from: &Arc<Node>, output: usize) -> Result<usize, GraphError> {
        if output >= from.number_of_outputs() {
            return Err(GraphError::OutputOutOfRange {
                index: output,
                count: from.number_of_outputs(),
            });
        }
        if from.context_id() != self.config.context_id {
            return Err(GraphError::ContextMismatch);
        }
        let _guard = self.lock.lock_graph();
        let mut removed = 0;
        for target in from.outputs[output].take_targets() {
            let Some(to) = target.node.upgrade() else {
                continue;
            };
            if to.inputs[target.input].disconnect(from, output) {
                self.mark_junction_dirty(&to, target.input);
                removed += 1;
            }
        }
        for _ in 0..removed {
            self.finish_release(from, RefKind::Connection);
        }
        self.refresh_pull_membership(from);
        #[cfg(feature = "tracing")]
        tracing::debug!("disconnect: {}:{} ({removed} edges)", from.id(), output);
        Ok(removed)
    }

    /// Removes the single edge `from:output -> to:input`. Returns false if
    /// it did not exist.
    pub fn disconnect_edge(&self, from: &Arc<Node>, output: usize, to: &Arc<Node>, input: usize) -> Result<bool, GraphError> {
        self.check_ports(from, output, to, input)?;
        let _guard = self.lock.lock_graph();
        if !to.inputs[input].disconnect(from, output) {
            return Ok(false);
        }
        from.outputs[output].remove_target(to, input);
        self.mark_junction_dirty(to, input);
        self.finish_release(from, RefKind::Connection);
        self.refresh_pull_membership(from);
        Ok(true)
    }

    /// Drops every connection into `node`'s inputs, releasing the upstream
    /// connection refs. Requires lock ownership.
    pub(crate) fn disconnect_inputs(&self, node: &Arc<Node>) {
        debug_assert!(self.lock.is_owned_by_current_thread(), "disconnect_inputs without the graph lock");
        for (index, junction) in node.inputs.iter().enumerate() {
            let connections = junction.take_live();
            if connections.is_empty() {
                continue;
            }
            self.mark_junction_dirty(node, index);
            for connection in connections {
                connection.node.outputs[connection.output].remove_target(node, index);
                self.finish_release(&connection.node, RefKind::Connection);
                self.refresh_pull_membership(&connection.node);
            }
        }
    }

    /// Fixes the channel count of `node`'s outputs.
    pub fn set_channel_count(&self, node: &Arc<Node>, channels: usize) -> Result<(), GraphError> {
        if channels == 0 || channels > self.config.max_channels {
            return Err(GraphError::InvalidChannelCount {
                requested: channels,
                max: self.config.max_channels,
            });
        }
        if node.context_id() != self.config.context_id {
            return Err(GraphError::ContextMismatch);
        }
        let _guard = self.lock.lock_graph();
        node.set_channel_count(channels);
        self.mark_outputs_dirty(node);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{TestProcessor, test_graph};
    use super::*;

    #[test]
    fn test_connect_takes_connection_ref_and_dirties_junction() {
        let graph = test_graph();
        let source = graph.test_node(TestProcessor::default(), 0, 1);
        let sink = graph.test_node(TestProcessor::default(), 1, 1);

        graph.connect_nodes(&source, 0, &sink, 0).unwrap();
        assert_eq!(source.ref_counts().connection, 1);
        assert!(graph.dirty().contains(&PortKey {
            node: sink.id(),
            kind: PortKind::Input,
            index: 0
        }));
        assert!(source.has_downstream());

        graph.connect_nodes(&source, 0, &sink, 0).unwrap();
        assert_eq!(source.ref_counts().connection, 1);
    }

    #[test]
    fn test_connect_validates_indices() {
        let graph = test_graph();
        let source = graph.test_node(TestProcessor::default(), 0, 1);
        let sink = graph.test_node(TestProcessor::default(), 1, 1);
        assert_eq!(
            graph.connect_nodes(&source, 1, &sink, 0),
            Err(GraphError::OutputOutOfRange { index: 1, count: 1 })
        );
        assert_eq!(
            graph.connect_nodes(&source, 0, &sink, 3),
            Err(GraphError::InputOutOfRange { index: 3, count: 1 })
        );
    }

    #[test]
    fn test_connect_rejects_foreign_nodes() {
        let graph = test_graph();
        let other = Graph::new(GraphConfig {
            context_id: 7,
            ..GraphConfig::default()
        });
        let ours = graph.test_node(TestProcessor::default(), 0, 1);
        let theirs = other.test_node(TestProcessor::default(), 1, 1);
        assert_eq!(graph.connect_nodes(&ours, 0, &theirs, 0), Err(GraphError::ContextMismatch));
    }

    #[test]
    fn test_disconnect_with_client_goes_dormant() {
        let graph = test_graph();
        let source = graph.test_node(TestProcessor::default(), 0, 1);
        source.add_ref(RefKind::Client);
        let sink = graph.test_node(TestProcessor::default(), 1, 1);
        graph.connect_nodes(&source, 0, &sink, 0).unwrap();

        assert_eq!(graph.disconnect_output(&source, 0), Ok(1));
        assert_eq!(source.ref_counts().connection, 0);
        assert!(source.is_disabled());
        assert!(!source.is_marked_for_deletion());

        graph.connect_nodes(&source, 0, &sink, 0).unwrap();
        assert!(!source.is_disabled());
    }

    #[test]
    fn test_disconnect_edge_leaves_other_edges() {
        let graph = test_graph();
        let source = graph.test_node(TestProcessor::default(), 0, 1);
        source.add_ref(RefKind::Client);
        let a = graph.test_node(TestProcessor::default(), 1, 1);
        let b = graph.test_node(TestProcessor::default(), 1, 1);
        graph.connect_nodes(&source, 0, &a, 0).unwrap();
        graph.connect_nodes(&source, 0, &b, 0).unwrap();

        assert_eq!(graph.disconnect_edge(&source, 0, &a, 0), Ok(true));
        assert_eq!(graph.disconnect_edge(&source, 0, &a, 0), Ok(false));
        assert_eq!(source.ref_counts().connection, 1);
        assert!(!source.is_disabled());
    }

    #[test]
    fn test_set_channel_count_validates_range() {
        let graph = test_graph();
        let node = graph.test_node(TestProcessor::default(), 1, 1);
        assert_eq!(
            graph.set_channel_count(&node, 0),
            Err(GraphError::InvalidChannelCount { requested: 0, max: 8 })
        );
        assert_eq!(
            graph.set_channel_count(&node, 9),
            Err(GraphError::InvalidChannelCount { requested: 9, max: 8 })
        );
        graph.set_channel_count(&node, 2).unwrap();
        assert_eq!(node.channel_count(), 2);
        assert_eq!(graph.dirty().output_count(), 1);
    }

    #[test]
    fn test_pull_node_membership_follows_connections() {
        let graph = test_graph();
        let meter = graph.test_node(
            TestProcessor {
                pulls: true,
                ..TestProcessor::default()
            },
            1,
            1,
        );
        meter.add_ref(RefKind::Client);
        assert!(graph.pull().contains(meter.id()));

        let sink = graph.test_node(TestProcessor::default(), 1, 1);
        graph.connect_nodes(&meter, 0, &sink, 0).unwrap();
        assert!(!graph.pull().contains(meter.id()));

        graph.disconnect_output(&meter, 0).unwrap();
        assert!(graph.pull().contains(meter.id()));
    }

    #[test]
    fn test_destination_is_held_by_graph() {
        let graph = test_graph();
        let destination = graph.destination();
        assert_eq!(destination.ref_counts().client, 1);
        assert_eq!(destination.channel_mode(), ChannelMode::Explicit);
        assert_eq!(destination.channel_count(), 2);
    }
}
