//! Graph nodes, liveness counters and the processor interface.
//!
//! A [`Node`] is shared as `Arc<Node>`. The `Arc` only keeps the memory
//! valid; whether the node is *alive* in the graph is decided by three
//! explicit counters, one per reason for liveness (see [`RefKind`]). When
//! the connection and keep-alive counters both reach zero the node stops
//! contributing to rendering, and when the client counter is zero as well
//! it is marked for deletion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::Graph;
use super::bus::AudioBus;
use super::port::{InputJunction, NodeOutput};
use crate::stats::StatsCounters;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a node.
///
/// Identifiers are process-unique and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identifier.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reason a node is being kept alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Held by a client-facing handle.
    Client,
    /// Held by one downstream junction per outgoing edge.
    Connection,
    /// Held by the engine while the node has autonomous scheduled work.
    KeptAlive,
}

/// Point-in-time copy of a node's liveness counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCounts {
    /// Client handle references.
    pub client: usize,
    /// Outgoing edge references.
    pub connection: usize,
    /// Engine keep-alive references.
    pub kept_alive: usize,
}

impl RefCounts {
    /// Returns true if the node still feeds the graph.
    pub fn is_active(&self) -> bool {
        self.connection + self.kept_alive > 0
    }

    /// Returns true if nothing holds the node at all.
    pub fn is_zero(&self) -> bool {
        !self.is_active() && self.client == 0
    }
}

#[derive(Default)]
struct Counters {
    client: AtomicUsize,
    connection: AtomicUsize,
    kept_alive: AtomicUsize,
}

impl Counters {
    fn slot(&self, kind: RefKind) -> &AtomicUsize {
        match kind {
            RefKind::Client => &self.client,
            RefKind::Connection => &self.connection,
            RefKind::KeptAlive => &self.kept_alive,
        }
    }

    fn snapshot(&self) -> RefCounts {
        RefCounts {
            client: self.client.load(Ordering::Acquire),
            connection: self.connection.load(Ordering::Acquire),
            kept_alive: self.kept_alive.load(Ordering::Acquire),
        }
    }
}

/// How a node derives the channel count of its outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Outputs use the node's configured channel count.
    Explicit,
    /// Outputs follow the channel count computed for input 0.
    FollowInputs,
}

/// The DSP side of a node.
///
/// Implementations run on the audio thread and must not block or allocate
/// in [`process`](Self::process).
pub trait NodeProcessor: Send {
    /// Renders one quantum. Output buses arrive zeroed.
    fn process(&mut self, io: &mut ProcessIo<'_>);

    /// Clears internal state. Called on the audio thread before the next
    /// quantum after the node is re-enabled.
    fn reset(&mut self) {}

    /// Returns true if the node must be driven every quantum while none of
    /// its outputs is connected.
    fn pulls_when_unconnected(&self) -> bool {
        false
    }
}

/// Buffers and timing handed to [`NodeProcessor::process`].
pub struct ProcessIo<'a> {
    frames: usize,
    quantum: u64,
    sample_rate: f32,
    inputs: &'a [AudioBus],
    outputs: &'a mut [AudioBus],
    finished: bool,
}

impl<'a> ProcessIo<'a> {
    /// Bundles buffers for one call to [`NodeProcessor::process`].
    pub fn new(
        frames: usize,
        quantum: u64,
        sample_rate: f32,
        inputs: &'a [AudioBus],
        outputs: &'a mut [AudioBus],
    ) -> Self {
        Self {
            frames,
            quantum,
            sample_rate,
            inputs,
            outputs,
            finished: false,
        }
    }

    /// Number of frames in this quantum.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Index of the quantum being rendered.
    #[inline]
    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    /// Sample rate of the context.
    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Returns the summed bus for input `index`.
    pub fn input(&self, index: usize) -> Option<&AudioBus> {
        self.inputs.get(index)
    }

    /// Returns every input bus.
    pub fn inputs(&self) -> &[AudioBus] {
        self.inputs
    }

    /// Returns the bus for output `index`.
    pub fn output_mut(&mut self, index: usize) -> Option<&mut AudioBus> {
        self.outputs.get_mut(index)
    }

    /// Returns every output bus.
    pub fn outputs_mut(&mut self) -> &mut [AudioBus] {
        &mut *self.outputs
    }

    /// Returns the inputs and outputs together, for processors that read
    /// one while writing the other.
    pub fn buses(&mut self) -> (&[AudioBus], &mut [AudioBus]) {
        (self.inputs, &mut *self.outputs)
    }

    /// Reports that the node has no more scheduled work. Its outputs stay
    /// silent from the next quantum on and its keep-alive reference is
    /// released during the next maintenance pass.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Returns true if [`finish`](Self::finish) was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Construction parameters for a [`Node`].
pub(crate) struct NodeInit {
    pub context: u64,
    pub label: String,
    pub inputs: usize,
    pub outputs: usize,
    pub channels: usize,
    pub channel_mode: ChannelMode,
    pub max_channels: usize,
    pub quantum_frames: usize,
    pub sample_rate: f32,
    pub processor: Box<dyn NodeProcessor>,
    pub stats: Arc<StatsCounters>,
}

/// A unit of audio processing in the graph.
pub struct Node {
    id: NodeId,
    context: u64,
    label: String,
    counts: Counters,
    finished: AtomicBool,
    marked: AtomicBool,
    disabled: AtomicBool,
    needs_reset: AtomicBool,
    /// Quantum index + 1 of the last processed quantum, 0 if never.
    last_processed: AtomicU64,
    channels: AtomicUsize,
    explicit_channels: AtomicBool,
    pulls_when_unconnected: bool,
    sample_rate: f32,
    pub(crate) inputs: Vec<InputJunction>,
    pub(crate) outputs: Vec<NodeOutput>,
    input_buses: Mutex<Vec<AudioBus>>,
    output_buses: Mutex<Vec<AudioBus>>,
    processor: Mutex<Box<dyn NodeProcessor>>,
    stats: Arc<StatsCounters>,
}

impl Node {
    pub(crate) fn new(init: NodeInit) -> Self {
        let channels = init.channels.clamp(1, init.max_channels.max(1));
        let bus = |_| AudioBus::new(init.max_channels, init.quantum_frames);
        init.stats.node_created();
        Self {
            id: NodeId::next(),
            context: init.context,
            label: init.label,
            counts: Counters::default(),
            finished: AtomicBool::new(false),
            marked: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            needs_reset: AtomicBool::new(false),
            last_processed: AtomicU64::new(0),
            channels: AtomicUsize::new(channels),
            explicit_channels: AtomicBool::new(init.channel_mode == ChannelMode::Explicit),
            pulls_when_unconnected: init.processor.pulls_when_unconnected(),
            sample_rate: init.sample_rate,
            inputs: (0..init.inputs).map(|_| InputJunction::new()).collect(),
            outputs: (0..init.outputs).map(|_| NodeOutput::new(channels)).collect(),
            input_buses: Mutex::new((0..init.inputs).map(bus).collect()),
            output_buses: Mutex::new((0..init.outputs).map(bus).collect()),
            processor: Mutex::new(init.processor),
            stats: init.stats,
        }
    }

    /// Returns the node's identifier.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the identifier of the owning context.
    #[inline]
    pub fn context_id(&self) -> u64 {
        self.context
    }

    /// Returns the node's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of input junctions.
    #[inline]
    pub fn number_of_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of outputs.
    #[inline]
    pub fn number_of_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Returns the current liveness counters.
    pub fn ref_counts(&self) -> RefCounts {
        self.counts.snapshot()
    }

    /// Returns true once the processor has reported that its work is done.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Returns true once the node has been marked for deletion.
    #[inline]
    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    /// Returns true while the node's outputs are excluded from rendering.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Returns the configured channel count.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    /// Returns how output channel counts are derived.
    pub fn channel_mode(&self) -> ChannelMode {
        if self.explicit_channels.load(Ordering::Acquire) {
            ChannelMode::Explicit
        } else {
            ChannelMode::FollowInputs
        }
    }

    /// Returns true if this node registers as a pull node while unconnected.
    #[inline]
    pub fn pulls_when_unconnected(&self) -> bool {
        self.pulls_when_unconnected
    }

    /// Returns true if any output has a downstream connection.
    pub fn has_downstream(&self) -> bool {
        self.outputs.iter().any(NodeOutput::is_connected)
    }

    /// Returns the effective channel count input `index` rendered with.
    pub fn input_rendering_channels(&self, index: usize) -> Option<usize> {
        self.inputs.get(index).map(InputJunction::rendering_channels)
    }

    /// Returns the effective channel count output `index` renders with.
    pub fn output_rendering_channels(&self, index: usize) -> Option<usize> {
        self.outputs.get(index).map(NodeOutput::rendering_channels)
    }

    /// Number of connections input `index` renders this quantum.
    pub fn input_rendering_connections(&self, index: usize) -> usize {
        self.inputs
            .get(index)
            .map_or(0, InputJunction::rendering_connection_count)
    }

    /// Returns the peak of output `index` from the last rendered quantum.
    ///
    /// Returns `None` if the index is out of range or the audio thread is
    /// currently writing the buffer.
    pub fn output_peak(&self, index: usize) -> Option<f32> {
        let buses = self.output_buses.try_lock()?;
        buses.get(index).map(AudioBus::peak)
    }

    pub(crate) fn add_ref(&self, kind: RefKind) -> usize {
        self.counts.slot(kind).fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements `kind` and returns the counters afterwards.
    pub(crate) fn remove_ref(&self, kind: RefKind) -> RefCounts {
        let underflow = self
            .counts
            .slot(kind)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        debug_assert!(!underflow, "{kind:?} reference count underflow on node {}", self.id);
        self.counts.snapshot()
    }

    /// Sets the marked flag. Returns false if it was already set.
    pub(crate) fn set_marked(&self) -> bool {
        !self.marked.swap(true, Ordering::AcqRel)
    }

    /// Flips the disabled flag. Returns true if it changed.
    pub(crate) fn set_disabled(&self, disabled: bool) -> bool {
        let changed = self.disabled.swap(disabled, Ordering::AcqRel) != disabled;
        if changed && !disabled {
            self.needs_reset.store(true, Ordering::Release);
        }
        changed
    }

    pub(crate) fn set_channel_count(&self, channels: usize) {
        self.channels.store(channels, Ordering::Release);
        self.explicit_channels.store(true, Ordering::Release);
    }

    /// Channel count output buses should render with, given the current
    /// input rendering state.
    pub(crate) fn desired_output_channels(&self) -> usize {
        match self.channel_mode() {
            ChannelMode::Explicit => self.channel_count(),
            ChannelMode::FollowInputs => self
                .inputs
                .first()
                .map_or_else(|| self.channel_count(), InputJunction::rendering_channels),
        }
    }

    /// Processes the node once for `quantum`, pulling its inputs first.
    ///
    /// Repeated calls for the same quantum are no-ops. The quantum stamp is
    /// written before inputs are pulled so feedback cycles terminate.
    pub(crate) fn process_if_necessary(self: &Arc<Self>, graph: &Graph, quantum: u64, frames: usize) {
        let stamp = quantum + 1;
        if self.last_processed.swap(stamp, Ordering::AcqRel) == stamp {
            return;
        }
        self.pull_inputs(graph, quantum, frames);
        self.run_processor(graph, quantum, frames);
    }

    fn pull_inputs(&self, graph: &Graph, quantum: u64, frames: usize) {
        let Some(mut buses) = self.input_buses.try_lock() else {
            return;
        };
        for (junction, bus) in self.inputs.iter().zip(buses.iter_mut()) {
            junction.pull(graph, quantum, frames, bus);
        }
    }

    fn run_processor(self: &Arc<Self>, graph: &Graph, quantum: u64, frames: usize) {
        let (Some(mut processor), Some(inputs), Some(mut outputs)) = (
            self.processor.try_lock(),
            self.input_buses.try_lock(),
            self.output_buses.try_lock(),
        ) else {
            return;
        };

        for (output, bus) in self.outputs.iter().zip(outputs.iter_mut()) {
            bus.set_frames(frames);
            bus.set_channels(output.rendering_channels());
            bus.zero();
        }
        if self.needs_reset.swap(false, Ordering::AcqRel) {
            processor.reset();
        }
        if self.is_finished() {
            return;
        }

        let mut io = ProcessIo::new(frames, quantum, self.sample_rate, &inputs, &mut outputs);
        processor.process(&mut io);
        let finished = io.is_finished();
        drop(io);

        if finished && !self.finished.swap(true, Ordering::AcqRel) {
            graph.notify_finished(Arc::clone(self));
        }
    }

    /// Non-blocking read access to the output buses.
    pub(crate) fn output_buses_for_read(&self) -> Option<MutexGuard<'_, Vec<AudioBus>>> {
        self.output_buses.try_lock()
    }

    /// Copies output 0 into an interleaved buffer. Used for the destination.
    pub(crate) fn write_output_interleaved(&self, out: &mut [f32], channels: usize) -> bool {
        let Some(buses) = self.output_buses.try_lock() else {
            out.fill(0.0);
            return false;
        };
        match buses.first() {
            Some(bus) => {
                bus.write_interleaved(out, channels);
                !bus.is_silent()
            }
            None => {
                out.fill(0.0);
                false
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("counts", &self.ref_counts())
            .field("finished", &self.is_finished())
            .field("marked", &self.is_marked_for_deletion())
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stats.node_destroyed();
    }
}
