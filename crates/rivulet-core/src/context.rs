//! The audio context: the facade client code talks to.
//!
//! An [`AudioContext`] owns a [`Graph`], a [`Session`] and the device the
//! session drives. Client code creates nodes through the factories and gets
//! [`NodeHandle`]s back; each handle holds one client reference, released
//! when it is dropped.
//!
//! Contexts initialize lazily: the first factory call (or resume) starts
//! rendering, gate permitting, and claims a slot in the process-wide
//! live-session counter. Teardown ([`AudioContext::stop`], also run on drop
//! and when the session closes) stops the device, releases every scheduled
//! source, and flushes the graph until no node is left pending.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rivulet_core::{AudioContext, ContextOptions, processors::ConstantSource};
//!
//! let context = AudioContext::new(ContextOptions::default())?;
//! let source = context.create_constant_source(ConstantSource::new(0.5).with_duration(4800))?;
//! context.connect(&source, 0, &context.destination(), 0)?;
//! context.resume().wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::control::ControlTask;
use crate::driver::ThreadedDriver;
use crate::error::{ContextError, GraphError};
use crate::graph::{Graph, GraphConfig, Node, NodeId, NodeSpec, RefKind};
use crate::processors::{ConstantSource, Gain, Meter};
use crate::session::{
    AllowAll, Completion, DeviceSession, NullDevice, PermissionGate, Session, SessionKind, SessionState,
    StateChange,
};
use crate::stats::EngineStats;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Counter of realtime contexts that are initialized and not torn down.
#[derive(Debug)]
pub struct LiveSessions {
    count: AtomicUsize,
}

static GLOBAL_LIVE_SESSIONS: LiveSessions = LiveSessions::new();

impl Default for LiveSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveSessions {
    /// Creates a counter at zero.
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// The process-wide counter.
    pub fn global() -> &'static LiveSessions {
        &GLOBAL_LIVE_SESSIONS
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn claim(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Whether rendering may start without a user gesture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoplayPolicy {
    /// Start rendering as soon as the context initializes.
    #[default]
    Allow,
    /// Hold every transition until [`AudioContext::user_gesture`].
    RequireUserGesture,
}

/// Options for a new context.
#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// Sample rate in Hz.
    pub sample_rate: f32,
    /// Frames per render quantum.
    pub quantum_frames: usize,
    /// Largest channel count a node may be set to.
    pub max_channels: usize,
    /// Destination channel count.
    pub output_channels: usize,
    /// Realtime contexts allowed at once, per [`LiveSessions`] counter.
    pub max_live_sessions: usize,
    /// Capacity of the control task queue.
    pub control_queue_depth: usize,
    /// Autoplay behavior.
    pub autoplay: AutoplayPolicy,
    /// Live-session counter the cap is checked against.
    pub live_sessions: &'static LiveSessions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            quantum_frames: 128,
            max_channels: 32,
            output_channels: 2,
            max_live_sessions: 4,
            control_queue_depth: 64,
            autoplay: AutoplayPolicy::Allow,
            live_sessions: LiveSessions::global(),
        }
    }
}

impl ContextOptions {
    /// Checks the options for values no context can run with.
    pub fn validate(&self) -> Result<(), ContextError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ContextError::invalid_options(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.quantum_frames == 0 {
            return Err(ContextError::invalid_options("quantum must hold at least one frame"));
        }
        if self.max_channels == 0 {
            return Err(ContextError::invalid_options("max_channels must be at least 1"));
        }
        if self.output_channels == 0 || self.output_channels > self.max_channels {
            return Err(ContextError::invalid_options(format!(
                "output channels must be in 1..={}, got {}",
                self.max_channels, self.output_channels
            )));
        }
        if self.control_queue_depth == 0 {
            return Err(ContextError::invalid_options("control queue depth must be at least 1"));
        }
        Ok(())
    }

    fn graph_config(&self, context_id: u64) -> GraphConfig {
        GraphConfig {
            context_id,
            sample_rate: self.sample_rate,
            quantum_frames: self.quantum_frames,
            max_channels: self.max_channels,
            output_channels: self.output_channels,
            control_queue_depth: self.control_queue_depth,
            ..GraphConfig::default()
        }
    }
}

/// Client-facing reference to a node.
///
/// Holds one client reference for as long as it lives. Cloning takes
/// another.
pub struct NodeHandle {
    graph: Arc<Graph>,
    node: Arc<Node>,
}

impl NodeHandle {
    fn new(graph: &Arc<Graph>, node: Arc<Node>) -> Self {
        graph.add_ref(&node, RefKind::Client);
        Self {
            graph: Arc::clone(graph),
            node,
        }
    }

    /// Returns the node's identifier.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Returns the node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        Self::new(&self.graph, Arc::clone(&self.node))
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.graph.release(&self.node, RefKind::Client);
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.node).finish()
    }
}

/// Output of an offline render.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedAudio {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    /// Channels per frame.
    pub channels: usize,
    /// Sample rate in Hz.
    pub sample_rate: f32,
}

impl RenderedAudio {
    /// Number of frames.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()))
    }
}

/// Point-in-time view of a context's bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextDiagnostics {
    /// Session state.
    pub state: SessionState,
    /// Engine counters.
    pub stats: EngineStats,
    /// Seconds rendered.
    pub current_time: f64,
    /// Keep-alive entries.
    pub referenced: usize,
    /// Nodes marked for deletion.
    pub marked: usize,
    /// Nodes ready to be destroyed.
    pub ready: usize,
    /// Finished nodes awaiting release.
    pub finished: usize,
    /// Nodes in the live pull set.
    pub pull_nodes: usize,
    /// Dirty junctions plus dirty outputs.
    pub dirty_ports: usize,
    /// Queued control tasks.
    pub pending_control_tasks: usize,
}

struct ContextShared {
    id: u64,
    kind: SessionKind,
    options: ContextOptions,
    graph: Arc<Graph>,
    session: Session,
    device: Arc<dyn DeviceSession>,
    offline_frames: usize,
    initialized: AtomicBool,
    holds_live_slot: AtomicBool,
    torn_down: AtomicBool,
    playing_subscribers: Mutex<Vec<Sender<bool>>>,
}

impl ContextShared {
    fn lazy_initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.kind == SessionKind::Realtime {
            self.options.live_sessions.claim();
            self.holds_live_slot.store(true, Ordering::Release);
            self.session.start_rendering();
        }
        #[cfg(feature = "tracing")]
        tracing::info!("context {} initialized ({:?})", self.id, self.kind);
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.device.stop();
        self.graph.lock().mark_audio_thread_finished();
        if self.holds_live_slot.swap(false, Ordering::AcqRel) {
            self.options.live_sessions.release();
        }
        self.session.set_state(SessionState::Closed);
        self.graph.flush_for_teardown();
        #[cfg(feature = "tracing")]
        tracing::info!(
            "context {} torn down, {} nodes still held by clients",
            self.id,
            self.graph.stats().live_nodes()
        );
    }
}

/// The audio context.
pub struct AudioContext {
    shared: Arc<ContextShared>,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AudioContext {
    /// Creates a realtime context on a device that never renders.
    ///
    /// Drive it from a custom audio thread through [`graph`](Self::graph).
    pub fn new(options: ContextOptions) -> Result<Self, ContextError> {
        Self::with_device(options, Arc::new(NullDevice), Arc::new(AllowAll))
    }

    /// Creates a realtime context rendered by a [`ThreadedDriver`] every
    /// `period`.
    pub fn threaded(options: ContextOptions, period: Duration) -> Result<Self, ContextError> {
        let driver = ThreadedDriver::new(period);
        let context = Self::with_device(options, Arc::new(driver.clone()), Arc::new(AllowAll))?;
        driver.attach(context.shared.graph.clone());
        Ok(context)
    }

    /// Creates a realtime context on `device`, gated by `gate`.
    pub fn with_device(
        options: ContextOptions,
        device: Arc<dyn DeviceSession>,
        gate: Arc<dyn PermissionGate>,
    ) -> Result<Self, ContextError> {
        options.validate()?;
        if options.live_sessions.count() >= options.max_live_sessions {
            return Err(ContextError::TooManySessions {
                limit: options.max_live_sessions,
            });
        }
        Ok(Self::build(SessionKind::Realtime, options, device, gate, 0))
    }

    /// Creates an offline context that renders `frames` frames.
    pub fn offline(options: ContextOptions, frames: usize) -> Result<Self, ContextError> {
        options.validate()?;
        Ok(Self::build(
            SessionKind::Offline,
            options,
            Arc::new(NullDevice),
            Arc::new(AllowAll),
            frames,
        ))
    }

    fn build(
        kind: SessionKind,
        options: ContextOptions,
        device: Arc<dyn DeviceSession>,
        gate: Arc<dyn PermissionGate>,
        offline_frames: usize,
    ) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let graph = Arc::new(Graph::new(options.graph_config(id)));
        let gesture_required = options.autoplay == AutoplayPolicy::RequireUserGesture;
        let session = Session::new(kind, gate, Arc::clone(&device), gesture_required);

        let shared = Arc::new(ContextShared {
            id,
            kind,
            options,
            graph,
            session,
            device,
            offline_frames,
            initialized: AtomicBool::new(false),
            holds_live_slot: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            playing_subscribers: Mutex::new(Vec::new()),
        });

        let weak: Weak<ContextShared> = Arc::downgrade(&shared);
        shared.session.on_closed(move || {
            if let Some(shared) = weak.upgrade() {
                shared.teardown();
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!("context {id} created ({kind:?})");
        Self { shared }
    }

    /// Returns the context identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Returns whether this context renders to a device or into memory.
    pub fn kind(&self) -> SessionKind {
        self.shared.kind
    }

    /// Returns the graph.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.shared.graph
    }

    /// Returns the session state machine.
    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        self.shared.session.state()
    }

    /// Returns true once the context has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.torn_down.load(Ordering::Acquire)
    }

    /// Returns true once a factory or resume has initialized the context.
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f32 {
        self.shared.options.sample_rate
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.shared.graph.current_time()
    }

    /// Returns the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.shared.graph.stats()
    }

    /// Returns a handle to the destination.
    pub fn destination(&self) -> NodeHandle {
        NodeHandle::new(&self.shared.graph, Arc::clone(self.shared.graph.destination()))
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.is_closed() {
            Err(GraphError::ContextClosed)
        } else {
            Ok(())
        }
    }

    fn check_owned(&self, handle: &NodeHandle) -> Result<(), GraphError> {
        if Arc::ptr_eq(&handle.graph, &self.shared.graph) {
            Ok(())
        } else {
            Err(GraphError::ContextMismatch)
        }
    }

    /// Creates a node from `spec`.
    pub fn create_node(&self, spec: NodeSpec) -> Result<NodeHandle, GraphError> {
        self.ensure_open()?;
        self.shared.lazy_initialize();
        let node = self.shared.graph.create_node(spec);
        Ok(NodeHandle::new(&self.shared.graph, node))
    }

    /// Creates a node with autonomous scheduled work. The engine keeps it
    /// alive until its processor reports it finished.
    pub fn create_scheduled_node(&self, spec: NodeSpec) -> Result<NodeHandle, GraphError> {
        let handle = self.create_node(spec)?;
        self.shared.graph.keep_alive(handle.node());
        self.shared.session.node_will_begin_playback();
        Ok(handle)
    }

    /// Creates a scheduled constant source with one mono output.
    pub fn create_constant_source(&self, source: ConstantSource) -> Result<NodeHandle, GraphError> {
        self.create_scheduled_node(NodeSpec::new("constant-source", source).ports(0, 1).channels(1))
    }

    /// Creates a gain stage.
    pub fn create_gain(&self, gain: Gain) -> Result<NodeHandle, GraphError> {
        self.create_node(NodeSpec::new("gain", gain))
    }

    /// Creates a meter. It is driven by the pull registry while its output
    /// is unconnected.
    pub fn create_meter(&self, meter: Meter) -> Result<NodeHandle, GraphError> {
        self.create_node(NodeSpec::new("meter", meter))
    }

    /// Connects `from:output` to `to:input`.
    pub fn connect(&self, from: &NodeHandle, output: usize, to: &NodeHandle, input: usize) -> Result<(), GraphError> {
        self.ensure_open()?;
        self.check_owned(from)?;
        self.check_owned(to)?;
        self.shared.graph.connect_nodes(from.node(), output, to.node(), input)
    }

    /// Removes every edge leaving `from:output`. Returns the number removed.
    pub fn disconnect(&self, from: &NodeHandle, output: usize) -> Result<usize, GraphError> {
        self.ensure_open()?;
        self.check_owned(from)?;
        self.shared.graph.disconnect_output(from.node(), output)
    }

    /// Removes the single edge `from:output -> to:input`.
    pub fn disconnect_from(
        &self,
        from: &NodeHandle,
        output: usize,
        to: &NodeHandle,
        input: usize,
    ) -> Result<bool, GraphError> {
        self.ensure_open()?;
        self.check_owned(from)?;
        self.check_owned(to)?;
        self.shared.graph.disconnect_edge(from.node(), output, to.node(), input)
    }

    /// Fixes the output channel count of `node`.
    pub fn set_channel_count(&self, node: &NodeHandle, channels: usize) -> Result<(), GraphError> {
        self.ensure_open()?;
        self.check_owned(node)?;
        self.shared.graph.set_channel_count(node.node(), channels)
    }

    /// Requests a move to `Suspended`.
    pub fn suspend(&self) -> Completion {
        let (done, completion) = Completion::channel();
        self.shared.session.suspend(done);
        completion
    }

    /// Requests a move to `Running`, initializing the context first.
    pub fn resume(&self) -> Completion {
        if !self.is_closed() {
            self.shared.lazy_initialize();
        }
        let (done, completion) = Completion::channel();
        self.shared.session.resume(done);
        completion
    }

    /// Requests a move to `Closed`. Reaching it tears the context down.
    pub fn close(&self) -> Completion {
        let (done, completion) = Completion::channel();
        self.shared.session.close(done);
        completion
    }

    /// Records a user gesture, lifting the autoplay restriction.
    pub fn user_gesture(&self) {
        self.shared.session.user_gesture();
    }

    /// Re-evaluates a pending transition after the permission gate changed.
    pub fn permission_granted(&self) {
        self.shared.session.permission_granted();
    }

    /// Starts a platform interruption.
    pub fn begin_interruption(&self) {
        self.shared.session.begin_interruption();
    }

    /// Ends a platform interruption.
    pub fn end_interruption(&self, may_resume: bool) {
        self.shared.session.end_interruption(may_resume);
    }

    /// Reacts to the embedding page or window being hidden or shown.
    ///
    /// Ignored while the context is audible. Otherwise hiding a running
    /// context starts an interruption, and showing an interrupted one ends
    /// it and resumes.
    pub fn visibility_changed(&self, hidden: bool) {
        if self.shared.graph.is_playing_audio() {
            return;
        }
        let session = &self.shared.session;
        match (hidden, session.state()) {
            (true, SessionState::Running) => {
                #[cfg(feature = "tracing")]
                tracing::info!("context {}: suspending playback in the background", self.shared.id);
                session.begin_interruption();
            }
            (false, SessionState::Interrupted) => {
                #[cfg(feature = "tracing")]
                tracing::info!("context {}: resuming playback in the foreground", self.shared.id);
                session.end_interruption(true);
            }
            _ => {}
        }
    }

    /// Mutes or unmutes the destination output.
    pub fn set_muted(&self, muted: bool) {
        self.shared.graph.set_muted(muted);
    }

    /// Returns true while the destination output is muted.
    pub fn is_muted(&self) -> bool {
        self.shared.graph.is_muted()
    }

    /// Subscribes to session state changes.
    pub fn subscribe_state(&self) -> Receiver<StateChange> {
        self.shared.session.subscribe()
    }

    /// Subscribes to "is playing audio" changes, delivered by
    /// [`pump_control_tasks`](Self::pump_control_tasks).
    pub fn subscribe_playing(&self) -> Receiver<bool> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.playing_subscribers.lock().push(tx);
        rx
    }

    /// Runs every queued control task. Control thread. Returns the number
    /// of tasks run.
    pub fn pump_control_tasks(&self) -> usize {
        let graph = &self.shared.graph;
        let mut handled = 0;
        while let Some(task) = graph.take_control_task() {
            match task {
                ControlTask::DeleteReadyNodes => {
                    graph.run_deletion_flush();
                }
                ControlTask::PlayingAudioChanged(playing) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("context {}: playing audio = {playing}", self.shared.id);
                    self.shared
                        .playing_subscribers
                        .lock()
                        .retain(|tx| tx.send(playing).is_ok());
                }
            }
            handled += 1;
        }
        handled
    }

    /// Renders the whole offline length on the calling thread, then closes.
    ///
    /// Returns [`ContextError::Session`] for a realtime context or one that
    /// already rendered.
    pub fn start_rendering(&self) -> Result<RenderedAudio, ContextError> {
        if self.shared.kind != SessionKind::Offline {
            return Err(crate::error::SessionError::InvalidState("only offline contexts render on demand").into());
        }
        if self.state() != SessionState::Suspended || self.is_closed() {
            return Err(crate::error::SessionError::InvalidState("offline context already rendered").into());
        }
        self.shared.lazy_initialize();

        let graph = &self.shared.graph;
        let frames = self.shared.offline_frames;
        let quantum = graph.config().quantum_frames;
        let channels = graph.config().output_channels;
        let mut samples = vec![0.0_f32; frames * channels];
        let mut chunk = vec![0.0_f32; quantum * channels];

        graph.lock().register_audio_thread();
        self.shared.session.set_state(SessionState::Running);

        let mut rendered = 0;
        while rendered < frames {
            let n = (frames - rendered).min(quantum);
            graph.render_quantum(n, &mut chunk);
            samples[rendered * channels..(rendered + n) * channels].copy_from_slice(&chunk[..n * channels]);
            rendered += n;
        }

        graph.lock().mark_audio_thread_finished();
        self.pump_control_tasks();
        #[cfg(feature = "tracing")]
        tracing::info!("offline render complete: {frames} frames");
        self.shared.session.set_state(SessionState::Closed);

        Ok(RenderedAudio {
            samples,
            channels,
            sample_rate: self.shared.options.sample_rate,
        })
    }

    /// Tears the context down: stops the device, closes the session,
    /// releases scheduled sources and flushes every pending deletion.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.teardown();
    }

    /// Returns a snapshot of the context's bookkeeping.
    pub fn diagnostics(&self) -> ContextDiagnostics {
        let graph = &self.shared.graph;
        let registry = graph.registry();
        ContextDiagnostics {
            state: self.state(),
            stats: graph.stats(),
            current_time: graph.current_time(),
            referenced: registry.referenced_count(),
            marked: registry.marked_count(),
            ready: registry.ready_count(),
            finished: registry.finished_count(),
            pull_nodes: graph.pull().live_len(),
            dirty_ports: graph.dirty().junction_count() + graph.dirty().output_count(),
            pending_control_tasks: graph.pending_control_tasks(),
        }
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}
