//! Integration tests for rivulet-core.
//!
//! Exercises the coordinator end to end through its public API: keep-alive
//! and finished-node flushing, lock contention between a control thread and
//! the audio thread, node destruction on the control thread, dormant nodes,
//! pull-driven meters, offline rendering, the session state machine,
//! visibility and muting, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rivulet_core::processors::{ConstantSource, Gain, Meter};
use rivulet_core::{
    AllowAll, AudioContext, Completion, ContextError, ContextOptions, DeviceSession, Graph, GraphConfig,
    LiveSessions, NodeProcessor, NodeSpec, ProcessIo, RefKind, SessionState, StateCallback, StateChange,
};

const QUANTUM: usize = 128;

/// Processor writing a constant that finishes after a number of quanta and
/// records how often it was processed and reset.
#[derive(Default)]
struct Tally {
    value: f32,
    finish_after: Option<u64>,
    calls: Arc<AtomicU64>,
    resets: Arc<AtomicU64>,
}

impl Tally {
    fn constant(value: f32) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

impl NodeProcessor for Tally {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        for bus in io.outputs_mut() {
            bus.fill(self.value);
        }
        if self.finish_after.is_some_and(|n| calls >= n) {
            io.finish();
        }
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Processor that records the name of the thread it is dropped on.
struct DropRecorder {
    dropped_on: Arc<Mutex<Option<String>>>,
}

impl NodeProcessor for DropRecorder {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        for bus in io.outputs_mut() {
            bus.fill(0.1);
        }
    }
}

impl Drop for DropRecorder {
    fn drop(&mut self) {
        let name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        *self.dropped_on.lock() = Some(name);
    }
}

/// Device counting transitions, completing each immediately.
#[derive(Default)]
struct CountingDevice {
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl DeviceSession for CountingDevice {
    fn begin_resume(&self, done: StateCallback) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        done(Ok(()));
    }
    fn begin_suspend(&self, done: StateCallback) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        done(Ok(()));
    }
    fn begin_close(&self, done: StateCallback) {
        done(Ok(()));
    }
    fn stop(&self) {}
}

fn render(graph: &Graph) -> Vec<f32> {
    let mut out = vec![0.0; QUANTUM * graph.config().output_channels];
    graph.render_quantum(QUANTUM, &mut out);
    out
}

/// Renders one quantum on a short-lived audio thread, leaving the calling
/// thread a control thread.
fn render_on_audio_thread(graph: &Graph) -> Vec<f32> {
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                graph.lock().register_audio_thread();
                render(graph)
            })
            .join()
            .unwrap()
    })
}

fn options(live: &'static LiveSessions) -> ContextOptions {
    ContextOptions {
        live_sessions: live,
        ..ContextOptions::default()
    }
}

/// Spawns a thread that holds the graph lock until the returned sender is
/// used or dropped.
fn hold_lock(graph: &Arc<Graph>) -> (crossbeam_channel::Sender<()>, std::thread::JoinHandle<()>) {
    let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let graph = Arc::clone(graph);
    let holder = std::thread::spawn(move || {
        let _guard = graph.lock().lock_graph();
        locked_tx.send(()).unwrap();
        let _ = release_rx.recv();
    });
    locked_rx.recv().unwrap();
    (release_tx, holder)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

// ============================================================================
// 1. Keep-alive and finished nodes
// ============================================================================

#[test]
fn finished_source_leaves_referenced_list() {
    let graph = Graph::new(GraphConfig::default());
    graph.lock().register_audio_thread();

    let source = graph.create_node(
        NodeSpec::new(
            "one-shot",
            Tally {
                value: 1.0,
                finish_after: Some(2),
                ..Tally::default()
            },
        )
        .ports(0, 1),
    );
    graph.keep_alive(&source);
    assert_eq!(graph.registry().referenced_count(), 1);
    graph.connect_nodes(&source, 0, graph.destination(), 0).unwrap();

    render(&graph);
    assert_eq!(graph.registry().referenced_count(), 1);
    assert!(!source.is_finished());

    let out = render(&graph);
    assert!(out.iter().all(|&s| s == 1.0));
    assert!(source.is_finished());
    assert_eq!(graph.registry().referenced_count(), 0);
    assert_eq!(graph.registry().finished_count(), 0);
    assert_eq!(source.ref_counts().kept_alive, 0);

    // Finished sources render silence from then on.
    let out = render(&graph);
    assert!(out.iter().all(|&s| s == 0.0));
}

// ============================================================================
// 2. Lock contention
// ============================================================================

#[test]
fn contention_for_100_quanta_then_single_flush() {
    let graph = Arc::new(Graph::new(GraphConfig::default()));
    graph.lock().register_audio_thread();

    let source = graph.create_node(
        NodeSpec::new(
            "one-shot",
            Tally {
                value: 0.5,
                finish_after: Some(3),
                ..Tally::default()
            },
        )
        .ports(0, 1),
    );
    graph.keep_alive(&source);
    graph.connect_nodes(&source, 0, graph.destination(), 0).unwrap();
    render(&graph);

    let late = graph.create_node(NodeSpec::new("late", Tally::constant(0.25)).ports(0, 1));
    graph.add_ref(&late, RefKind::Client);

    let (release, holder) = {
        let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let graph = Arc::clone(&graph);
        let late = Arc::clone(&late);
        let holder = std::thread::spawn(move || {
            let _guard = graph.lock().lock_graph();
            graph.connect_nodes(&late, 0, graph.destination(), 0).unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();
        (release_tx, holder)
    };

    let skipped_before = graph.stats().maintenance_skipped;
    for _ in 0..100 {
        render(&graph);
    }
    assert_eq!(graph.stats().maintenance_skipped - skipped_before, 200);
    assert!(source.is_finished());
    assert_eq!(graph.registry().finished_count(), 1);
    assert_eq!(graph.registry().referenced_count(), 1);
    assert!(!graph.dirty().is_empty());
    // The edge made under contention is not rendered yet.
    assert_eq!(graph.destination().input_rendering_connections(0), 1);

    release.send(()).unwrap();
    holder.join().unwrap();

    let out = render(&graph);
    assert_eq!(graph.registry().finished_count(), 0);
    assert_eq!(graph.registry().referenced_count(), 0);
    assert!(graph.dirty().is_empty());
    assert_eq!(graph.destination().input_rendering_connections(0), 2);
    assert!(out.iter().all(|&s| s == 0.25));

    // Nothing leaks: tear the graph down by hand.
    graph.lock().mark_audio_thread_finished();
    graph.disconnect_output(&source, 0).unwrap();
    graph.disconnect_output(&late, 0).unwrap();
    {
        // The destination's rendering view still holds both sources.
        let _guard = graph.lock().lock_graph();
        graph.flush_dirty_junctions();
    }
    graph.release(&late, RefKind::Client);
    drop(source);
    drop(late);
    graph.delete_ready_nodes();
    assert_eq!(graph.stats().live_nodes(), 1);
}

#[test]
fn audio_thread_release_under_contention_is_deferred() {
    let graph = Arc::new(Graph::new(GraphConfig::default()));
    graph.lock().register_audio_thread();
    let node = graph.create_node(NodeSpec::new("gain", Gain::new(1.0)));
    graph.add_ref(&node, RefKind::Client);

    let (release, holder) = hold_lock(&graph);
    graph.release(&node, RefKind::Client);
    assert_eq!(graph.registry().deferred_count(), 1);
    assert_eq!(node.ref_counts().client, 1);
    assert_eq!(graph.stats().releases_deferred, 1);

    release.send(()).unwrap();
    holder.join().unwrap();

    render(&graph);
    assert_eq!(graph.registry().deferred_count(), 0);
    assert!(node.is_marked_for_deletion());
    assert_eq!(graph.take_control_task(), Some(rivulet_core::ControlTask::DeleteReadyNodes));
}

// ============================================================================
// 3. Destruction happens on the control thread
// ============================================================================

#[test]
fn nodes_are_destroyed_on_the_control_thread() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::threaded(options(&LIVE), Duration::from_millis(1)).unwrap();
    let dropped_on = Arc::new(Mutex::new(None));

    let node = context
        .create_node(
            NodeSpec::new(
                "recorded",
                DropRecorder {
                    dropped_on: Arc::clone(&dropped_on),
                },
            )
            .ports(0, 1),
        )
        .unwrap();
    context.connect(&node, 0, &context.destination(), 0).unwrap();
    assert!(wait_until(Duration::from_secs(5), || context.graph().current_quantum() >= 3));

    context.disconnect(&node, 0).unwrap();
    drop(node);

    let destroyed = wait_until(Duration::from_secs(5), || {
        context.pump_control_tasks();
        dropped_on.lock().is_some()
    });
    assert!(destroyed, "node was never destroyed");

    let control = std::thread::current().name().map(str::to_string);
    assert_eq!(*dropped_on.lock(), control);
    assert_ne!(dropped_on.lock().as_deref(), Some("rivulet-audio"));
}

// ============================================================================
// 4. Dormant nodes and cascades
// ============================================================================

#[test]
fn dormant_node_is_reset_when_reconnected() {
    let graph = Graph::new(GraphConfig::default());
    graph.lock().register_audio_thread();
    let tally = Tally::constant(0.5);
    let resets = Arc::clone(&tally.resets);
    let calls = Arc::clone(&tally.calls);
    let node = graph.create_node(NodeSpec::new("osc", tally).ports(0, 1));
    graph.add_ref(&node, RefKind::Client);

    graph.connect_nodes(&node, 0, graph.destination(), 0).unwrap();
    render(&graph);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    graph.disconnect_output(&node, 0).unwrap();
    assert!(node.is_disabled());
    let out = render(&graph);
    assert!(out.iter().all(|&s| s == 0.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    graph.connect_nodes(&node, 0, graph.destination(), 0).unwrap();
    assert!(!node.is_disabled());
    let out = render(&graph);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert!(out.iter().all(|&s| s == 0.5));
}

#[test]
fn destroying_a_chain_cascades_upstream() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::offline(options(&LIVE), QUANTUM * 4).unwrap();
    let source = context.create_constant_source(ConstantSource::new(0.5)).unwrap();
    let first = context.create_gain(Gain::new(1.0)).unwrap();
    let second = context.create_gain(Gain::new(1.0)).unwrap();
    context.connect(&source, 0, &first, 0).unwrap();
    context.connect(&first, 0, &second, 0).unwrap();
    context.connect(&second, 0, &context.destination(), 0).unwrap();
    drop((source, first, second));

    let rendered = context.start_rendering().unwrap();
    assert!((rendered.peak() - 0.5).abs() < 1e-6);

    // Teardown released the source and disconnected the destination; the
    // chain unwinds from the destination back to the source.
    assert_eq!(context.stats().live_nodes(), 1);
    assert!(context.graph().registry().is_idle());
}

// ============================================================================
// 5. Pull-driven meters
// ============================================================================

#[test]
fn unconnected_meter_is_pulled_every_quantum() {
    let graph = Graph::new(GraphConfig::default());
    graph.lock().register_audio_thread();

    let source = graph.create_node(NodeSpec::new("dc", Tally::constant(0.75)).ports(0, 1));
    graph.add_ref(&source, RefKind::Client);
    let meter = Meter::new();
    let readings = meter.probe();
    let meter = graph.create_node(NodeSpec::new("meter", meter));
    graph.add_ref(&meter, RefKind::Client);
    assert!(graph.pull().contains(meter.id()));

    graph.connect_nodes(&source, 0, &meter, 0).unwrap();
    render(&graph);
    render(&graph);
    assert_eq!(readings.quanta(), 2);
    assert_eq!(readings.peak(), 0.75);
    assert_eq!(graph.pull().snapshot_ids(), vec![meter.id()]);

    graph.connect_nodes(&meter, 0, graph.destination(), 0).unwrap();
    assert!(!graph.pull().contains(meter.id()));
    let out = render(&graph);
    assert!(graph.pull().snapshot_ids().is_empty());
    assert_eq!(readings.quanta(), 3);
    assert!(out.iter().all(|&s| s == 0.75));
}

// ============================================================================
// 6. Offline rendering
// ============================================================================

#[test]
fn offline_render_produces_audio_and_closes() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::offline(options(&LIVE), 1000).unwrap();
    let states = context.subscribe_state();

    let source = context
        .create_constant_source(ConstantSource::new(0.5).with_duration(480))
        .unwrap();
    let gain = context.create_gain(Gain::new(0.5)).unwrap();
    context.connect(&source, 0, &gain, 0).unwrap();
    context.connect(&gain, 0, &context.destination(), 0).unwrap();

    let rendered = context.start_rendering().unwrap();
    assert_eq!(rendered.frames(), 1000);
    assert_eq!(rendered.channels, 2);
    assert!(rendered.samples[..480 * 2].iter().all(|&s| (s - 0.25).abs() < 1e-6));
    assert!(rendered.samples[480 * 2..].iter().all(|&s| s == 0.0));

    assert_eq!(context.state(), SessionState::Closed);
    assert!(context.is_closed());
    let changes: Vec<StateChange> = states.try_iter().collect();
    assert_eq!(
        changes,
        vec![
            StateChange {
                from: SessionState::Suspended,
                to: SessionState::Running
            },
            StateChange {
                from: SessionState::Running,
                to: SessionState::Closed
            },
        ]
    );
    assert!(context.start_rendering().is_err());

    // Handles outliving the render are destroyed as soon as they drop.
    drop((source, gain));
    assert_eq!(context.stats().live_nodes(), 1);
}

#[test]
fn offline_context_rejects_session_requests() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::offline(options(&LIVE), 128).unwrap();
    assert!(context.suspend().wait().is_err());
    assert!(context.resume().wait().is_err());
    assert!(context.close().wait().is_err());
}

// ============================================================================
// 7. Session state machine
// ============================================================================

#[test]
fn suspend_twice_transitions_device_once() {
    static LIVE: LiveSessions = LiveSessions::new();
    let device = Arc::new(CountingDevice::default());
    let context = AudioContext::with_device(options(&LIVE), device.clone(), Arc::new(AllowAll)).unwrap();
    let states = context.subscribe_state();
    assert_eq!(context.resume().wait(), Ok(()));

    assert_eq!(context.suspend().wait(), Ok(()));
    assert_eq!(context.state(), SessionState::Suspended);
    assert_eq!(context.suspend().wait(), Ok(()));
    assert_eq!(device.suspends.load(Ordering::SeqCst), 1);

    let suspended = states
        .try_iter()
        .filter(|change| change.to == SessionState::Suspended)
        .count();
    assert_eq!(suspended, 1);
}

#[test]
fn interruption_lands_on_interrupted_and_resumes() {
    static LIVE: LiveSessions = LiveSessions::new();
    let device = Arc::new(CountingDevice::default());
    let context = AudioContext::with_device(options(&LIVE), device.clone(), Arc::new(AllowAll)).unwrap();
    assert_eq!(context.resume().wait(), Ok(()));

    context.begin_interruption();
    assert_eq!(context.state(), SessionState::Interrupted);
    assert!(context.suspend().wait().is_err());

    context.end_interruption(true);
    assert_eq!(context.state(), SessionState::Running);
    assert_eq!(device.resumes.load(Ordering::SeqCst), 2);
}

#[test]
fn autoplay_waits_for_user_gesture() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::new(ContextOptions {
        autoplay: rivulet_core::AutoplayPolicy::RequireUserGesture,
        ..options(&LIVE)
    })
    .unwrap();
    let _source = context.create_constant_source(ConstantSource::new(0.5)).unwrap();
    assert_eq!(context.state(), SessionState::Suspended);

    let resumed: Completion = context.resume();
    assert_eq!(resumed.try_result(), None);

    context.user_gesture();
    assert_eq!(context.state(), SessionState::Running);
    assert_eq!(resumed.wait(), Ok(()));
}

#[test]
fn closing_rejects_waiting_resume() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::new(ContextOptions {
        autoplay: rivulet_core::AutoplayPolicy::RequireUserGesture,
        ..options(&LIVE)
    })
    .unwrap();
    let resumed = context.resume();
    context.stop();
    assert_eq!(
        resumed.wait(),
        Err(rivulet_core::SessionError::Closed {
            target: SessionState::Running
        })
    );
}

// ============================================================================
// 8. Visibility and muting
// ============================================================================

#[test]
fn hidden_while_silent_interrupts_until_visible() {
    static LIVE: LiveSessions = LiveSessions::new();
    let device = Arc::new(CountingDevice::default());
    let context = AudioContext::with_device(options(&LIVE), device.clone(), Arc::new(AllowAll)).unwrap();
    assert_eq!(context.resume().wait(), Ok(()));
    assert!(!context.graph().is_playing_audio());

    context.visibility_changed(true);
    assert_eq!(context.state(), SessionState::Interrupted);
    assert_eq!(device.suspends.load(Ordering::SeqCst), 1);

    context.visibility_changed(true);
    assert_eq!(device.suspends.load(Ordering::SeqCst), 1);

    context.visibility_changed(false);
    assert_eq!(context.state(), SessionState::Running);
    assert_eq!(device.resumes.load(Ordering::SeqCst), 2);
}

#[test]
fn hidden_while_suspended_stays_suspended() {
    static LIVE: LiveSessions = LiveSessions::new();
    let device = Arc::new(CountingDevice::default());
    let context = AudioContext::with_device(options(&LIVE), device.clone(), Arc::new(AllowAll)).unwrap();
    context.visibility_changed(true);
    assert_eq!(context.state(), SessionState::Suspended);
    context.visibility_changed(false);
    assert_eq!(context.state(), SessionState::Suspended);
    assert_eq!(device.suspends.load(Ordering::SeqCst), 0);
}

#[test]
fn hidden_while_audible_keeps_running() {
    static LIVE: LiveSessions = LiveSessions::new();
    let device = Arc::new(CountingDevice::default());
    let context = AudioContext::with_device(options(&LIVE), device.clone(), Arc::new(AllowAll)).unwrap();
    let source = context.create_constant_source(ConstantSource::new(0.5)).unwrap();
    context.connect(&source, 0, &context.destination(), 0).unwrap();
    assert_eq!(context.resume().wait(), Ok(()));

    let out = render_on_audio_thread(context.graph());
    assert!(out.iter().all(|&s| s == 0.5));
    assert!(context.graph().is_playing_audio());

    context.visibility_changed(true);
    assert_eq!(context.state(), SessionState::Running);
    assert_eq!(device.suspends.load(Ordering::SeqCst), 0);

    // Muting makes the context inaudible, so hiding it now interrupts.
    context.set_muted(true);
    let out = render_on_audio_thread(context.graph());
    assert!(out.iter().all(|&s| s == 0.0));
    assert!(!context.graph().is_playing_audio());

    context.visibility_changed(true);
    assert_eq!(context.state(), SessionState::Interrupted);
    assert_eq!(device.suspends.load(Ordering::SeqCst), 1);
}

#[test]
fn muted_destination_outputs_silence() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::offline(options(&LIVE), 512).unwrap();
    let source = context.create_constant_source(ConstantSource::new(0.5)).unwrap();
    let meter = Meter::new();
    let readings = meter.probe();
    let meter = context.create_meter(meter).unwrap();
    context.connect(&source, 0, &context.destination(), 0).unwrap();
    context.connect(&source, 0, &meter, 0).unwrap();

    context.set_muted(true);
    assert!(context.is_muted());
    let rendered = context.start_rendering().unwrap();
    assert!(rendered.samples.iter().all(|&s| s == 0.0));
    // Upstream still renders while muted.
    assert_eq!(readings.peak(), 0.5);
    drop((source, meter));
}

// ============================================================================
// 9. Session cap
// ============================================================================

#[test]
fn live_session_cap_is_enforced() {
    static LIVE: LiveSessions = LiveSessions::new();
    let capped = || ContextOptions {
        max_live_sessions: 2,
        ..options(&LIVE)
    };

    let a = AudioContext::new(capped()).unwrap();
    let b = AudioContext::new(capped()).unwrap();
    let _ga = a.create_gain(Gain::new(1.0)).unwrap();
    let _gb = b.create_gain(Gain::new(1.0)).unwrap();
    assert_eq!(LIVE.count(), 2);

    assert!(matches!(
        AudioContext::new(capped()),
        Err(ContextError::TooManySessions { limit: 2 })
    ));

    // Offline contexts are not counted.
    assert!(AudioContext::offline(capped(), 128).is_ok());

    a.stop();
    assert_eq!(LIVE.count(), 1);
    assert!(AudioContext::new(capped()).is_ok());
}

// ============================================================================
// 10. Teardown
// ============================================================================

#[test]
fn teardown_with_pending_finished_list() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::new(options(&LIVE)).unwrap();
    let graph = Arc::clone(context.graph());
    graph.lock().register_audio_thread();

    let source = context
        .create_constant_source(ConstantSource::new(1.0).with_duration(2 * QUANTUM as u64))
        .unwrap();
    context.connect(&source, 0, &context.destination(), 0).unwrap();
    drop(source);
    render(&graph);
    assert_eq!(graph.registry().finished_count(), 0);

    // The source finishes in a quantum whose maintenance cannot run.
    let (release, holder) = hold_lock(&graph);
    let out = render(&graph);
    release.send(()).unwrap();
    holder.join().unwrap();
    assert!(out.iter().all(|&s| s == 1.0));
    assert_eq!(graph.registry().finished_count(), 1);
    assert_eq!(graph.registry().referenced_count(), 1);

    context.stop();
    let registry = graph.registry();
    assert!(registry.is_idle());
    assert_eq!(registry.referenced_count(), 0);
    assert!(graph.dirty().is_empty());
    assert_eq!(graph.pull().live_len(), 0);
    assert_eq!(graph.stats().live_nodes(), 1);
}

#[test]
fn stop_is_idempotent_and_releases_live_slot() {
    static LIVE: LiveSessions = LiveSessions::new();
    let context = AudioContext::new(options(&LIVE)).unwrap();
    let _source = context.create_constant_source(ConstantSource::new(0.5)).unwrap();
    assert_eq!(LIVE.count(), 1);

    context.stop();
    context.stop();
    assert_eq!(LIVE.count(), 0);
    assert_eq!(context.state(), SessionState::Closed);
    assert_eq!(context.graph().registry().referenced_count(), 0);
}
