//! Render-quantum driver.
//!
//! Each quantum runs in three phases on the audio thread:
//!
//! 1. **pre-render**: try the graph lock; on success flush dirty junctions,
//!    then dirty outputs, then republish the pull snapshot.
//! 2. **render**: pull the destination, drive the pull snapshot, and copy
//!    the destination's output to the device buffer. Lock-free.
//! 3. **post-render**: try the lock again; on success complete deferred
//!    releases, release finished nodes, flush dirty state, republish the
//!    pull snapshot, then move marked nodes to the ready queue and post one
//!    deletion task.
//!
//! Neither maintenance phase ever blocks. When the lock is busy the phase is
//! skipped and the work waits for the next quantum.
//!
//! [`ThreadedDriver`] stands in for a device callback: it owns a named audio
//! thread that renders one quantum per period while resumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::SessionError;
use crate::graph::Graph;
use crate::session::{DeviceSession, StateCallback};

impl Graph {
    /// Pre-render maintenance. Returns false if the lock was busy.
    pub fn pre_render(&self) -> bool {
        let Some(_guard) = self.lock.try_lock_graph() else {
            self.stats.maintenance_skipped();
            return false;
        };
        self.flush_dirty_junctions();
        self.flush_dirty_outputs();
        self.rebuild_pull_snapshot();
        true
    }

    /// Post-render maintenance. Returns false if the lock was busy.
    ///
    /// Dirty state is flushed and the snapshot rebuilt before marked nodes
    /// move to the ready queue, so once a node is ready no rendering view
    /// holds it any more.
    pub fn post_render(&self) -> bool {
        let Some(_guard) = self.lock.try_lock_graph() else {
            self.stats.maintenance_skipped();
            return false;
        };
        self.flush_deferred_releases();
        self.flush_finished();
        self.flush_dirty_junctions();
        self.flush_dirty_outputs();
        self.rebuild_pull_snapshot();
        self.schedule_deletion_flush();
        true
    }

    /// Renders one quantum of `frames` frames into the interleaved `out`.
    ///
    /// Audio thread only. `frames` is clamped to the quantum size and `out`
    /// must hold at least `frames * output_channels` samples; the rest of
    /// `out` is left untouched.
    pub fn render_quantum(&self, frames: usize, out: &mut [f32]) {
        let frames = frames.min(self.config().quantum_frames);
        let channels = self.config().output_channels;
        let out_len = (frames * channels).min(out.len());
        let out = &mut out[..out_len];

        self.pre_render();

        let quantum = self.current_quantum();
        self.destination().process_if_necessary(self, quantum, frames);
        self.process_pull_snapshot(frames);
        let audible = self.destination().write_output_interleaved(out, channels);
        self.update_playing(audible);

        self.post_render();

        self.advance_clock(frames);
        self.stats.quantum_rendered();
    }
}

/// Something an audio thread can render from.
pub trait RenderTarget: Send + Sync {
    /// Called once on the audio thread before the first quantum.
    fn audio_thread_started(&self);
    /// Renders one quantum into the interleaved `out`.
    fn render(&self, frames: usize, out: &mut [f32]);
    /// Frames per quantum.
    fn quantum_frames(&self) -> usize;
    /// Interleaved channel count of `out`.
    fn output_channels(&self) -> usize;
}

impl RenderTarget for Graph {
    fn audio_thread_started(&self) {
        self.lock.register_audio_thread();
    }

    fn render(&self, frames: usize, out: &mut [f32]) {
        self.render_quantum(frames, out);
    }

    fn quantum_frames(&self) -> usize {
        self.config().quantum_frames
    }

    fn output_channels(&self) -> usize {
        self.config().output_channels
    }
}

struct DriverShared {
    period: Duration,
    target: Mutex<Option<Arc<dyn RenderTarget>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    rendering: AtomicBool,
    stopped: AtomicBool,
    quanta: AtomicU64,
}

/// A device session backed by a dedicated audio thread.
///
/// The thread is spawned on the first resume and renders one quantum per
/// `period` while resumed. Clones share the same thread.
#[derive(Clone)]
pub struct ThreadedDriver {
    shared: Arc<DriverShared>,
}

impl std::fmt::Debug for ThreadedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedDriver")
            .field("period", &self.shared.period)
            .field("rendering", &self.is_rendering())
            .field("quanta", &self.quanta_rendered())
            .finish_non_exhaustive()
    }
}

impl ThreadedDriver {
    /// Creates a driver that renders one quantum every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                period,
                target: Mutex::new(None),
                thread: Mutex::new(None),
                rendering: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                quanta: AtomicU64::new(0),
            }),
        }
    }

    /// Sets what the audio thread renders. Must be called before the first
    /// resume.
    pub fn attach(&self, target: Arc<dyn RenderTarget>) {
        *self.shared.target.lock() = Some(target);
    }

    /// Returns true while the audio thread renders.
    pub fn is_rendering(&self) -> bool {
        self.shared.rendering.load(Ordering::Acquire)
    }

    /// Quanta rendered by the audio thread.
    pub fn quanta_rendered(&self) -> u64 {
        self.shared.quanta.load(Ordering::Relaxed)
    }

    fn ensure_thread(&self) -> Result<(), SessionError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(SessionError::InvalidState("driver already stopped"));
        }
        let mut thread = self.shared.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let Some(target) = self.shared.target.lock().clone() else {
            return Err(SessionError::InvalidState("no render target attached"));
        };
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("rivulet-audio".to_string())
            .spawn(move || run_audio_thread(&shared, target.as_ref()))
            .map_err(|_| SessionError::InvalidState("failed to spawn the audio thread"))?;
        *thread = Some(handle);
        Ok(())
    }
}

fn run_audio_thread(shared: &DriverShared, target: &dyn RenderTarget) {
    target.audio_thread_started();
    let frames = target.quantum_frames();
    let mut out = vec![0.0_f32; frames * target.output_channels()];
    let mut next = Instant::now();

    #[cfg(feature = "tracing")]
    tracing::debug!("audio thread started: {frames} frames per {:?}", shared.period);

    while !shared.stopped.load(Ordering::Acquire) {
        if shared.rendering.load(Ordering::Acquire) {
            target.render(frames, &mut out);
            shared.quanta.fetch_add(1, Ordering::Relaxed);
        }
        next += shared.period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            // Overran; don't try to catch up.
            next = now;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("audio thread exiting");
}

impl DeviceSession for ThreadedDriver {
    fn begin_resume(&self, done: StateCallback) {
        match self.ensure_thread() {
            Ok(()) => {
                self.shared.rendering.store(true, Ordering::Release);
                done(Ok(()));
            }
            Err(error) => done(Err(error)),
        }
    }

    fn begin_suspend(&self, done: StateCallback) {
        self.shared.rendering.store(false, Ordering::Release);
        done(Ok(()));
    }

    fn begin_close(&self, done: StateCallback) {
        self.stop();
        done(Ok(()));
    }

    fn stop(&self) {
        self.shared.rendering.store(false, Ordering::Release);
        self.shared.stopped.store(true, Ordering::Release);
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!("audio thread panicked");
            }
        }
    }
}
