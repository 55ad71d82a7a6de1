//! Control-thread task queue.
//!
//! Work the audio thread discovers but cannot finish itself is posted here
//! with `try_send`, which never blocks. The control thread drains the queue
//! with [`AudioContext::pump_control_tasks`](crate::AudioContext::pump_control_tasks).

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Deferred work for the control thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlTask {
    /// Physically destroy the nodes in the ready-to-delete queue.
    DeleteReadyNodes,
    /// The destination started or stopped producing audible output.
    PlayingAudioChanged(bool),
}

/// Bounded single-consumer queue of [`ControlTask`]s.
pub(crate) struct ControlQueue {
    tx: Sender<ControlTask>,
    rx: Receiver<ControlTask>,
}

impl ControlQueue {
    /// Creates a queue holding at most `depth` tasks.
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        Self { tx, rx }
    }

    /// Posts a task without blocking. Returns false if the queue is full.
    pub fn post(&self, task: ControlTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Pops the next queued task, if any.
    pub fn next(&self) -> Option<ControlTask> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}
