//! Session state machine.
//!
//! A session moves between [`SessionState::Suspended`], `Running` and
//! `Interrupted` until it lands on `Closed`, which is terminal. Requests are
//! asynchronous: the caller's completion is queued for the *target* state
//! before the device transition starts, and resolved when
//! [`Session::set_state`] actually enters that state.
//!
//! Every request first consults the permission gate (the user-gesture
//! restriction plus an external [`PermissionGate`]). A denied request is
//! held as the pending transition until [`Session::user_gesture`] or
//! [`Session::permission_granted`] re-evaluates it. A later request
//! replaces an earlier pending one.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::SessionError;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not rendering. The initial state.
    Suspended,
    /// Rendering.
    Running,
    /// Stopped by the platform, for example by an incoming call.
    Interrupted,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Lowercase name, as shown in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the session renders to a device or into memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Driven by an audio device.
    Realtime,
    /// Rendered as fast as possible on the calling thread.
    Offline,
}

/// A requested device-level transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Stop rendering.
    Suspend,
    /// Start rendering.
    Resume,
    /// Stop rendering for good.
    Close,
}

impl Transition {
    fn target(self) -> SessionState {
        match self {
            Self::Suspend => SessionState::Suspended,
            Self::Resume => SessionState::Running,
            Self::Close => SessionState::Closed,
        }
    }
}

/// A state change delivered to subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    /// State before the change.
    pub from: SessionState,
    /// State after the change.
    pub to: SessionState,
}

/// Completion callback for a session request or a device transition.
pub type StateCallback = Box<dyn FnOnce(Result<(), SessionError>) + Send>;

/// Decides whether the session may produce audio right now.
pub trait PermissionGate: Send + Sync {
    /// Returns true if a transition may proceed.
    fn may_produce_audio(&self) -> bool;
}

/// A gate that always permits.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn may_produce_audio(&self) -> bool {
        true
    }
}

/// The device-level session this state machine wraps.
///
/// Each `begin_*` call must eventually invoke `done` exactly once, from any
/// thread, possibly before returning.
pub trait DeviceSession: Send + Sync {
    /// Starts or restarts rendering.
    fn begin_resume(&self, done: StateCallback);
    /// Pauses rendering.
    fn begin_suspend(&self, done: StateCallback);
    /// Stops rendering for good.
    fn begin_close(&self, done: StateCallback);
    /// Stops rendering synchronously. After return the render target is
    /// never invoked again.
    fn stop(&self);
}

/// A device that completes every transition immediately and never renders.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDevice;

impl DeviceSession for NullDevice {
    fn begin_resume(&self, done: StateCallback) {
        done(Ok(()));
    }

    fn begin_suspend(&self, done: StateCallback) {
        done(Ok(()));
    }

    fn begin_close(&self, done: StateCallback) {
        done(Ok(()));
    }

    fn stop(&self) {}
}

/// Receiving end of a [`StateCallback`].
///
/// Lets control code wait for a request instead of passing a closure.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<Result<(), SessionError>>,
}

impl Completion {
    /// Creates a linked callback and completion.
    pub fn channel() -> (StateCallback, Completion) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback: StateCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, Completion { rx })
    }

    /// Returns the result if the request already completed.
    pub fn try_result(&self) -> Option<Result<(), SessionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SessionError::Abandoned)),
        }
    }

    /// Blocks until the request completes.
    pub fn wait(self) -> Result<(), SessionError> {
        self.rx.recv().unwrap_or(Err(SessionError::Abandoned))
    }

    /// Blocks for at most `timeout`. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), SessionError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SessionError::Abandoned)),
        }
    }
}

type ClosedHook = Box<dyn FnOnce() + Send>;

struct SessionInner {
    state: SessionState,
    /// Completions in insertion order, each keyed by its target state.
    reactions: Vec<(SessionState, StateCallback)>,
    pending: Option<Transition>,
    user_gesture_required: bool,
    subscribers: Vec<Sender<StateChange>>,
    closed_hook: Option<ClosedHook>,
}

struct SessionShared {
    kind: SessionKind,
    gate: Arc<dyn PermissionGate>,
    device: Arc<dyn DeviceSession>,
    inner: Mutex<SessionInner>,
}

/// Handle to a session state machine. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .field("pending", &self.pending_transition())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a suspended session.
    ///
    /// With `user_gesture_required` set, no transition is permitted until
    /// [`user_gesture`](Self::user_gesture) is called.
    pub fn new(
        kind: SessionKind,
        gate: Arc<dyn PermissionGate>,
        device: Arc<dyn DeviceSession>,
        user_gesture_required: bool,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                kind,
                gate,
                device,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Suspended,
                    reactions: Vec::new(),
                    pending: None,
                    user_gesture_required,
                    subscribers: Vec::new(),
                    closed_hook: None,
                }),
            }),
        }
    }

    /// Returns the session kind.
    pub fn kind(&self) -> SessionKind {
        self.shared.kind
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Returns the transition waiting for permission, if any.
    pub fn pending_transition(&self) -> Option<Transition> {
        self.shared.inner.lock().pending
    }

    /// Number of completions still waiting for their target state.
    pub fn pending_reactions(&self) -> usize {
        self.shared.inner.lock().reactions.len()
    }

    /// Returns true while the user-gesture restriction is in place.
    pub fn user_gesture_required(&self) -> bool {
        self.shared.inner.lock().user_gesture_required
    }

    /// Returns a receiver for every future state change.
    pub fn subscribe(&self) -> Receiver<StateChange> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared.inner.lock().subscribers.push(tx);
        rx
    }

    /// Installs a hook run once, before completions resolve, when the
    /// session enters `Closed`.
    pub fn on_closed(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.inner.lock().closed_hook = Some(Box::new(hook));
    }

    /// Moves to `state`.
    ///
    /// A no-op when already in `state` or when closed. Otherwise notifies
    /// subscribers and resolves, in insertion order, every completion queued
    /// for `state`. Entering `Closed` rejects the completions still waiting
    /// for other states. Returns true if the state changed.
    pub fn set_state(&self, state: SessionState) -> bool {
        self.shared.set_state(state)
    }

    /// Requests a move to `Suspended`.
    pub fn suspend(&self, done: StateCallback) {
        if self.shared.kind == SessionKind::Offline {
            done(Err(SessionError::InvalidState("cannot suspend an offline session")));
            return;
        }
        let queued = self.shared.queue_reaction(SessionState::Suspended, done, |state| match state {
            SessionState::Suspended => Some(Ok(())),
            SessionState::Closed | SessionState::Interrupted => Some(Err(SessionError::InvalidState(
                "cannot suspend a closed or interrupted session",
            ))),
            SessionState::Running => None,
        });
        if queued {
            self.shared.request(Transition::Suspend);
        }
    }

    /// Requests a move to `Running`.
    pub fn resume(&self, done: StateCallback) {
        if self.shared.kind == SessionKind::Offline {
            done(Err(SessionError::InvalidState("cannot resume an offline session")));
            return;
        }
        let queued = self.shared.queue_reaction(SessionState::Running, done, |state| match state {
            SessionState::Running => Some(Ok(())),
            SessionState::Closed => Some(Err(SessionError::InvalidState("cannot resume a closed session"))),
            SessionState::Suspended | SessionState::Interrupted => None,
        });
        if queued {
            self.shared.request(Transition::Resume);
        }
    }

    /// Requests a move to `Closed`.
    pub fn close(&self, done: StateCallback) {
        if self.shared.kind == SessionKind::Offline {
            done(Err(SessionError::InvalidState("cannot close an offline session")));
            return;
        }
        let queued = self
            .shared
            .queue_reaction(SessionState::Closed, done, |state| (state == SessionState::Closed).then_some(Ok(())));
        if queued {
            self.shared.request(Transition::Close);
        }
    }

    /// Starts rendering if permitted; otherwise leaves a pending resume.
    ///
    /// Used when a realtime context first initializes.
    pub fn start_rendering(&self) {
        if self.shared.kind == SessionKind::Offline || self.state() != SessionState::Suspended {
            return;
        }
        self.shared.request(Transition::Resume);
    }

    /// Called when a scheduled source starts. While the user-gesture
    /// restriction is set and nothing else is pending, queues a resume so
    /// the next gesture starts rendering.
    pub fn node_will_begin_playback(&self) {
        let retry = {
            let inner = self.shared.inner.lock();
            inner.user_gesture_required
                && inner.pending.is_none()
                && inner.state == SessionState::Suspended
        };
        if retry {
            self.start_rendering();
        }
    }

    /// Records a user gesture: lifts the gesture restriction and
    /// re-evaluates the pending transition.
    pub fn user_gesture(&self) {
        self.shared.inner.lock().user_gesture_required = false;
        self.shared.reevaluate_pending();
    }

    /// Re-evaluates the pending transition after the external gate changed.
    pub fn permission_granted(&self) {
        self.shared.reevaluate_pending();
    }

    /// Suspends the device on behalf of the platform and lands on
    /// `Interrupted`.
    pub fn begin_interruption(&self) {
        if self.shared.kind == SessionKind::Offline {
            return;
        }
        match self.state() {
            SessionState::Closed | SessionState::Interrupted => {}
            SessionState::Suspended => {
                self.shared.set_state(SessionState::Interrupted);
            }
            SessionState::Running => {
                let shared = Arc::clone(&self.shared);
                self.shared.device.begin_suspend(Box::new(move |result| {
                    shared.complete(SessionState::Interrupted, result);
                }));
            }
        }
    }

    /// Ends a platform interruption. Resumes when `may_resume` is true and
    /// the gate permits, otherwise settles on `Suspended`.
    pub fn end_interruption(&self, may_resume: bool) {
        if self.state() != SessionState::Interrupted {
            return;
        }
        if may_resume {
            self.shared.request(Transition::Resume);
        } else {
            self.shared.set_state(SessionState::Suspended);
        }
    }
}

impl SessionShared {
    fn permits(&self) -> bool {
        let gesture_required = self.inner.lock().user_gesture_required;
        !gesture_required && self.gate.may_produce_audio()
    }

    /// Queues `done` for `target` unless `settle` resolves it from the
    /// current state. The state is read and the reaction queued under one
    /// lock, so a concurrent [`set_state`](Self::set_state) either sees the
    /// reaction or happened before the check. Returns true if queued.
    fn queue_reaction(
        &self,
        target: SessionState,
        done: StateCallback,
        settle: impl FnOnce(SessionState) -> Option<Result<(), SessionError>>,
    ) -> bool {
        let settled = {
            let mut inner = self.inner.lock();
            match settle(inner.state) {
                Some(result) => Some((done, result)),
                None => {
                    inner.reactions.push((target, done));
                    None
                }
            }
        };
        match settled {
            Some((done, result)) => {
                done(result);
                false
            }
            None => true,
        }
    }

    fn request(self: &Arc<Self>, transition: Transition) {
        if self.permits() {
            self.inner.lock().pending = None;
            self.begin(transition);
        } else {
            self.inner.lock().pending = Some(transition);
            #[cfg(feature = "tracing")]
            tracing::debug!("session: {transition:?} deferred until permitted");
        }
    }

    fn reevaluate_pending(self: &Arc<Self>) {
        if self.inner.lock().pending.is_none() || !self.permits() {
            return;
        }
        let Some(transition) = self.inner.lock().pending.take() else {
            return;
        };
        self.begin(transition);
    }

    fn begin(self: &Arc<Self>, transition: Transition) {
        let shared = Arc::clone(self);
        let target = transition.target();
        let done: StateCallback = Box::new(move |result| shared.complete(target, result));
        match transition {
            Transition::Resume => self.device.begin_resume(done),
            Transition::Suspend => self.device.begin_suspend(done),
            Transition::Close => self.device.begin_close(done),
        }
    }

    /// Lands a device transition on `target`, or rejects the completions
    /// waiting for it when the device failed.
    fn complete(&self, target: SessionState, result: Result<(), SessionError>) {
        match result {
            Ok(()) => {
                self.set_state(target);
            }
            Err(error) => {
                let rejected = {
                    let mut inner = self.inner.lock();
                    take_reactions(&mut inner.reactions, |state| state == target)
                };
                #[cfg(feature = "tracing")]
                tracing::warn!("session: device failed to reach {target}: {error}");
                for (_, done) in rejected {
                    done(Err(error.clone()));
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) -> bool {
        let (from, resolved, rejected, hook) = {
            let mut inner = self.inner.lock();
            if inner.state == state || inner.state == SessionState::Closed {
                return false;
            }
            let from = inner.state;
            inner.state = state;

            let resolved = take_reactions(&mut inner.reactions, |target| target == state);
            let (rejected, hook) = if state == SessionState::Closed {
                inner.pending = None;
                (std::mem::take(&mut inner.reactions), inner.closed_hook.take())
            } else {
                (Vec::new(), None)
            };

            let change = StateChange { from, to: state };
            inner.subscribers.retain(|tx| tx.send(change).is_ok());
            (from, resolved, rejected, hook)
        };

        #[cfg(feature = "tracing")]
        tracing::info!("session: {from} -> {state}");
        #[cfg(not(feature = "tracing"))]
        let _ = from;

        if let Some(hook) = hook {
            hook();
        }
        for (_, done) in resolved {
            done(Ok(()));
        }
        for (target, done) in rejected {
            done(Err(SessionError::Closed { target }));
        }
        true
    }
}

/// Removes and returns, in order, the reactions whose target matches.
fn take_reactions(
    reactions: &mut Vec<(SessionState, StateCallback)>,
    matches: impl Fn(SessionState) -> bool,
) -> Vec<(SessionState, StateCallback)> {
    let (taken, kept) = std::mem::take(reactions)
        .into_iter()
        .partition(|(target, _)| matches(*target));
    *reactions = kept;
    taken
}
