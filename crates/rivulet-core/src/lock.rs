//! Graph lock with owner tracking and a non-blocking acquisition mode.
//!
//! [`GraphLock`] serializes every mutation of shared graph state (registry,
//! dirty sets, pull registry). The control thread acquires it with
//! [`acquire`](GraphLock::acquire), which blocks. The audio thread acquires it
//! once per render quantum with [`try_acquire`](GraphLock::try_acquire), which
//! never waits: when the control thread holds the lock the audio thread skips
//! its maintenance pass and renders with stale but consistent state.
//!
//! The recorded owner makes both forms reentrant. A thread that already owns
//! the lock gets [`LockOutcome::AcquiredReentrant`] and must not release it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Token value meaning "no thread".
const NO_THREAD: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique identity of an OS thread.
///
/// Tokens are assigned lazily on first use and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadToken(u64);

impl ThreadToken {
    /// Returns the token of the calling thread.
    #[inline]
    pub fn current() -> Self {
        Self(THREAD_TOKEN.with(|token| *token))
    }

    /// Returns the raw token value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Result of an acquisition attempt.
///
/// Callers release the lock only when [`must_release`](Self::must_release)
/// is true, so a reentrant acquisition never unlocks on behalf of an outer
/// frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and now belongs to the calling thread.
    AcquiredFresh,
    /// The calling thread already owned the lock.
    AcquiredReentrant,
    /// Another thread owns the lock. Only [`GraphLock::try_acquire`] reports this.
    NotAcquired,
}

impl LockOutcome {
    /// Returns true if the calling thread owns the lock after the attempt.
    #[inline]
    pub fn is_acquired(self) -> bool {
        !matches!(self, Self::NotAcquired)
    }

    /// Returns true if the caller is responsible for calling [`GraphLock::release`].
    #[inline]
    pub fn must_release(self) -> bool {
        matches!(self, Self::AcquiredFresh)
    }
}

/// Mutual exclusion over the audio graph with explicit owner tracking.
pub struct GraphLock {
    /// True while some thread owns the lock.
    locked: Mutex<bool>,
    released: Condvar,
    /// Mirror of the owner for lock-free reentrancy checks.
    owner: AtomicU64,
    audio_thread: AtomicU64,
    audio_thread_finished: AtomicBool,
}

impl Default for GraphLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphLock {
    /// Creates an unlocked graph lock with no registered audio thread.
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
            owner: AtomicU64::new(NO_THREAD),
            audio_thread: AtomicU64::new(NO_THREAD),
            audio_thread_finished: AtomicBool::new(false),
        }
    }

    /// Blocks until the lock is free, then records the calling thread as owner.
    ///
    /// Returns [`LockOutcome::AcquiredReentrant`] without blocking if the
    /// calling thread already owns the lock.
    pub fn acquire(&self) -> LockOutcome {
        let me = ThreadToken::current().raw();
        if self.owner.load(Ordering::Acquire) == me {
            return LockOutcome::AcquiredReentrant;
        }

        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
        self.owner.store(me, Ordering::Release);
        LockOutcome::AcquiredFresh
    }

    /// Attempts to take the lock without waiting.
    ///
    /// Reserved for the registered audio thread. Calling it from any other
    /// thread while the audio thread is live trips a debug assertion; release
    /// builds fall back to the blocking [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> LockOutcome {
        let me = ThreadToken::current().raw();
        if self.owner.load(Ordering::Acquire) == me {
            return LockOutcome::AcquiredReentrant;
        }

        let on_audio_thread = self.is_audio_thread();
        debug_assert!(
            on_audio_thread || self.is_audio_thread_finished(),
            "try_acquire called from a thread other than the audio thread"
        );
        if !on_audio_thread {
            return self.acquire();
        }

        let Some(mut locked) = self.locked.try_lock() else {
            return LockOutcome::NotAcquired;
        };
        if *locked {
            return LockOutcome::NotAcquired;
        }
        *locked = true;
        self.owner.store(me, Ordering::Release);
        LockOutcome::AcquiredFresh
    }

    /// Releases the lock. Only the current owner may call this.
    ///
    /// Ownership is cleared before the lock is handed back. A release by a
    /// thread that does not own the lock trips a debug assertion and is
    /// ignored in release builds.
    pub fn release(&self) {
        let me = ThreadToken::current().raw();
        let owned = self.owner.load(Ordering::Acquire) == me;
        debug_assert!(owned, "release called by a thread that does not own the graph lock");
        if !owned {
            return;
        }

        self.owner.store(NO_THREAD, Ordering::Release);
        // The inner mutex only guards the flag flip, so this wait is bounded.
        let mut locked = self.locked.lock();
        *locked = false;
        drop(locked);
        self.released.notify_one();
    }

    /// Acquires the lock and returns a guard that releases it on drop if the
    /// acquisition was fresh.
    pub fn lock_graph(&self) -> GraphGuard<'_> {
        GraphGuard::new(self, self.acquire())
    }

    /// Non-blocking form of [`lock_graph`](Self::lock_graph).
    ///
    /// Returns `None` if another thread owns the lock.
    pub fn try_lock_graph(&self) -> Option<GraphGuard<'_>> {
        let outcome = self.try_acquire();
        outcome
            .is_acquired()
            .then(|| GraphGuard::new(self, outcome))
    }

    /// Returns true if the calling thread currently owns the lock.
    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == ThreadToken::current().raw()
    }

    /// Returns true if some thread currently owns the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_THREAD
    }

    /// Records the calling thread as the audio thread.
    ///
    /// Called by a driver before its first render quantum. Clears the
    /// audio-thread-finished state.
    pub fn register_audio_thread(&self) {
        self.audio_thread
            .store(ThreadToken::current().raw(), Ordering::Release);
        self.audio_thread_finished.store(false, Ordering::Release);
    }

    /// Returns true if the calling thread is the registered audio thread.
    #[inline]
    pub fn is_audio_thread(&self) -> bool {
        let audio = self.audio_thread.load(Ordering::Acquire);
        audio != NO_THREAD && audio == ThreadToken::current().raw()
    }

    /// Records that the audio thread will never render again.
    pub fn mark_audio_thread_finished(&self) {
        self.audio_thread_finished.store(true, Ordering::Release);
    }

    /// Returns true once the audio thread has permanently stopped.
    #[inline]
    pub fn is_audio_thread_finished(&self) -> bool {
        self.audio_thread_finished.load(Ordering::Acquire)
    }
}

/// RAII ownership of a [`GraphLock`].
///
/// Releases the lock on drop only when the acquisition was fresh. The guard
/// is tied to the acquiring thread and cannot be sent elsewhere.
#[must_use = "the graph lock is released as soon as the guard is dropped"]
pub struct GraphGuard<'a> {
    lock: &'a GraphLock,
    outcome: LockOutcome,
    _not_send: PhantomData<*const ()>,
}

impl<'a> GraphGuard<'a> {
    fn new(lock: &'a GraphLock, outcome: LockOutcome) -> Self {
        Self {
            lock,
            outcome,
            _not_send: PhantomData,
        }
    }

    /// Returns how the lock was acquired.
    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }
}

impl Drop for GraphGuard<'_> {
    fn drop(&mut self) {
        if self.outcome.must_release() {
            self.lock.release();
        }
    }
}
