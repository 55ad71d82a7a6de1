//! Engine counters.
//!
//! Counters are plain relaxed atomics so the audio thread can bump them
//! without coordination. [`EngineStats`] is a point-in-time copy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared engine counters.
#[derive(Debug, Default)]
pub struct StatsCounters {
    quanta_rendered: AtomicU64,
    maintenance_skipped: AtomicU64,
    nodes_created: AtomicU64,
    nodes_destroyed: AtomicU64,
    deletion_flushes: AtomicU64,
    releases_deferred: AtomicU64,
    control_tasks_dropped: AtomicU64,
}

macro_rules! bump {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl StatsCounters {
    bump! {
        quantum_rendered => quanta_rendered,
        maintenance_skipped => maintenance_skipped,
        node_created => nodes_created,
        node_destroyed => nodes_destroyed,
        deletion_flushed => deletion_flushes,
        release_deferred => releases_deferred,
        control_task_dropped => control_tasks_dropped,
    }

    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            quanta_rendered: self.quanta_rendered.load(Ordering::Relaxed),
            maintenance_skipped: self.maintenance_skipped.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_destroyed: self.nodes_destroyed.load(Ordering::Relaxed),
            deletion_flushes: self.deletion_flushes.load(Ordering::Relaxed),
            releases_deferred: self.releases_deferred.load(Ordering::Relaxed),
            control_tasks_dropped: self.control_tasks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Render quanta completed.
    pub quanta_rendered: u64,
    /// Maintenance passes skipped because the graph lock was busy.
    pub maintenance_skipped: u64,
    /// Nodes constructed.
    pub nodes_created: u64,
    /// Nodes physically destroyed.
    pub nodes_destroyed: u64,
    /// Deletion flushes run on the control thread.
    pub deletion_flushes: u64,
    /// Releases posted for later because the lock was busy.
    pub releases_deferred: u64,
    /// Control tasks that could not be queued.
    pub control_tasks_dropped: u64,
}

impl EngineStats {
    /// Nodes constructed and not yet destroyed.
    pub fn live_nodes(&self) -> u64 {
        self.nodes_created.saturating_sub(self.nodes_destroyed)
    }
}
