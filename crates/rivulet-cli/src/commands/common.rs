//! Helpers shared by the commands.

use std::path::Path;

use anyhow::Context;
use rivulet_config::{EngineConfig, paths};
use rivulet_core::EngineStats;
use serde::Serialize;

/// Loads the engine config the CLI should run with.
///
/// A missing file means defaults, unless the path was given explicitly.
pub fn load_engine_config(explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let path = paths::resolve_engine_config(explicit);
    let config = if explicit.is_some() {
        EngineConfig::load(&path)
    } else {
        EngineConfig::load_or_default(&path)
    }
    .with_context(|| format!("loading engine config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "engine config loaded");
    Ok(config)
}

/// Engine counters in report form.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub quanta_rendered: u64,
    pub maintenance_skipped: u64,
    pub nodes_created: u64,
    pub nodes_destroyed: u64,
    pub live_nodes: u64,
    pub deletion_flushes: u64,
    pub releases_deferred: u64,
    pub control_tasks_dropped: u64,
}

impl From<EngineStats> for StatsReport {
    fn from(stats: EngineStats) -> Self {
        Self {
            quanta_rendered: stats.quanta_rendered,
            maintenance_skipped: stats.maintenance_skipped,
            nodes_created: stats.nodes_created,
            nodes_destroyed: stats.nodes_destroyed,
            live_nodes: stats.live_nodes(),
            deletion_flushes: stats.deletion_flushes,
            releases_deferred: stats.releases_deferred,
            control_tasks_dropped: stats.control_tasks_dropped,
        }
    }
}

impl StatsReport {
    /// Prints the counters as aligned text.
    pub fn print(&self) {
        println!("  quanta rendered:      {}", self.quanta_rendered);
        println!("  maintenance skipped:  {}", self.maintenance_skipped);
        println!("  nodes created:        {}", self.nodes_created);
        println!("  nodes destroyed:      {}", self.nodes_destroyed);
        println!("  live nodes:           {}", self.live_nodes);
        println!("  deletion flushes:     {}", self.deletion_flushes);
        println!("  releases deferred:    {}", self.releases_deferred);
        println!("  control tasks lost:   {}", self.control_tasks_dropped);
    }
}

/// Prints `report` as pretty JSON.
pub fn print_json(report: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
