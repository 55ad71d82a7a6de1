//! Realtime simulation command.
//!
//! Runs a threaded context and plays the part of client code on the main
//! thread: it starts short one-shot sources on a fixed interval, drops their
//! handles right away, and pumps the control tasks the audio thread posts
//! back. The engine keeps each source alive until it finishes, then frees it
//! on this thread.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use rivulet_config::Autoplay;
use rivulet_core::AudioContext;
use rivulet_core::processors::{ConstantSource, Gain, Meter};
use serde::Serialize;

use super::common::{StatsReport, load_engine_config, print_json};

#[derive(Args)]
pub struct SimulateArgs {
    /// Seconds to run (0 runs until Ctrl+C)
    #[arg(long, default_value = "2.0")]
    seconds: f64,

    /// Milliseconds between source starts
    #[arg(long, default_value = "50")]
    interval_ms: u64,

    /// Length of each one-shot source, in frames
    #[arg(long, default_value = "2048")]
    burst_frames: u64,

    /// Source level
    #[arg(long, default_value = "0.25")]
    level: f32,

    /// Driver period in milliseconds (overrides the config file)
    #[arg(long)]
    period_ms: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    elapsed_secs: f64,
    period_ms: u64,
    sources_started: u64,
    peak: f32,
    playing_changes: usize,
    final_state: String,
    stats: StatsReport,
}

pub fn run(args: SimulateArgs, config: Option<&Path>) -> anyhow::Result<()> {
    if !(args.seconds.is_finite() && args.seconds >= 0.0) {
        anyhow::bail!("--seconds must be a non-negative number, got {}", args.seconds);
    }
    let engine = load_engine_config(config)?;
    let options = engine.context_options()?;
    let period = args.period_ms.map_or_else(|| engine.driver_period(), Duration::from_millis);
    let context = AudioContext::threaded(options, period)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let playing = context.subscribe_playing();
    let master = context.create_gain(Gain::new(1.0))?;
    let meter = Meter::new();
    let probe = meter.probe();
    let meter = context.create_meter(meter)?;
    context.connect(&master, 0, &context.destination(), 0)?;
    context.connect(&master, 0, &meter, 0)?;
    if engine.autoplay == Autoplay::UserGesture {
        // Running the command counts as the gesture.
        context.user_gesture();
    }
    context.resume().wait()?;

    tracing::info!(period_ms = period.as_millis() as u64, context = context.id(), "simulation running");

    let limit = (args.seconds > 0.0).then(|| Duration::from_secs_f64(args.seconds));
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let started = Instant::now();
    let mut sources_started = 0;
    let mut peak = 0.0_f32;
    let mut playing_changes = 0;

    while running.load(Ordering::SeqCst) && limit.is_none_or(|limit| started.elapsed() < limit) {
        let source = context.create_constant_source(ConstantSource::new(args.level).with_duration(args.burst_frames))?;
        context.connect(&source, 0, &master, 0)?;
        drop(source);
        sources_started += 1;

        context.pump_control_tasks();
        for is_playing in playing.try_iter() {
            playing_changes += 1;
            tracing::debug!(is_playing, "playing state changed");
        }
        peak = peak.max(probe.peak());
        std::thread::sleep(interval);
    }

    let elapsed = started.elapsed();
    context.close().wait()?;
    drop((master, meter));
    context.pump_control_tasks();
    playing_changes += playing.try_iter().count();

    let diagnostics = context.diagnostics();
    tracing::info!(
        quanta = diagnostics.stats.quanta_rendered,
        live_nodes = diagnostics.stats.live_nodes(),
        "simulation finished"
    );

    let report = SimulationReport {
        elapsed_secs: elapsed.as_secs_f64(),
        period_ms: period.as_millis() as u64,
        sources_started,
        peak,
        playing_changes,
        final_state: diagnostics.state.to_string(),
        stats: diagnostics.stats.into(),
    };

    if args.json {
        return print_json(&report);
    }

    println!(
        "Simulated {:.2}s, {} sources started, final state {}",
        report.elapsed_secs, report.sources_started, report.final_state
    );
    println!("  peak:                 {:.4}", report.peak);
    println!("  playing changes:      {}", report.playing_changes);
    report.stats.print();
    Ok(())
}
