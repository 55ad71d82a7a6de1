//! Offline render command.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use rivulet_core::processors::{ConstantSource, Gain};
use rivulet_core::{AudioContext, RenderedAudio};
use serde::Serialize;

use super::common::{StatsReport, load_engine_config, print_json};

#[derive(Args)]
pub struct RenderArgs {
    /// Number of frames to render
    #[arg(long, default_value = "48000")]
    frames: usize,

    /// Source level
    #[arg(long, default_value = "0.5")]
    level: f32,

    /// Gain applied after the source
    #[arg(long, default_value = "1.0")]
    gain: f32,

    /// Source length in frames (defaults to the whole render)
    #[arg(long)]
    source_frames: Option<u64>,

    /// Write the interleaved samples as raw little-endian f32
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct RenderReport {
    frames: usize,
    channels: usize,
    sample_rate: f32,
    peak: f32,
    rms: f32,
    audible_frames: usize,
    stats: StatsReport,
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

fn audible_frames(audio: &RenderedAudio) -> usize {
    audio
        .samples
        .chunks(audio.channels.max(1))
        .filter(|frame| frame.iter().any(|&s| s != 0.0))
        .count()
}

fn write_raw(path: &Path, samples: &[f32]) -> anyhow::Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    for sample in samples {
        writer.write_all(&sample.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn run(args: RenderArgs, config: Option<&Path>) -> anyhow::Result<()> {
    let engine = load_engine_config(config)?;
    let options = engine.context_options()?;
    let context = AudioContext::offline(options, args.frames)?;

    let mut source = ConstantSource::new(args.level);
    if let Some(frames) = args.source_frames {
        source = source.with_duration(frames);
    }
    let source = context.create_constant_source(source)?;
    let gain = context.create_gain(Gain::new(args.gain))?;
    context.connect(&source, 0, &gain, 0)?;
    context.connect(&gain, 0, &context.destination(), 0)?;

    tracing::info!(frames = args.frames, sample_rate = context.sample_rate(), "rendering offline");
    let audio = context.start_rendering()?;

    if let Some(path) = &args.output {
        write_raw(path, &audio.samples)?;
        tracing::info!(path = %path.display(), "wrote raw samples");
    }

    drop((source, gain));
    let report = RenderReport {
        frames: audio.frames(),
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        peak: audio.peak(),
        rms: rms(&audio.samples),
        audible_frames: audible_frames(&audio),
        stats: context.stats().into(),
    };

    if args.json {
        return print_json(&report);
    }

    println!("Rendered {} frames x {} channels at {} Hz", report.frames, report.channels, report.sample_rate);
    println!("  peak:                 {:.4}", report.peak);
    println!("  rms:                  {:.4}", report.rms);
    println!("  audible frames:       {}", report.audible_frames);
    report.stats.print();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_constant() {
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_audible_frames_counts_any_channel() {
        let audio = RenderedAudio {
            samples: vec![0.0, 0.0, 0.1, 0.0, 0.0, 0.2, 0.0, 0.0],
            channels: 2,
            sample_rate: 48000.0,
        };
        assert_eq!(audible_frames(&audio), 2);
    }
}
