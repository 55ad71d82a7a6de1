//! Built-in processors.
//!
//! Deliberately trivial: they exist to exercise the coordinator (scheduled
//! sources that finish, pass-through nodes, pull-driven meters) rather than
//! to do DSP. Parameters are shared with the control thread through
//! [`ParamHandle`], a lock-free atomic `f32`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::graph::{NodeProcessor, ProcessIo};

/// A lock-free `f32` parameter shared between threads.
///
/// The control thread calls [`set`](Self::set), the audio thread
/// [`get`](Self::get). Clones share the same value.
#[derive(Clone, Debug)]
pub struct ParamHandle(Arc<AtomicU32>);

impl ParamHandle {
    /// Creates a parameter holding `value`.
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    /// Returns the current value.
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Replaces the value.
    #[inline]
    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Scheduled source emitting a constant level.
///
/// With a duration it reports itself finished once that many frames have
/// been rendered; without one it runs until its node is released.
pub struct ConstantSource {
    level: ParamHandle,
    remaining: Option<u64>,
}

impl ConstantSource {
    /// Creates a source emitting `level` forever.
    pub fn new(level: f32) -> Self {
        Self {
            level: ParamHandle::new(level),
            remaining: None,
        }
    }

    /// Stops the source after `frames` frames.
    pub fn with_duration(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }

    /// Returns a handle to the level parameter.
    pub fn level(&self) -> ParamHandle {
        self.level.clone()
    }
}

impl NodeProcessor for ConstantSource {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let frames = io.frames();
        let active = self.remaining.map_or(frames, |r| r.min(frames as u64) as usize);
        let value = self.level.get();

        if active > 0 && value != 0.0 {
            for bus in io.outputs_mut() {
                for ch in 0..bus.channels() {
                    bus.channel_mut(ch)[..active].fill(value);
                }
            }
        }

        if let Some(remaining) = &mut self.remaining {
            *remaining -= active as u64;
            if *remaining == 0 {
                io.finish();
            }
        }
    }
}

/// Pass-through with a gain parameter.
pub struct Gain {
    gain: ParamHandle,
}

impl Gain {
    /// Creates a gain stage at `gain` (linear).
    pub fn new(gain: f32) -> Self {
        Self {
            gain: ParamHandle::new(gain),
        }
    }

    /// Returns a handle to the gain parameter.
    pub fn gain(&self) -> ParamHandle {
        self.gain.clone()
    }
}

impl NodeProcessor for Gain {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let gain = self.gain.get();
        let (inputs, outputs) = io.buses();
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        output.copy_from(input);
        output.scale(gain);
    }
}

/// Readings published by a [`Meter`].
#[derive(Debug, Default)]
struct MeterReadings {
    peak: AtomicU32,
    quanta: AtomicU64,
}

/// Control-thread view of a meter's readings. Clones share the readings.
#[derive(Clone, Debug, Default)]
pub struct MeterProbe(Arc<MeterReadings>);

impl MeterProbe {
    /// Peak of the most recently metered quantum.
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.0.peak.load(Ordering::Relaxed))
    }

    /// Number of quanta metered so far.
    pub fn quanta(&self) -> u64 {
        self.0.quanta.load(Ordering::Relaxed)
    }
}

/// Measures its input and passes it through.
///
/// A meter must keep measuring with nothing downstream, so it asks to be
/// driven by the pull registry while its output is unconnected.
#[derive(Default)]
pub struct Meter {
    probe: MeterProbe,
}

impl Meter {
    /// Creates a meter with fresh readings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a probe onto this meter's readings.
    pub fn probe(&self) -> MeterProbe {
        self.probe.clone()
    }
}

impl NodeProcessor for Meter {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let (inputs, outputs) = io.buses();
        let peak = inputs.first().map_or(0.0, |bus| bus.peak());
        if let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) {
            output.copy_from(input);
        }
        let readings = &self.probe.0;
        readings.peak.store(peak.to_bits(), Ordering::Relaxed);
        readings.quanta.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&mut self) {
        self.probe.0.peak.store(0.0_f32.to_bits(), Ordering::Relaxed);
    }

    fn pulls_when_unconnected(&self) -> bool {
        true
    }
}

/// The graph's sink. Copies input 0 to output 0, which the driver hands to
/// the device. While muted the output is silent; upstream still renders.
pub(crate) struct Destination {
    muted: Arc<AtomicBool>,
}

impl Destination {
    pub(crate) fn new(muted: Arc<AtomicBool>) -> Self {
        Self { muted }
    }
}

impl NodeProcessor for Destination {
    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let muted = self.muted.load(Ordering::Relaxed);
        let (inputs, outputs) = io.buses();
        let Some(output) = outputs.first_mut() else {
            return;
        };
        match inputs.first() {
            Some(input) if !muted => output.copy_from(input),
            _ => output.zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AudioBus;

    fn run(processor: &mut dyn NodeProcessor, inputs: &[AudioBus], outputs: &mut [AudioBus], frames: usize) -> bool {
        let mut io = ProcessIo::new(frames, 0, 48000.0, inputs, outputs);
        processor.process(&mut io);
        io.is_finished()
    }

    #[test]
    fn test_muted_destination_outputs_silence() {
        let muted = Arc::new(AtomicBool::new(false));
        let mut destination = Destination::new(Arc::clone(&muted));
        let mut input = AudioBus::new(2, 16);
        input.set_channels(2);
        input.fill(0.5);
        let mut outputs = vec![AudioBus::new(2, 16)];
        outputs[0].set_channels(2);

        run(&mut destination, std::slice::from_ref(&input), &mut outputs, 16);
        assert_eq!(outputs[0].peak(), 0.5);

        muted.store(true, Ordering::Relaxed);
        run(&mut destination, std::slice::from_ref(&input), &mut outputs, 16);
        assert_eq!(outputs[0].peak(), 0.0);
    }

    #[test]
    fn test_param_handle_shared() {
        let a = ParamHandle::new(0.5);
        let b = a.clone();
        b.set(0.25);
        assert_eq!(a.get(), 0.25);
    }

    #[test]
    fn test_constant_source_finishes_mid_quantum() {
        let mut source = ConstantSource::new(1.0).with_duration(100);
        let mut outputs = vec![AudioBus::new(1, 64)];
        outputs[0].set_frames(64);

        assert!(!run(&mut source, &[], &mut outputs, 64));
        outputs[0].zero();
        assert!(run(&mut source, &[], &mut outputs, 64));
        let channel = outputs[0].channel(0);
        assert!(channel[..36].iter().all(|&s| s == 1.0));
        assert!(channel[36..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_constant_source_without_duration_never_finishes() {
        let mut source = ConstantSource::new(0.1);
        let mut outputs = vec![AudioBus::new(1, 32)];
        for _ in 0..10 {
            assert!(!run(&mut source, &[], &mut outputs, 32));
        }
    }

    #[test]
    fn test_gain_scales_input() {
        let gain = Gain::new(0.5);
        let handle = gain.gain();
        let mut gain = gain;
        let mut input = AudioBus::new(2, 16);
        input.set_channels(2);
        input.fill(1.0);
        let mut outputs = vec![AudioBus::new(2, 16)];
        outputs[0].set_channels(2);

        run(&mut gain, std::slice::from_ref(&input), &mut outputs, 16);
        assert_eq!(outputs[0].peak(), 0.5);

        handle.set(2.0);
        run(&mut gain, std::slice::from_ref(&input), &mut outputs, 16);
        assert_eq!(outputs[0].peak(), 2.0);
    }

    #[test]
    fn test_meter_publishes_peak() {
        let mut meter = Meter::new();
        let probe = meter.probe();
        let mut input = AudioBus::new(1, 16);
        input.channel_mut(0)[3] = -0.75;
        let mut outputs = vec![AudioBus::new(1, 16)];

        run(&mut meter, std::slice::from_ref(&input), &mut outputs, 16);
        assert_eq!(probe.peak(), 0.75);
        assert_eq!(probe.quanta(), 1);
        assert!(meter.pulls_when_unconnected());

        meter.reset();
        assert_eq!(probe.peak(), 0.0);
    }
}
