//! Pre-allocated multi-channel audio buffers.
//!
//! Every junction and output owns an [`AudioBus`] sized at node creation for
//! the context's channel limit and quantum length. Rendering only changes the
//! active channel and frame counts, so the audio thread never reallocates.

/// A planar multi-channel buffer with a silence flag.
#[derive(Clone, Debug)]
pub struct AudioBus {
    samples: Vec<f32>,
    max_channels: usize,
    capacity: usize,
    channels: usize,
    frames: usize,
    silent: bool,
}

impl AudioBus {
    /// Creates a silent bus able to hold `max_channels` channels of
    /// `capacity` frames. Starts with one active channel.
    pub fn new(max_channels: usize, capacity: usize) -> Self {
        let max_channels = max_channels.max(1);
        Self {
            samples: vec![0.0; max_channels * capacity],
            max_channels,
            capacity,
            channels: 1,
            frames: capacity,
            silent: true,
        }
    }

    /// Returns the number of active channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Sets the number of active channels, clamped to `1..=max_channels`.
    ///
    /// Changing the count zeroes the bus so inactive regions stay zero.
    pub fn set_channels(&mut self, channels: usize) {
        let channels = channels.clamp(1, self.max_channels);
        if channels != self.channels {
            self.zero();
            self.channels = channels;
        }
    }

    /// Returns the largest channel count this bus can hold.
    #[inline]
    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Returns the number of active frames.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Sets the number of active frames, clamped to the capacity.
    ///
    /// Changing the length zeroes the bus so inactive regions stay zero.
    pub fn set_frames(&mut self, frames: usize) {
        let frames = frames.min(self.capacity);
        if frames != self.frames {
            self.zero();
            self.frames = frames;
        }
    }

    /// Returns the frame capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the bus is known to contain only zeros.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Returns the active frames of `channel`. Empty if out of range.
    pub fn channel(&self, channel: usize) -> &[f32] {
        if channel >= self.channels {
            return &[];
        }
        let start = channel * self.capacity;
        &self.samples[start..start + self.frames]
    }

    /// Returns the active frames of `channel` for writing and clears the
    /// silence flag. Empty if out of range.
    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        if channel >= self.channels {
            return &mut [];
        }
        self.silent = false;
        let start = channel * self.capacity;
        &mut self.samples[start..start + self.frames]
    }

    /// Zeroes every active channel and marks the bus silent.
    pub fn zero(&mut self) {
        if self.silent {
            return;
        }
        for ch in 0..self.channels {
            let start = ch * self.capacity;
            self.samples[start..start + self.frames].fill(0.0);
        }
        self.silent = true;
    }

    /// Fills every active channel with `value`.
    pub fn fill(&mut self, value: f32) {
        if value == 0.0 {
            self.silent = false;
            self.zero();
            return;
        }
        for ch in 0..self.channels {
            self.channel_mut(ch).fill(value);
        }
    }

    /// Copies `other` into this bus using [`sum_from`](Self::sum_from) mixing rules.
    pub fn copy_from(&mut self, other: &AudioBus) {
        self.silent = false;
        self.zero();
        self.sum_from(other);
    }

    /// Mixes `other` into this bus.
    ///
    /// A mono source is spread to every channel. Otherwise channels are
    /// summed pairwise and extra source channels are dropped.
    pub fn sum_from(&mut self, other: &AudioBus) {
        if other.silent {
            return;
        }
        let frames = self.frames.min(other.frames);
        for ch in 0..self.channels {
            let src_ch = if other.channels == 1 { 0 } else { ch };
            if src_ch >= other.channels {
                break;
            }
            let src = &other.channel(src_ch)[..frames];
            let dst = &mut self.channel_mut(ch)[..frames];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
    }

    /// Multiplies every active sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        if self.silent {
            return;
        }
        if gain == 0.0 {
            self.zero();
            return;
        }
        for ch in 0..self.channels {
            for sample in self.channel_mut(ch) {
                *sample *= gain;
            }
        }
    }

    /// Returns the largest absolute sample value across active channels.
    pub fn peak(&self) -> f32 {
        if self.silent {
            return 0.0;
        }
        (0..self.channels)
            .flat_map(|ch| self.channel(ch).iter())
            .fold(0.0_f32, |peak, s| peak.max(s.abs()))
    }

    /// Writes the active frames into `out` as interleaved `channels`-wide
    /// frames, spreading or dropping channels as needed. Frames past the
    /// bus length are zeroed.
    pub fn write_interleaved(&self, out: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        out.fill(0.0);
        if self.silent {
            return;
        }
        for (frame, chunk) in out.chunks_mut(channels).take(self.frames).enumerate() {
            for (ch, sample) in chunk.iter_mut().enumerate() {
                let src_ch = if self.channels == 1 { 0 } else { ch };
                if src_ch < self.channels {
                    *sample = self.channel(src_ch)[frame];
                }
            }
        }
    }
}
