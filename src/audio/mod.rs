//! Audio capture and playback via cpal.

pub mod capture;
pub mod playback;
pub mod pool;

pub use pool::{AudioBuffer, BufferPool, PlaybackCounts, PlaybackTracker};

/// Streaming linear-interpolation resampler.
///
/// Keeps the fractional read position and the last input sample between
/// calls so consecutive blocks join without clicks. `push` writes into a
/// caller-owned buffer and does not allocate once that buffer has capacity.
/// For speech (48kHz → 16kHz) this is sufficient quality; speech energy is
/// below 8kHz so no anti-alias filter is applied.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            step: f64::from(src_rate.max(1)) / f64::from(dst_rate.max(1)),
            pos: 0.0,
            prev: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample one input sample, calling `emit` for each output sample.
    ///
    /// `pos` is measured from `prev` (at 0.0) towards `sample` (at 1.0).
    pub fn push(&mut self, sample: f32, mut emit: impl FnMut(f32)) {
        if self.is_passthrough() {
            emit(sample);
            return;
        }
        while self.pos <= 1.0 {
            let frac = self.pos as f32;
            emit(self.prev + (sample - self.prev) * frac);
            self.pos += self.step;
        }
        self.pos -= 1.0;
        self.prev = sample;
    }
}

/// Resample a whole buffer from `src_rate` to `dst_rate`.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let mut out =
        Vec::with_capacity(samples.len() * dst_rate as usize / src_rate.max(1) as usize + 1);
    let mut resampler = LinearResampler::new(src_rate, dst_rate);
    // Prime with the first sample so output starts at samples[0], not silence.
    resampler.prev = samples[0];
    resampler.pos = 0.0;
    for &s in &samples[1..] {
        resampler.push(s, |o| out.push(o));
    }
    out
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}
