//! Audible cues on conversation state changes.
//!
//! Cues are best-effort: a [`CueSink`] must return immediately and never
//! fail the caller.

use crate::audio::playback::PlaybackSink;
use crate::audio::pool::BufferPool;
use std::sync::Arc;
use tracing::debug;

/// A state change worth signalling to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Listening,
    Thinking,
    Speaking,
    /// Speech finished and the conversation is idle again.
    Done,
}

pub trait CueSink: Send + Sync {
    fn cue(&self, cue: Cue);
}

/// Plays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCues;

impl CueSink for SilentCues {
    fn cue(&self, _cue: Cue) {}
}

const CUE_RATE: u32 = 24_000;
const CUE_AMPLITUDE: f32 = 0.15;

/// Short sine chirps through the speaker.
///
/// Uses its own one-slot pool so cues never count towards speech playback.
pub struct ToneCues {
    sink: Arc<dyn PlaybackSink>,
    pool: BufferPool,
}

impl ToneCues {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            pool: BufferPool::new(1),
        }
    }
}

impl CueSink for ToneCues {
    fn cue(&self, cue: Cue) {
        if matches!(cue, Cue::Speaking) {
            // The speech itself is the cue.
            return;
        }
        let samples = tone_for(cue);
        let sink = Arc::clone(&self.sink);
        let pool = self.pool.clone();
        // A cue still playing when the next one comes is simply skipped.
        if pool.available() == 0 {
            debug!(?cue, "cue skipped, previous still playing");
            return;
        }
        tokio::spawn(async move {
            if let Ok(buffer) = pool.acquire(samples, CUE_RATE).await
                && let Err(e) = sink.schedule(buffer)
            {
                debug!(?cue, "cue not played: {e}");
            }
        });
    }
}

/// Rising for listening, level for thinking, falling for done.
fn tone_for(cue: Cue) -> Vec<f32> {
    let (start_hz, end_hz, ms) = match cue {
        Cue::Listening => (660.0, 880.0, 120),
        Cue::Thinking => (520.0, 520.0, 60),
        Cue::Speaking => (0.0, 0.0, 0),
        Cue::Done => (880.0, 660.0, 120),
    };
    chirp(start_hz, end_hz, ms)
}

fn chirp(start_hz: f32, end_hz: f32, ms: u32) -> Vec<f32> {
    let n = (CUE_RATE * ms / 1000) as usize;
    let mut phase = 0.0f32;
    (0..n)
        .map(|i| {
            let t = i as f32 / n.max(1) as f32;
            let hz = start_hz + (end_hz - start_hz) * t;
            phase += std::f32::consts::TAU * hz / CUE_RATE as f32;
            // Short linear fade at both ends avoids clicks.
            let fade = (t * 20.0).min((1.0 - t) * 20.0).min(1.0);
            phase.sin() * CUE_AMPLITUDE * fade
        })
        .collect()
}
