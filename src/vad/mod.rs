//! Barge-in detection using energy-based analysis.
//!
//! While the assistant is speaking, per-frame RMS levels from the
//! microphone are fed to a [`BargeInDetector`]. After a grace period that
//! covers the playback ramp-up, a run of consecutive loud frames means the
//! user is talking over the assistant.

use crate::config::BargeInConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One-shot detector for user speech during playback.
///
/// Monitoring is bracketed by [`start_monitoring`](Self::start_monitoring) and
/// [`stop_monitoring`](Self::stop_monitoring). After firing once the detector
/// stops itself and must be restarted for the next speaking phase.
#[derive(Debug)]
pub struct BargeInDetector {
    threshold: f32,
    required_frames: u32,
    grace_period: Duration,
    monitoring_since: Option<Instant>,
    consecutive_above: u32,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            threshold: config.threshold,
            required_frames: config.required_frames.max(1),
            grace_period: Duration::from_millis(config.grace_period_ms),
            monitoring_since: None,
            consecutive_above: 0,
        }
    }

    /// Open a detection window starting now.
    pub fn start_monitoring(&mut self) {
        self.start_monitoring_at(Instant::now());
    }

    /// Open a detection window starting at `now`.
    pub fn start_monitoring_at(&mut self, now: Instant) {
        self.monitoring_since = Some(now);
        self.consecutive_above = 0;
        debug!(grace_ms = self.grace_period.as_millis() as u64, "barge-in monitoring started");
    }

    /// Close the detection window. Safe to call when not monitoring.
    pub fn stop_monitoring(&mut self) {
        self.monitoring_since = None;
        self.consecutive_above = 0;
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_since.is_some()
    }

    /// Feed one frame's RMS level. Returns `true` exactly once per window,
    /// when speech is confirmed.
    pub fn feed_level(&mut self, rms: f32) -> bool {
        self.feed_level_at(rms, Instant::now())
    }

    /// Feed one frame's RMS level observed at `now`.
    pub fn feed_level_at(&mut self, rms: f32, now: Instant) -> bool {
        let Some(since) = self.monitoring_since else {
            return false;
        };
        if now.saturating_duration_since(since) < self.grace_period {
            return false;
        }

        if rms > self.threshold {
            self.consecutive_above += 1;
        } else {
            self.consecutive_above = 0;
        }

        if self.consecutive_above >= self.required_frames {
            info!(rms, frames = self.consecutive_above, "barge-in detected");
            self.stop_monitoring();
            return true;
        }
        false
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
