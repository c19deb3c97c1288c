//! Message types passed between pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// A fixed-size frame of mono microphone audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples at `sample_rate`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// RMS energy of `samples`, computed on the capture thread.
    pub rms: f32,
    /// Timestamp when this frame was completed.
    pub captured_at: Instant,
}

/// The conversation phase. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl ConversationState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Any state may return to idle. Otherwise the cycle is
    /// idle → listening → thinking → speaking, with thinking allowed
    /// to skip speaking when there is nothing to say.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConversationState::{Idle, Listening, Speaking, Thinking};
        matches!(
            (self, next),
            (_, Idle) | (Idle, Listening) | (Listening, Thinking) | (Thinking, Speaking)
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(s)
    }
}
