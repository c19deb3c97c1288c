//! ClawK Talk: hands-free voice conversation with a ClawK gateway assistant.
//!
//! A single conversation cycles through four states:
//! Idle → Listening → Thinking → Speaking → Idle
//!
//! # Architecture
//!
//! Independent components connected by async channels, driven by one
//! orchestrator task:
//! - **Audio capture**: Microphone frames and input levels via `cpal`
//! - **STT**: On-device transcription with NVIDIA Parakeet, finalized after silence
//! - **Gateway**: Persistent WebSocket session to the assistant, with
//!   reconnect backoff and a circuit breaker
//! - **TTS**: Sentence-by-sentence streaming synthesis, incremental MP3
//!   decoding, and an offline system-voice fallback
//! - **Audio playback**: Bounded buffer pool feeding `cpal`
//! - **VAD**: Energy-based barge-in detection while the assistant speaks

pub mod audio;
pub mod config;
pub mod cues;
pub mod error;
pub mod gateway;
pub mod history;
pub mod models;
pub mod pipeline;
pub mod runtime;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::TalkConfig;
pub use error::{Result, TalkError};
pub use pipeline::coordinator::{Collaborators, ConversationOrchestrator, TalkHandle};
pub use runtime::RuntimeEvent;
