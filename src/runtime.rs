//! Runtime events emitted by the conversation for UI and observability.
//!
//! A lagging subscriber loses old events rather than slowing the
//! orchestrator down.

use crate::error::ErrorKind;
use crate::gateway::ConnectionStatus;
use crate::pipeline::messages::ConversationState;

/// Events that describe what the conversation is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// The conversation entered a new state.
    State(ConversationState),
    /// Best transcript so far of what the user is saying.
    PartialTranscript(String),
    /// The user's finalized utterance, as sent to the gateway.
    UserMessage(String),
    /// Full response text so far. Replaces any earlier `ResponseText`.
    ResponseText(String),
    /// The complete response, as stored in history.
    AssistantMessage(String),
    /// Microphone level (RMS) while listening.
    InputLevel { rms: f32 },
    /// Gateway connection status changed.
    Connection(ConnectionStatus),
    /// A sentence could not be synthesized by the speech server.
    SynthesisFallback { message: String, recovered: bool },
    /// Something went wrong; the conversation has returned to idle unless
    /// the error was recovered locally.
    Error { kind: ErrorKind, message: String },
}
