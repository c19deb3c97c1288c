//! Error types for the talk pipeline.

/// Top-level error type for the voice conversation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TalkError {
    /// Socket failure, refused connection or handshake timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed envelope, unmatched response id or rejected request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Synthesis backend error or mid-utterance drop.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Recognizer unavailable, unauthorized or failed mid-stream.
    #[error("recognition error: {0}")]
    Recognition(String),

    /// No backend activity or no playback progress within the allowed window.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Model download or loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Conversation history load/save error.
    #[error("history error: {0}")]
    History(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Coarse classification used when surfacing errors to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Synthesis,
    Recognition,
    Timeout,
    Device,
    Internal,
}

impl TalkError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Synthesis(_) => ErrorKind::Synthesis,
            Self::Recognition(_) => ErrorKind::Recognition,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Audio(_) => ErrorKind::Device,
            Self::Config(_)
            | Self::Model(_)
            | Self::History(_)
            | Self::Io(_)
            | Self::Channel(_) => ErrorKind::Internal,
        }
    }

    /// Whether the reconnection policy may recover from this error on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TalkError>;
