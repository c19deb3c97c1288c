//! The conversation pipeline: state machine and the messages it passes.

pub mod coordinator;
pub mod messages;

pub use coordinator::{Collaborators, ConversationOrchestrator, TalkHandle};
pub use messages::{AudioFrame, ConversationState};
