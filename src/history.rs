//! Conversation history.
//!
//! The orchestrator keeps the recent turns in a [`ConversationHistory`]
//! ring buffer and hands a snapshot to a [`HistoryStore`] after every new
//! message. [`JsonFileHistoryStore`] rewrites a single JSON document
//! atomically (write to a temporary file, then rename).

use crate::error::{Result, TalkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Recent turns with fixed capacity, oldest first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    #[must_use]
    pub fn new(max_messages: usize) -> Self {
        let max_messages = max_messages.max(1);
        Self {
            messages: VecDeque::with_capacity(max_messages),
            max_messages,
        }
    }

    /// Rebuild from persisted messages, keeping only the newest that fit.
    #[must_use]
    pub fn from_messages(messages: Vec<ChatMessage>, max_messages: usize) -> Self {
        let mut history = Self::new(max_messages);
        for message in messages {
            history.push(message);
        }
        history
    }

    /// Append, evicting the oldest if at capacity.
    pub fn push(&mut self, message: ChatMessage) {
        while self.messages.len() >= self.max_messages {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Persistence for conversation history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the saved messages, oldest first. A missing store is empty.
    async fn load(&self) -> Result<Vec<ChatMessage>>;

    /// Replace the saved messages with `messages`.
    async fn save(&self, messages: Vec<ChatMessage>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    version: u32,
    messages: Vec<ChatMessage>,
}

/// JSON document on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryStore {
    path: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn load(&self) -> Result<Vec<ChatMessage>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TalkError::History(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        let doc: HistoryDocument = serde_json::from_str(&content).map_err(|e| {
            TalkError::History(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        debug!(messages = doc.messages.len(), "history loaded");
        Ok(doc.messages)
    }

    async fn save(&self, messages: Vec<ChatMessage>) -> Result<()> {
        let json = serde_json::to_string_pretty(&HistoryDocument {
            version: 1,
            messages,
        })
        .map_err(|e| TalkError::History(format!("cannot serialize history: {e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| TalkError::History(format!("history write task failed: {e}")))?
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TalkError::History(format!("create history dir: {e}")))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)
        .map_err(|e| TalkError::History(format!("write history tmp: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| TalkError::History(format!("rename history: {e}")))?;
    Ok(())
}
