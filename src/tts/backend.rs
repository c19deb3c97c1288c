//! Client for the streaming synthesis server.
//!
//! The server takes one sentence per text message, either raw or as
//! `{"text", "voice"}` JSON, and answers with binary compressed-audio frames
//! followed by a literal `END`. A failure arrives as a JSON `{"error"}` frame,
//! normally also followed by `END`. The connection is kept open between
//! sentences.

use super::decoder::ChunkSender;
use crate::config::TtsConfig;
use crate::error::{Result, TalkError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const END_MARKER: &[u8] = b"END";

/// How long to wait for `END` after an error frame before giving up on the connection.
const ERROR_DRAIN: Duration = Duration::from_millis(500);

/// A remote synthesizer that streams compressed audio.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Synthesize `text`, pushing audio bytes into `sink` as they arrive.
    ///
    /// Returns once the stream for this sentence is complete.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Synthesis`] for server-reported failures and
    /// timeouts, [`TalkError::Transport`] if the connection fails.
    async fn synthesize(&self, text: &str, sink: &ChunkSender) -> Result<()>;

    /// Drop any open connection.
    fn close(&self);
}

/// Response to a health check.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub connections: Option<u64>,
}

/// WebSocket client for the local synthesis server.
pub struct WebSocketSpeechBackend {
    url: String,
    voice: Option<String>,
    frame_timeout: Duration,
    idle: Mutex<Option<WsStream>>,
}

impl WebSocketSpeechBackend {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            url: config.server_url.clone(),
            voice: config.voice.clone(),
            frame_timeout: Duration::from_millis(config.frame_timeout_ms.max(1)),
            idle: Mutex::new(None),
        }
    }

    /// Ask the server for its status on a separate connection.
    ///
    /// # Errors
    ///
    /// Fails if the server is unreachable or answers with something else.
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let mut ws = self.open().await?;
        ws.send(Message::Text(json!({"command": "health"}).to_string()))
            .await
            .map_err(|e| TalkError::Transport(format!("synthesis server: {e}")))?;
        loop {
            match self.next_message(&mut ws).await? {
                Message::Text(text) => {
                    let _ = ws.close(None).await;
                    return serde_json::from_str(&text).map_err(|e| {
                        TalkError::Protocol(format!("unexpected health response: {e}"))
                    });
                }
                Message::Close(_) => {
                    return Err(TalkError::Transport(
                        "synthesis server closed during health check".into(),
                    ));
                }
                _ => {}
            }
        }
    }

    fn request_body(&self, text: &str) -> String {
        match &self.voice {
            Some(voice) => json!({"text": text, "voice": voice}).to_string(),
            None => text.to_owned(),
        }
    }

    async fn open(&self) -> Result<WsStream> {
        let (ws, _) = tokio::time::timeout(
            self.frame_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TalkError::Transport("synthesis server connect timed out".into()))?
        .map_err(|e| TalkError::Transport(format!("synthesis server: {e}")))?;
        debug!(url = %self.url, "synthesis connection opened");
        Ok(ws)
    }

    async fn next_message(&self, ws: &mut WsStream) -> Result<Message> {
        self.next_message_within(ws, self.frame_timeout).await
    }

    async fn next_message_within(&self, ws: &mut WsStream, limit: Duration) -> Result<Message> {
        match tokio::time::timeout(limit, ws.next()).await {
            Err(_) => Err(TalkError::Synthesis(format!(
                "no audio from synthesis server for {}ms",
                limit.as_millis()
            ))),
            Ok(None) => Err(TalkError::Transport("synthesis connection closed".into())),
            Ok(Some(Err(e))) => Err(TalkError::Transport(format!("synthesis stream: {e}"))),
            Ok(Some(Ok(msg))) => Ok(msg),
        }
    }

    /// Read one sentence's stream. The flag tells whether the connection
    /// ended cleanly on `END` and can take the next sentence.
    async fn stream_sentence(
        &self,
        ws: &mut WsStream,
        text: &str,
        sink: &ChunkSender,
    ) -> (Result<()>, bool) {
        if let Err(e) = ws.send(Message::Text(self.request_body(text))).await {
            return (
                Err(TalkError::Transport(format!("synthesis send: {e}"))),
                false,
            );
        }

        loop {
            let msg = match self.next_message(ws).await {
                Ok(msg) => msg,
                Err(e) => return (Err(e), false),
            };
            match msg {
                Message::Binary(data) if data == END_MARKER => return (Ok(()), true),
                Message::Text(t) if t.as_bytes() == END_MARKER => return (Ok(()), true),
                Message::Binary(data) => {
                    if !sink.push(Bytes::from(data)) {
                        // Decoder gave up; the rest of this stream is unwanted.
                        return (
                            Err(TalkError::Synthesis("decoder stopped".into())),
                            false,
                        );
                    }
                }
                Message::Text(t) => {
                    let message = error_text(&t);
                    let reusable = self.drain_to_end(ws).await;
                    return (Err(TalkError::Synthesis(message)), reusable);
                }
                Message::Close(_) => {
                    return (
                        Err(TalkError::Transport(
                            "synthesis server closed the connection".into(),
                        )),
                        false,
                    );
                }
                _ => {}
            }
        }
    }

    /// Discard frames until `END`. Returns whether it arrived.
    async fn drain_to_end(&self, ws: &mut WsStream) -> bool {
        loop {
            match self.next_message_within(ws, ERROR_DRAIN).await {
                Ok(Message::Binary(data)) if data == END_MARKER => return true,
                Ok(Message::Text(t)) if t.as_bytes() == END_MARKER => return true,
                Ok(Message::Close(_)) | Err(_) => return false,
                Ok(_) => {}
            }
        }
    }
}

fn error_text(frame: &str) -> String {
    serde_json::from_str::<serde_json::Value>(frame)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or_else(|| format!("unexpected frame from synthesis server: {frame}"))
}

#[async_trait]
impl SpeechBackend for WebSocketSpeechBackend {
    async fn synthesize(&self, text: &str, sink: &ChunkSender) -> Result<()> {
        // Taken out for the duration of the stream so that a cancelled
        // request never leaves a half-read connection behind.
        let cached = self.idle.lock().ok().and_then(|mut slot| slot.take());
        let mut ws = match cached {
            Some(ws) => ws,
            None => self.open().await?,
        };

        let (result, reusable) = self.stream_sentence(&mut ws, text, sink).await;
        if reusable {
            if let Ok(mut slot) = self.idle.lock() {
                *slot = Some(ws);
            }
        } else {
            warn!("discarding synthesis connection");
        }
        result
    }

    fn close(&self) {
        if let Ok(mut slot) = self.idle.lock() {
            slot.take();
        }
    }
}
