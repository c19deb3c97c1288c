//! Streaming speech recognition.
//!
//! A [`RecognitionEngine`] turns microphone frames into a stream of partial
//! hypotheses. [`SpeechRecognizer`] wraps an engine with the end-of-turn
//! policy: every partial re-arms a silence timer, and when the timer runs
//! out (or the engine delivers a final result) the transcript is finalized
//! exactly once.

pub mod parakeet;

pub use parakeet::ParakeetEngine;

use crate::error::{Result, TalkError};
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hypothesis produced by a recognition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionUpdate {
    /// Best transcript of everything heard so far (replaces earlier partials).
    Partial(String),
    /// The engine considers the utterance complete.
    Final(String),
}

/// Backend that transcribes a live audio stream.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Consume `frames` until the channel closes or `cancel` fires, sending
    /// hypotheses to `updates`.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Recognition`] if the engine is unavailable or
    /// fails mid-stream.
    async fn recognize(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
        updates: mpsc::Sender<RecognitionUpdate>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// What the recognizer reports to its owner.
#[derive(Debug)]
pub enum RecognizerEvent {
    Partial(String),
    /// Emitted at most once per session.
    Finalized(String),
    Failed(TalkError),
}

/// Once-only guard for transcript finalization.
#[derive(Debug, Default)]
pub struct TranscriptFinalizer {
    done: AtomicBool,
}

impl TranscriptFinalizer {
    /// Returns `Some(text)` the first time it is called and `None` afterwards.
    pub fn finalize(&self, text: String) -> Option<String> {
        if self.done.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(text)
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Silence-timed wrapper around a [`RecognitionEngine`].
#[derive(Clone)]
pub struct SpeechRecognizer {
    engine: Arc<dyn RecognitionEngine>,
    silence_timeout: Duration,
}

impl SpeechRecognizer {
    pub fn new(engine: Arc<dyn RecognitionEngine>, silence_timeout: Duration) -> Self {
        Self {
            engine,
            silence_timeout,
        }
    }

    /// Begin recognizing `frames`, reporting to `events`.
    ///
    /// The session ends after finalization, failure, or [`RecognitionSession::stop`].
    pub fn start(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<RecognizerEvent>,
    ) -> RecognitionSession {
        let cancel = CancellationToken::new();
        let finalizer = Arc::new(TranscriptFinalizer::default());
        let task = tokio::spawn(run_session(
            Arc::clone(&self.engine),
            self.silence_timeout,
            frames,
            events,
            cancel.clone(),
            Arc::clone(&finalizer),
        ));
        RecognitionSession {
            cancel,
            finalizer,
            task,
        }
    }
}

/// A running recognition. Cancelled when stopped or dropped.
pub struct RecognitionSession {
    cancel: CancellationToken,
    finalizer: Arc<TranscriptFinalizer>,
    task: JoinHandle<()>,
}

impl RecognitionSession {
    /// Stop recognizing without finalizing. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finalized(&self) -> bool {
        self.finalizer.is_finalized()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(
    engine: Arc<dyn RecognitionEngine>,
    silence_timeout: Duration,
    frames: mpsc::Receiver<AudioFrame>,
    events: mpsc::Sender<RecognizerEvent>,
    cancel: CancellationToken,
    finalizer: Arc<TranscriptFinalizer>,
) {
    let (updates_tx, mut updates_rx) = mpsc::channel::<RecognitionUpdate>(32);
    let engine_cancel = cancel.child_token();
    let engine_task = {
        let engine_cancel = engine_cancel.clone();
        tokio::spawn(async move { engine.recognize(frames, updates_tx, engine_cancel).await })
    };

    let mut latest = String::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let silence_at = deadline;
        let silence = async move {
            match silence_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("recognition session cancelled");
                break;
            }
            update = updates_rx.recv() => match update {
                Some(RecognitionUpdate::Partial(text)) => {
                    deadline = Some(Instant::now() + silence_timeout);
                    if text != latest {
                        latest = text.clone();
                        let _ = events.send(RecognizerEvent::Partial(text)).await;
                    }
                }
                Some(RecognitionUpdate::Final(text)) => {
                    emit_final(&finalizer, &events, text).await;
                    break;
                }
                None => {
                    match engine_task.await {
                        Ok(Ok(())) => emit_final(&finalizer, &events, latest).await,
                        Ok(Err(e)) => {
                            warn!("recognition failed: {e}");
                            let _ = events.send(RecognizerEvent::Failed(e)).await;
                        }
                        Err(join) => {
                            let _ = events
                                .send(RecognizerEvent::Failed(TalkError::Recognition(format!(
                                    "recognition task aborted: {join}"
                                ))))
                                .await;
                        }
                    }
                    return;
                }
            },
            () = silence => {
                debug!(timeout_ms = silence_timeout.as_millis() as u64, "silence timeout");
                emit_final(&finalizer, &events, latest).await;
                break;
            }
        }
    }
    engine_cancel.cancel();
}

async fn emit_final(
    finalizer: &TranscriptFinalizer,
    events: &mpsc::Sender<RecognizerEvent>,
    text: String,
) {
    if let Some(text) = finalizer.finalize(text.trim().to_owned()) {
        info!(chars = text.len(), "transcript finalized");
        let _ = events.send(RecognizerEvent::Finalized(text)).await;
    }
}
