//! Streaming speech synthesis.
//!
//! [`StreamingSynthesizer`] speaks a response sentence by sentence while the
//! response is still arriving. Sentences are queued with
//! [`enqueue`](StreamingSynthesizer::enqueue); a single consumer task sends
//! each one to the [`SpeechBackend`], decodes the audio as it streams in and
//! schedules it for playback through the bounded [`BufferPool`]. A sentence
//! the backend cannot produce is spoken by the [`OfflineSynthesizer`]
//! instead, and the queue carries on.
//!
//! Once [`finalize`](StreamingSynthesizer::finalize) has been called and the
//! queue is empty, the consumer waits for every scheduled buffer to finish
//! playing and then reports [`SynthesisEvent::PlaybackFinished`].
//!
//! Every [`stop`](StreamingSynthesizer::stop) starts a new epoch. Events carry
//! the epoch they belong to so that listeners can ignore stale ones.

pub mod backend;
pub mod decoder;
pub mod offline;
pub mod segmenter;

pub use backend::{HealthStatus, SpeechBackend, WebSocketSpeechBackend};
pub use decoder::{ChunkSender, DecodedChunk};
pub use offline::{CommandSynthesizer, OfflineSynthesizer};
pub use segmenter::{SentenceSegmenter, speakable_text};

use crate::audio::playback::PlaybackSink;
use crate::audio::pool::{BufferPool, PlaybackCounts, PlaybackTracker};
use crate::config::TtsConfig;
use crate::error::{Result, TalkError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress reported by the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// The first buffer of this epoch was handed to the output.
    FirstAudio { epoch: u64 },
    /// A sentence could not be synthesized by the backend.
    ///
    /// `recovered` is set when the offline synthesizer spoke it instead.
    SentenceFailed {
        epoch: u64,
        message: String,
        recovered: bool,
    },
    /// Everything enqueued in this epoch has finished playing.
    PlaybackFinished { epoch: u64 },
}

#[derive(Debug, Default)]
struct QueueState {
    epoch: u64,
    sentences: VecDeque<String>,
    finalized: bool,
    completed: bool,
    consumer_running: bool,
    first_audio_sent: bool,
    cancel: CancellationToken,
}

enum Next {
    Speak(String),
    Wait,
    Drain,
    Stale,
}

enum SentenceOutcome {
    Done,
    Cancelled,
    Failed { error: TalkError, scheduled: usize },
}

struct Inner {
    backend: Arc<dyn SpeechBackend>,
    offline: Arc<dyn OfflineSynthesizer>,
    sink: Arc<dyn PlaybackSink>,
    pool: BufferPool,
    min_buffer: Duration,
    max_text_len: usize,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<SynthesisEvent>,
}

/// Sentence queue with a streaming consumer. Cheap to clone.
#[derive(Clone)]
pub struct StreamingSynthesizer {
    inner: Arc<Inner>,
}

impl StreamingSynthesizer {
    pub fn new(
        config: &TtsConfig,
        backend: Arc<dyn SpeechBackend>,
        offline: Arc<dyn OfflineSynthesizer>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                backend,
                offline,
                sink,
                pool: BufferPool::new(config.playback_buffers),
                min_buffer: Duration::from_millis(u64::from(config.min_buffer_ms)),
                max_text_len: config.max_text_len,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SynthesisEvent> {
        self.inner.events.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn tracker(&self) -> &Arc<PlaybackTracker> {
        self.inner.pool.tracker()
    }

    pub fn playback_counts(&self) -> PlaybackCounts {
        self.inner.pool.tracker().counts()
    }

    /// Sentences waiting to be synthesized.
    pub fn pending(&self) -> usize {
        self.inner.lock().sentences.len()
    }

    /// Append a sentence. Returns `false` if the utterance was already
    /// finalized, in which case the sentence is dropped.
    pub fn enqueue(&self, sentence: impl Into<String>) -> bool {
        let sentence = sentence.into();
        let mut state = self.inner.lock();
        if state.finalized || state.completed {
            warn!(epoch = state.epoch, "sentence rejected after finalize");
            return false;
        }
        state.sentences.push_back(sentence);
        if !state.consumer_running {
            state.consumer_running = true;
            let epoch = state.epoch;
            let cancel = state.cancel.clone();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.consume(epoch, cancel).await });
        }
        drop(state);
        self.inner.wake.notify_one();
        true
    }

    /// No more sentences will arrive in this epoch.
    ///
    /// If nothing is queued or playing, completion is reported right away.
    pub fn finalize(&self) {
        let mut state = self.inner.lock();
        if state.finalized {
            return;
        }
        state.finalized = true;
        if !state.consumer_running && !state.completed {
            state.completed = true;
            let epoch = state.epoch;
            drop(state);
            debug!(epoch, "finalized with nothing to play");
            let _ = self.inner.events.send(SynthesisEvent::PlaybackFinished { epoch });
            return;
        }
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Halt immediately: cancel the in-flight sentence, clear the queue, cut
    /// playback and reset the counters. The synthesizer is then ready for a
    /// new utterance. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.cancel.cancel();
        let dropped = state.sentences.len();
        *state = QueueState {
            epoch: state.epoch + 1,
            ..QueueState::default()
        };
        let epoch = state.epoch;
        drop(state);

        self.inner.sink.flush();
        self.inner.pool.tracker().reset();
        self.inner.backend.close();
        debug!(epoch, dropped, "synthesizer stopped");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding the lock, so a poisoned guard still
        // holds consistent state.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: SynthesisEvent) {
        let _ = self.events.send(event);
    }

    fn next(&self, epoch: u64) -> Next {
        let mut state = self.lock();
        if state.epoch != epoch {
            return Next::Stale;
        }
        match state.sentences.pop_front() {
            Some(sentence) => Next::Speak(sentence),
            None if state.finalized => Next::Drain,
            None => Next::Wait,
        }
    }

    async fn consume(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        debug!(epoch, "synthesis consumer started");
        loop {
            match self.next(epoch) {
                Next::Stale => return,
                Next::Wait => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = self.wake.notified() => {}
                    }
                }
                Next::Speak(sentence) => {
                    if !self.speak(epoch, &cancel, sentence).await {
                        return;
                    }
                }
                Next::Drain => break,
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = self.pool.tracker().wait_drained() => {}
        }

        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.completed = true;
        state.consumer_running = false;
        drop(state);
        info!(epoch, "playback finished");
        self.emit(SynthesisEvent::PlaybackFinished { epoch });
    }

    /// Speak one sentence. Returns `false` if cancelled.
    async fn speak(&self, epoch: u64, cancel: &CancellationToken, sentence: String) -> bool {
        let text = sentence.trim();
        if text.is_empty() {
            return true;
        }

        let failure = if text.chars().count() > self.max_text_len {
            TalkError::Synthesis(format!(
                "sentence of {} chars exceeds the {} char limit",
                text.chars().count(),
                self.max_text_len
            ))
        } else {
            match self.stream_sentence(epoch, cancel, text).await {
                SentenceOutcome::Done => return true,
                SentenceOutcome::Cancelled => return false,
                SentenceOutcome::Failed { error, scheduled } => {
                    if scheduled > 0 {
                        // The streamed part is already queued; the offline
                        // voice repeats the whole sentence after it.
                        warn!(epoch, scheduled, "synthesis dropped mid-sentence: {error}");
                    }
                    error
                }
            }
        };

        warn!(epoch, "synthesis failed, using offline voice: {failure}");
        let fallback = tokio::select! {
            () = cancel.cancelled() => return false,
            res = self.offline.synthesize(text) => res,
        };
        let recovered = match fallback {
            Ok(chunk) => match self.play(epoch, cancel, chunk).await {
                Ok(true) => true,
                Ok(false) => return false,
                Err(e) => {
                    warn!(epoch, "offline audio could not be played: {e}");
                    false
                }
            },
            Err(e) => {
                warn!(epoch, "offline synthesis failed: {e}");
                false
            }
        };
        self.emit(SynthesisEvent::SentenceFailed {
            epoch,
            message: failure.to_string(),
            recovered,
        });
        true
    }

    /// Stream one sentence from the backend, scheduling audio as it decodes.
    async fn stream_sentence(
        &self,
        epoch: u64,
        cancel: &CancellationToken,
        text: &str,
    ) -> SentenceOutcome {
        let (decoded_tx, mut decoded_rx) = mpsc::channel(4);
        let (chunks, decode_task) = decoder::spawn_decoder(self.min_buffer, decoded_tx);

        let fetch = async move {
            let res = self.backend.synthesize(text, &chunks).await;
            // End of input for the decoder.
            drop(chunks);
            res
        };
        let schedule = async {
            let mut scheduled = 0usize;
            while let Some(chunk) = decoded_rx.recv().await {
                match self.play(epoch, cancel, chunk).await {
                    Ok(true) => scheduled += 1,
                    Ok(false) => break,
                    Err(e) => return (scheduled, Err(e)),
                }
            }
            (scheduled, Ok(()))
        };

        let (fetched, (scheduled, played)) = tokio::select! {
            biased;
            () = cancel.cancelled() => return SentenceOutcome::Cancelled,
            both = async { tokio::join!(fetch, schedule) } => both,
        };
        if cancel.is_cancelled() {
            return SentenceOutcome::Cancelled;
        }

        let decoded = decode_task
            .await
            .unwrap_or_else(|e| Err(TalkError::Synthesis(format!("decoder task failed: {e}"))));

        // The fetch error is the root cause when several things failed.
        let error = match (fetched, played, decoded) {
            (Ok(()), Ok(()), Ok(())) => {
                debug!(epoch, buffers = scheduled, "sentence synthesized");
                return SentenceOutcome::Done;
            }
            (Err(e), _, _) | (Ok(()), Err(e), _) | (Ok(()), Ok(()), Err(e)) => e,
        };
        SentenceOutcome::Failed { error, scheduled }
    }

    /// Wait for a pool slot and schedule `chunk`. Returns `Ok(false)` if
    /// cancelled or stale.
    async fn play(&self, epoch: u64, cancel: &CancellationToken, chunk: DecodedChunk) -> Result<bool> {
        if chunk.samples.is_empty() {
            return Ok(true);
        }
        let buffer = tokio::select! {
            () = cancel.cancelled() => return Ok(false),
            buffer = self.pool.acquire(chunk.samples, chunk.sample_rate) => buffer?,
        };

        let first = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Ok(false);
            }
            !std::mem::replace(&mut state.first_audio_sent, true)
        };
        self.sink.schedule(buffer)?;
        if first {
            debug!(epoch, "first audio scheduled");
            self.emit(SynthesisEvent::FirstAudio { epoch });
        }
        Ok(true)
    }
}
