//! Shared fakes for integration tests.
//!
//! Every collaborator of the orchestrator has a scripted stand-in here so a
//! whole conversation can run without a microphone, model, gateway or
//! speakers.

use async_trait::async_trait;
use clawk_talk::audio::capture::{AudioCaptureEngine, AudioSource};
use clawk_talk::audio::playback::PlaybackSink;
use clawk_talk::audio::pool::AudioBuffer;
use clawk_talk::cues::{Cue, CueSink};
use clawk_talk::error::{Result, TalkError};
use clawk_talk::gateway::{ChatBackend, GatewayUpdate};
use clawk_talk::history::{ChatMessage, HistoryStore};
use clawk_talk::pipeline::{AudioFrame, ConversationState};
use clawk_talk::stt::{RecognitionEngine, RecognitionUpdate, SpeechRecognizer};
use clawk_talk::tts::{
    ChunkSender, DecodedChunk, OfflineSynthesizer, SpeechBackend, StreamingSynthesizer,
};
use clawk_talk::{Collaborators, ConversationOrchestrator, RuntimeEvent, TalkConfig, TalkHandle};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Microphone that produces 20 ms frames at a level the test controls.
#[derive(Default)]
pub(crate) struct FakeMicrophone {
    level: Arc<Mutex<f32>>,
    opened: Mutex<u32>,
    fail: bool,
}

impl FakeMicrophone {
    pub(crate) fn broken() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn set_level(&self, rms: f32) {
        *self.level.lock().unwrap() = rms;
    }

    pub(crate) fn opened(&self) -> u32 {
        *self.opened.lock().unwrap()
    }
}

impl AudioSource for FakeMicrophone {
    fn open(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()> {
        if self.fail {
            return Err(TalkError::Audio("no input device".into()));
        }
        *self.opened.lock().unwrap() += 1;
        let level = Arc::clone(&self.level);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let rms = *level.lock().unwrap();
                let frame = AudioFrame {
                    samples: vec![rms; 320],
                    sample_rate: 16_000,
                    rms,
                    captured_at: std::time::Instant::now(),
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

/// Recognizer that "hears" one queued utterance per session.
///
/// With nothing queued it consumes frames silently until stopped.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    utterances: Mutex<VecDeque<String>>,
}

impl ScriptedEngine {
    pub(crate) fn hearing(utterances: &[&str]) -> Self {
        Self {
            utterances: Mutex::new(utterances.iter().map(|u| (*u).to_owned()).collect()),
        }
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    async fn recognize(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
        updates: mpsc::Sender<RecognitionUpdate>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let utterance = self.utterances.lock().unwrap().pop_front();
        if let Some(text) = utterance {
            // Wait until audio is actually flowing.
            let _ = frames.recv().await;
            if let Some(first) = text.split_whitespace().next() {
                let _ = updates
                    .send(RecognitionUpdate::Partial(first.to_owned()))
                    .await;
            }
            let _ = updates.send(RecognitionUpdate::Final(text)).await;
        }
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = frames.recv() => if frame.is_none() { return Ok(()) },
            }
        }
    }
}

/// Chat backend the test drives by publishing updates.
pub(crate) struct FakeGateway {
    updates: broadcast::Sender<GatewayUpdate>,
    sent_tx: mpsc::UnboundedSender<(String, String)>,
    pub(crate) sent: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, String)>>,
    pub(crate) aborted: Mutex<Vec<String>>,
    pub(crate) shut_down: Mutex<bool>,
    reject: bool,
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            updates,
            sent_tx,
            sent: tokio::sync::Mutex::new(sent_rx),
            aborted: Mutex::new(Vec::new()),
            shut_down: Mutex::new(false),
            reject: false,
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    /// Wait for the next message the orchestrator sends. Returns `(text, run key)`.
    pub(crate) async fn next_sent(&self) -> (String, String) {
        tokio::time::timeout(WAIT, self.sent.lock().await.recv())
            .await
            .expect("no message sent")
            .expect("gateway dropped")
    }

    pub(crate) fn publish(&self, update: GatewayUpdate) {
        let _ = self.updates.send(update);
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeGateway {
    async fn send_message(&self, text: &str, run_key: &str) -> Result<()> {
        let _ = self.sent_tx.send((text.to_owned(), run_key.to_owned()));
        if self.reject {
            return Err(TalkError::Transport("gateway unavailable".into()));
        }
        Ok(())
    }

    async fn abort(&self, run_key: &str) {
        self.aborted.lock().unwrap().push(run_key.to_owned());
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayUpdate> {
        self.updates.subscribe()
    }

    async fn shutdown(&self) {
        *self.shut_down.lock().unwrap() = true;
    }
}

/// 16-bit mono WAV of a 440 Hz tone.
pub(crate) fn wav_tone(sample_rate: u32, secs: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let n = (sample_rate as f32 * secs) as usize;
        for i in 0..n {
            let t = i as f32 / sample_rate as f32;
            let s = (t * 440.0 * std::f32::consts::TAU).sin() * 0.4;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Speech server that streams a short tone per sentence.
///
/// Sentences containing "FAIL" are refused before any audio is sent.
#[derive(Default)]
pub(crate) struct ToneSpeech {
    pub(crate) spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechBackend for ToneSpeech {
    async fn synthesize(&self, text: &str, sink: &ChunkSender) -> Result<()> {
        if text.contains("FAIL") {
            return Err(TalkError::Synthesis("voice unavailable".into()));
        }
        self.spoken.lock().unwrap().push(text.to_owned());
        for chunk in wav_tone(24_000, 0.3).chunks(2_048) {
            if !sink.push(bytes::Bytes::copy_from_slice(chunk)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }

    fn close(&self) {}
}

/// Offline voice that returns a short block of silence.
#[derive(Default)]
pub(crate) struct QuietOffline {
    pub(crate) spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl OfflineSynthesizer for QuietOffline {
    async fn synthesize(&self, text: &str) -> Result<DecodedChunk> {
        self.spoken.lock().unwrap().push(text.to_owned());
        Ok(DecodedChunk {
            samples: vec![0.0; 2_400],
            sample_rate: 24_000,
        })
    }
}

/// Speakers. Plays each buffer for a few milliseconds, or holds everything
/// until flushed when `hold` is set.
#[derive(Default)]
pub(crate) struct FakeSpeakers {
    hold: bool,
    held: Mutex<Vec<AudioBuffer>>,
    pub(crate) played: Mutex<usize>,
    pub(crate) flushes: Mutex<usize>,
}

impl FakeSpeakers {
    pub(crate) fn holding() -> Self {
        Self {
            hold: true,
            ..Self::default()
        }
    }

    pub(crate) fn played(&self) -> usize {
        *self.played.lock().unwrap()
    }

    pub(crate) fn flushes(&self) -> usize {
        *self.flushes.lock().unwrap()
    }
}

impl PlaybackSink for FakeSpeakers {
    fn schedule(&self, buffer: AudioBuffer) -> Result<()> {
        *self.played.lock().unwrap() += 1;
        if self.hold {
            self.held.lock().unwrap().push(buffer);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(buffer);
            });
        }
        Ok(())
    }

    fn flush(&self) {
        *self.flushes.lock().unwrap() += 1;
        self.held.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub(crate) struct RecordingCues {
    cues: Mutex<Vec<Cue>>,
}

impl RecordingCues {
    pub(crate) fn cues(&self) -> Vec<Cue> {
        self.cues.lock().unwrap().clone()
    }
}

impl CueSink for RecordingCues {
    fn cue(&self, cue: Cue) {
        self.cues.lock().unwrap().push(cue);
    }
}

/// History kept in memory.
#[derive(Default)]
pub(crate) struct MemoryHistory {
    pub(crate) saved: Mutex<Vec<ChatMessage>>,
}

impl MemoryHistory {
    pub(crate) fn with(messages: Vec<ChatMessage>) -> Self {
        Self {
            saved: Mutex::new(messages),
        }
    }

    pub(crate) fn saved(&self) -> Vec<ChatMessage> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.saved())
    }

    async fn save(&self, messages: Vec<ChatMessage>) -> Result<()> {
        *self.saved.lock().unwrap() = messages;
        Ok(())
    }
}

/// Configuration with timings short enough for tests.
pub(crate) fn test_config() -> TalkConfig {
    let mut config = TalkConfig::default();
    config.recognizer.silence_timeout_ms = 200;
    config.barge_in.grace_period_ms = 0;
    config.barge_in.required_frames = 2;
    config.tts.min_buffer_ms = 50;
    config.conversation.thinking_timeout_secs = 1;
    config.conversation.playback_stall_timeout_secs = 1;
    config
}

/// Everything a conversation test needs to drive and inspect.
pub(crate) struct Harness {
    pub(crate) talk: TalkHandle,
    pub(crate) events: broadcast::Receiver<RuntimeEvent>,
    pub(crate) microphone: Arc<FakeMicrophone>,
    pub(crate) gateway: Arc<FakeGateway>,
    pub(crate) speech: Arc<ToneSpeech>,
    pub(crate) offline: Arc<QuietOffline>,
    pub(crate) speakers: Arc<FakeSpeakers>,
    pub(crate) cues: Arc<RecordingCues>,
    pub(crate) history: Arc<MemoryHistory>,
}

pub(crate) struct HarnessBuilder {
    pub(crate) config: TalkConfig,
    pub(crate) microphone: FakeMicrophone,
    pub(crate) engine: ScriptedEngine,
    pub(crate) gateway: FakeGateway,
    pub(crate) speakers: FakeSpeakers,
    pub(crate) history: MemoryHistory,
}

impl HarnessBuilder {
    pub(crate) fn hearing(utterances: &[&str]) -> Self {
        Self {
            config: test_config(),
            microphone: FakeMicrophone::default(),
            engine: ScriptedEngine::hearing(utterances),
            gateway: FakeGateway::new(),
            speakers: FakeSpeakers::default(),
            history: MemoryHistory::default(),
        }
    }

    pub(crate) async fn spawn(self) -> Harness {
        let microphone = Arc::new(self.microphone);
        let gateway = Arc::new(self.gateway);
        let speech = Arc::new(ToneSpeech::default());
        let offline = Arc::new(QuietOffline::default());
        let speakers = Arc::new(self.speakers);
        let cues = Arc::new(RecordingCues::default());
        let history = Arc::new(self.history);

        let synthesizer = StreamingSynthesizer::new(
            &self.config.tts,
            Arc::clone(&speech) as Arc<dyn SpeechBackend>,
            Arc::clone(&offline) as Arc<dyn OfflineSynthesizer>,
            Arc::clone(&speakers) as Arc<dyn PlaybackSink>,
        );
        let talk = ConversationOrchestrator::spawn(
            &self.config,
            Collaborators {
                capture: AudioCaptureEngine::new(Arc::clone(&microphone) as Arc<dyn AudioSource>),
                recognizer: SpeechRecognizer::new(
                    Arc::new(self.engine),
                    self.config.recognizer.silence_timeout(),
                ),
                backend: Arc::clone(&gateway) as Arc<dyn ChatBackend>,
                synthesizer,
                history: Arc::clone(&history) as Arc<dyn HistoryStore>,
                cues: Arc::clone(&cues) as Arc<dyn CueSink>,
            },
        )
        .await;
        let events = talk.subscribe();

        Harness {
            talk,
            events,
            microphone,
            gateway,
            speech,
            offline,
            speakers,
            cues,
            history,
        }
    }
}

impl Harness {
    /// Wait for the next event matching `pred`, skipping everything else.
    pub(crate) async fn expect<T>(&mut self, mut pred: impl FnMut(&RuntimeEvent) -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if let Some(found) = pred(&event) {
                return found;
            }
        }
    }

    pub(crate) async fn expect_state(&mut self, state: ConversationState) {
        self.expect(|e| matches!(e, RuntimeEvent::State(s) if *s == state).then_some(()))
            .await;
    }

    /// Collect state changes until `last` is reached.
    pub(crate) async fn states_until(&mut self, last: ConversationState) -> Vec<ConversationState> {
        let mut states = Vec::new();
        loop {
            let state = self
                .expect(|e| match e {
                    RuntimeEvent::State(s) => Some(*s),
                    _ => None,
                })
                .await;
            states.push(state);
            if state == last {
                return states;
            }
        }
    }
}
