//! Conversation orchestrator.
//!
//! A single task owns the conversation state and every resource tied to a
//! phase: the capture stream and recognition session while listening, the
//! active chat run while thinking, the synthesizer epoch and barge-in
//! detector while speaking. Everything else talks to it through messages:
//! commands from [`TalkHandle`], recognizer events, gateway updates,
//! synthesis events, and its own timers.
//!
//! ```text
//! idle ──start──▶ listening ──transcript──▶ thinking ──first audio──▶ speaking
//!  ▲                  │                        │                          │
//!  └──── stop / error / timeout / empty ───────┴──── drained / barge-in ──┘
//! ```
//!
//! Every failure path ends in idle. Leaving a phase releases exactly what
//! that phase acquired.

use crate::audio::capture::{AudioCaptureEngine, CaptureHandle, CaptureRoute};
use crate::audio::pool::PlaybackCounts;
use crate::config::{BargeInConfig, ConversationConfig, TalkConfig};
use crate::cues::{Cue, CueSink};
use crate::error::{Result, TalkError};
use crate::gateway::{ChatBackend, GatewayUpdate};
use crate::history::{ChatMessage, ConversationHistory, HistoryStore, Role};
use crate::pipeline::messages::ConversationState;
use crate::runtime::RuntimeEvent;
use crate::stt::{RecognitionSession, RecognizerEvent, SpeechRecognizer};
use crate::tts::{SentenceSegmenter, StreamingSynthesizer, SynthesisEvent};
use crate::vad::BargeInDetector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const FRAME_CHANNEL_DEPTH: usize = 64;
const LEVEL_CHANNEL_DEPTH: usize = 32;
const RECOGNIZER_CHANNEL_DEPTH: usize = 32;

/// The components the orchestrator drives.
pub struct Collaborators {
    pub capture: AudioCaptureEngine,
    pub recognizer: SpeechRecognizer,
    pub backend: Arc<dyn ChatBackend>,
    pub synthesizer: StreamingSynthesizer,
    pub history: Arc<dyn HistoryStore>,
    pub cues: Arc<dyn CueSink>,
}

enum Command {
    Start,
    Stop,
    History {
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    /// The gateway acknowledged (or rejected) the message for `turn`.
    Sent { turn: u64, result: Result<()> },
}

/// The exchange in progress, from sending the transcript to the end of speech.
struct Turn {
    number: u64,
    key: String,
    epoch: u64,
    segmenter: SentenceSegmenter,
    response_final: bool,
}

/// Control handle for a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct TalkHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConversationState>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl TalkHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TalkError::Channel("conversation has shut down".into()))
    }

    /// Begin listening. Ignored unless idle.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Channel`] after shutdown.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Return to idle from any state, cancelling whatever is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Channel`] after shutdown.
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Stop, close the gateway connection, flush history and end the task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Conversation turns retained in memory, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Channel`] after shutdown.
    pub async fn history(&self) -> Result<Vec<ChatMessage>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History { reply }).await?;
        rx.await
            .map_err(|_| TalkError::Channel("conversation has shut down".into()))
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}

/// Owner of the conversation state machine.
pub struct ConversationOrchestrator {
    barge_in: BargeInConfig,
    conversation: ConversationConfig,

    capture: AudioCaptureEngine,
    recognizer: SpeechRecognizer,
    backend: Arc<dyn ChatBackend>,
    synthesizer: StreamingSynthesizer,
    cues: Arc<dyn CueSink>,
    detector: BargeInDetector,

    history: ConversationHistory,
    history_tx: Option<mpsc::UnboundedSender<Vec<ChatMessage>>>,
    history_writer: Option<JoinHandle<()>>,

    state: ConversationState,
    state_tx: watch::Sender<ConversationState>,
    events: broadcast::Sender<RuntimeEvent>,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    gateway_updates: Option<broadcast::Receiver<GatewayUpdate>>,
    synthesis_events: Option<broadcast::Receiver<SynthesisEvent>>,
    playback: watch::Receiver<PlaybackCounts>,

    capture_handle: Option<CaptureHandle>,
    recognition: Option<RecognitionSession>,
    recognizer_events: Option<mpsc::Receiver<RecognizerEvent>>,
    levels: Option<mpsc::Receiver<f32>>,

    turn: Option<Turn>,
    turns: u64,
    played: u64,
    thinking_deadline: Option<Instant>,
    stall_deadline: Option<Instant>,
}

impl ConversationOrchestrator {
    /// Load saved history and start the orchestrator task.
    ///
    /// A history that cannot be loaded is logged and replaced by an empty one.
    pub async fn spawn(config: &TalkConfig, parts: Collaborators) -> TalkHandle {
        let saved = match parts.history.load().await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("starting with empty history: {e}");
                Vec::new()
            }
        };
        let history =
            ConversationHistory::from_messages(saved, config.conversation.history_limit);
        info!(turns = history.len(), "conversation history loaded");

        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let history_writer = tokio::spawn(write_history(parts.history, history_rx));

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (events, _) = broadcast::channel(256);

        let orchestrator = Self {
            barge_in: config.barge_in.clone(),
            conversation: config.conversation.clone(),
            detector: BargeInDetector::new(&config.barge_in),
            gateway_updates: Some(parts.backend.subscribe()),
            synthesis_events: Some(parts.synthesizer.subscribe()),
            playback: parts.synthesizer.tracker().subscribe(),
            capture: parts.capture,
            recognizer: parts.recognizer,
            backend: parts.backend,
            synthesizer: parts.synthesizer,
            cues: parts.cues,
            history,
            history_tx: Some(history_tx),
            history_writer: Some(history_writer),
            state: ConversationState::Idle,
            state_tx,
            events: events.clone(),
            commands: cmd_rx,
            internal_tx,
            internal_rx,
            capture_handle: None,
            recognition: None,
            recognizer_events: None,
            levels: None,
            turn: None,
            turns: 0,
            played: 0,
            thinking_deadline: None,
            stall_deadline: None,
        };
        tokio::spawn(orchestrator.run());

        TalkHandle {
            commands: cmd_tx,
            state: state_rx,
            events,
        }
    }

    async fn run(mut self) {
        loop {
            let thinking_at = self.thinking_deadline;
            let stall_at = self.stall_deadline;
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                update = recv_broadcast(&mut self.gateway_updates) => self.on_gateway(update),
                event = recv_broadcast(&mut self.synthesis_events) => self.on_synthesis(event),
                event = recv_opt(&mut self.recognizer_events) => self.on_recognizer(event),
                rms = recv_opt(&mut self.levels) => self.on_level(rms),
                Ok(()) = self.playback.changed() => self.on_playback_progress(),
                () = sleep_until_opt(thinking_at) => self.on_thinking_timeout(),
                () = sleep_until_opt(stall_at) => self.on_stall_timeout(),
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.start_listening(),
            Command::Stop => {
                info!(state = %self.state, "stop requested");
                self.go_idle();
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.snapshot());
            }
            // Handled in the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("conversation shutting down");
        self.go_idle();
        self.backend.shutdown().await;
        // Closing the channel lets the writer finish the last save and exit.
        self.history_tx = None;
        if let Some(writer) = self.history_writer.take()
            && let Err(e) = writer.await
        {
            warn!("history writer failed: {e}");
        }
    }

    // ── state ──────────────────────────────────────────────────────────

    fn enter(&mut self, next: ConversationState) {
        let prev = self.state;
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            error!(from = %prev, to = %next, "illegal state transition ignored");
            return;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        info!(from = %prev, to = %next, "conversation state");
        if let Some(cue) = cue_for(prev, next) {
            self.cues.cue(cue);
        }
        self.emit(RuntimeEvent::State(next));
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// Report `error` to the user and return to idle.
    fn fail(&mut self, error: TalkError) {
        warn!(state = %self.state, "conversation error: {error}");
        self.emit(RuntimeEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.go_idle();
    }

    /// Release everything the current phase holds and enter idle.
    fn go_idle(&mut self) {
        self.thinking_deadline = None;
        self.stall_deadline = None;
        self.release_capture();
        if let Some(turn) = self.turn.take() {
            if !turn.response_final {
                let backend = Arc::clone(&self.backend);
                debug!(turn = turn.number, "aborting chat run");
                tokio::spawn(async move { backend.abort(&turn.key).await });
            }
            self.synthesizer.stop();
        }
        self.enter(ConversationState::Idle);
    }

    fn release_capture(&mut self) {
        if let Some(capture) = self.capture_handle.take() {
            capture.stop();
        }
        if let Some(recognition) = self.recognition.take() {
            recognition.stop();
        }
        self.recognizer_events = None;
        self.levels = None;
        self.detector.stop_monitoring();
    }

    fn record(&mut self, role: Role, text: &str) {
        self.history.push(ChatMessage::new(role, text));
        if let Some(tx) = &self.history_tx {
            let _ = tx.send(self.history.snapshot());
        }
    }

    fn thinking_timeout(&self) -> Duration {
        Duration::from_secs(self.conversation.thinking_timeout_secs)
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.conversation.playback_stall_timeout_secs)
    }

    // ── listening ──────────────────────────────────────────────────────

    fn start_listening(&mut self) {
        if self.state != ConversationState::Idle {
            debug!(state = %self.state, "start ignored");
            return;
        }
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        let (levels_tx, levels_rx) = mpsc::channel(LEVEL_CHANNEL_DEPTH);
        let capture = match self.capture.start(CaptureRoute {
            frames: Some(frames_tx),
            levels: Some(levels_tx),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let (events_tx, events_rx) = mpsc::channel(RECOGNIZER_CHANNEL_DEPTH);
        self.recognition = Some(self.recognizer.start(frames_rx, events_tx));
        self.capture_handle = Some(capture);
        self.recognizer_events = Some(events_rx);
        self.levels = Some(levels_rx);
        self.enter(ConversationState::Listening);
    }

    fn on_recognizer(&mut self, event: Option<RecognizerEvent>) {
        let listening = self.state == ConversationState::Listening;
        match event {
            None => {
                self.recognizer_events = None;
                if listening {
                    info!("recognition ended without a transcript");
                    self.go_idle();
                }
            }
            Some(RecognizerEvent::Partial(text)) if listening => {
                self.emit(RuntimeEvent::PartialTranscript(text));
            }
            Some(RecognizerEvent::Finalized(text)) if listening => self.on_transcript(text),
            Some(RecognizerEvent::Failed(e)) if listening => self.fail(e),
            Some(_) => {}
        }
    }

    fn on_transcript(&mut self, text: String) {
        self.release_capture();
        let text = text.trim().to_owned();
        if text.is_empty() {
            info!("empty transcript, nothing to send");
            self.go_idle();
            return;
        }

        self.record(Role::User, &text);
        self.emit(RuntimeEvent::UserMessage(text.clone()));

        self.turns += 1;
        // New epoch: anything still queued from an earlier turn is gone.
        self.synthesizer.stop();
        let turn = Turn {
            number: self.turns,
            key: uuid::Uuid::new_v4().to_string(),
            epoch: self.synthesizer.epoch(),
            segmenter: SentenceSegmenter::new(),
            response_final: false,
        };
        info!(turn = turn.number, chars = text.len(), "sending transcript");

        let backend = Arc::clone(&self.backend);
        let internal = self.internal_tx.clone();
        let (number, key) = (turn.number, turn.key.clone());
        tokio::spawn(async move {
            let result = backend.send_message(&text, &key).await;
            let _ = internal.send(Internal::Sent {
                turn: number,
                result,
            });
        });

        self.turn = Some(turn);
        self.enter(ConversationState::Thinking);
        self.thinking_deadline = Some(Instant::now() + self.thinking_timeout());
    }

    fn on_level(&mut self, rms: Option<f32>) {
        let Some(rms) = rms else {
            self.levels = None;
            return;
        };
        match self.state {
            ConversationState::Listening => self.emit(RuntimeEvent::InputLevel { rms }),
            ConversationState::Speaking => {
                if self
                    .detector
                    .feed_level_at(rms, Instant::now().into_std())
                {
                    self.barge_in();
                }
            }
            _ => {}
        }
    }

    // ── thinking ───────────────────────────────────────────────────────

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Sent { turn, result } => {
                if self.turn.as_ref().is_none_or(|t| t.number != turn) {
                    return;
                }
                match result {
                    Ok(()) => {
                        debug!(turn, "message acknowledged");
                        self.backend_activity();
                    }
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    /// Push back the response deadline, if one is armed.
    fn backend_activity(&mut self) {
        if self.thinking_deadline.is_some() {
            self.thinking_deadline = Some(Instant::now() + self.thinking_timeout());
        }
    }

    fn is_active_run(&self, run: &str) -> bool {
        matches!(
            self.state,
            ConversationState::Thinking | ConversationState::Speaking
        ) && self
            .turn
            .as_ref()
            .is_some_and(|t| t.key == run && !t.response_final)
    }

    fn on_gateway(&mut self, update: GatewayUpdate) {
        match update {
            GatewayUpdate::Status(status) => self.emit(RuntimeEvent::Connection(status)),
            GatewayUpdate::Delta { run, text } if self.is_active_run(&run) => {
                self.on_response(text, false);
            }
            GatewayUpdate::Final { run, text } if self.is_active_run(&run) => {
                self.on_response(text, true);
            }
            GatewayUpdate::Failed { run, message } if self.is_active_run(&run) => {
                self.fail(TalkError::Protocol(message));
            }
            GatewayUpdate::Aborted { run } if self.is_active_run(&run) => {
                info!("response aborted by the gateway");
                self.go_idle();
            }
            other => debug!(?other, "ignoring update for inactive run"),
        }
    }

    /// Apply a response snapshot. `text` is the whole response so far.
    fn on_response(&mut self, text: String, is_final: bool) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let sentences = if is_final {
            turn.response_final = true;
            turn.segmenter.finish(&text)
        } else {
            turn.segmenter.push_snapshot(&text)
        };
        let number = turn.number;

        self.backend_activity();
        self.emit(RuntimeEvent::ResponseText(text.clone()));
        for sentence in sentences {
            debug!(turn = number, "queueing sentence");
            if !self.synthesizer.enqueue(sentence) {
                warn!(turn = number, "synthesizer refused sentence");
            }
        }

        if is_final {
            let response = text.trim();
            if !response.is_empty() {
                self.record(Role::Assistant, response);
                self.emit(RuntimeEvent::AssistantMessage(response.to_owned()));
            }
            info!(turn = number, chars = response.len(), "response complete");
            if self.state == ConversationState::Speaking {
                self.thinking_deadline = None;
            }
            self.synthesizer.finalize();
        }
    }

    fn on_thinking_timeout(&mut self) {
        self.thinking_deadline = None;
        if matches!(
            self.state,
            ConversationState::Thinking | ConversationState::Speaking
        ) {
            let secs = self.conversation.thinking_timeout_secs;
            self.fail(TalkError::Timeout(format!(
                "no response from the assistant within {secs}s"
            )));
        }
    }

    // ── speaking ───────────────────────────────────────────────────────

    fn on_synthesis(&mut self, event: SynthesisEvent) {
        let Some(epoch) = self.turn.as_ref().map(|t| t.epoch) else {
            return;
        };
        match event {
            SynthesisEvent::FirstAudio { epoch: e } if e == epoch => {
                if self.state == ConversationState::Thinking {
                    self.start_speaking();
                }
            }
            SynthesisEvent::SentenceFailed {
                epoch: e,
                message,
                recovered,
            } if e == epoch => {
                self.emit(RuntimeEvent::SynthesisFallback { message, recovered });
            }
            SynthesisEvent::PlaybackFinished { epoch: e } if e == epoch => {
                self.on_playback_finished();
            }
            stale => debug!(?stale, "ignoring stale synthesis event"),
        }
    }

    fn start_speaking(&mut self) {
        self.thinking_deadline = None;
        self.enter(ConversationState::Speaking);
        let counts = *self.playback.borrow();
        self.played = counts.completed;
        self.arm_speaking_timers(counts);

        if !self.barge_in.enabled {
            return;
        }
        let (levels_tx, levels_rx) = mpsc::channel(LEVEL_CHANNEL_DEPTH);
        match self.capture.start(CaptureRoute {
            frames: None,
            levels: Some(levels_tx),
        }) {
            Ok(handle) => {
                self.capture_handle = Some(handle);
                self.levels = Some(levels_rx);
                self.detector.start_monitoring_at(Instant::now().into_std());
            }
            Err(e) => warn!("barge-in unavailable for this response: {e}"),
        }
    }

    /// Only finished buffers count as progress.
    fn on_playback_progress(&mut self) {
        let counts = *self.playback.borrow_and_update();
        let progressed = counts.completed != self.played;
        self.played = counts.completed;
        if self.state != ConversationState::Speaking {
            return;
        }
        if progressed {
            self.stall_deadline = None;
        }
        self.arm_speaking_timers(counts);
    }

    /// While audio is pending the speakers must make progress. Once it has
    /// all played, the wait is on the assistant for more text.
    fn arm_speaking_timers(&mut self, counts: PlaybackCounts) {
        let now = Instant::now();
        if !counts.is_drained() {
            self.thinking_deadline = None;
            if self.stall_deadline.is_none() {
                self.stall_deadline = Some(now + self.stall_timeout());
            }
            return;
        }
        self.stall_deadline = None;
        let waiting_for_text = self.turn.as_ref().is_some_and(|t| !t.response_final);
        if waiting_for_text && self.thinking_deadline.is_none() {
            self.thinking_deadline = Some(now + self.thinking_timeout());
        } else if !waiting_for_text {
            self.thinking_deadline = None;
        }
    }

    fn on_playback_finished(&mut self) {
        match self.state {
            ConversationState::Speaking => {
                self.go_idle();
                if self.conversation.auto_listen {
                    self.start_listening();
                }
            }
            ConversationState::Thinking => {
                info!("response had nothing to speak");
                self.go_idle();
            }
            _ => {}
        }
    }

    fn barge_in(&mut self) {
        info!("user interrupted, listening again");
        self.go_idle();
        self.start_listening();
    }

    fn on_stall_timeout(&mut self) {
        self.stall_deadline = None;
        if self.state == ConversationState::Speaking {
            let secs = self.conversation.playback_stall_timeout_secs;
            self.fail(TalkError::Timeout(format!(
                "playback made no progress for {secs}s"
            )));
        }
    }
}

/// Cue played on a transition, if any.
fn cue_for(prev: ConversationState, next: ConversationState) -> Option<Cue> {
    use ConversationState::{Idle, Listening, Speaking, Thinking};
    match (prev, next) {
        (_, Listening) => Some(Cue::Listening),
        (_, Thinking) => Some(Cue::Thinking),
        (_, Speaking) => Some(Cue::Speaking),
        (Speaking, Idle) => Some(Cue::Done),
        _ => None,
    }
}

/// Persist history snapshots in order. Only the newest pending snapshot is written.
async fn write_history(
    store: Arc<dyn HistoryStore>,
    mut snapshots: mpsc::UnboundedReceiver<Vec<ChatMessage>>,
) {
    while let Some(mut latest) = snapshots.recv().await {
        while let Ok(newer) = snapshots.try_recv() {
            latest = newer;
        }
        if let Err(e) = store.save(latest).await {
            warn!("failed to save history: {e}");
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Next broadcast value. Lag is logged and skipped; a closed channel
/// disables the slot.
async fn recv_broadcast<T: Clone>(slot: &mut Option<broadcast::Receiver<T>>) -> T {
    loop {
        let Some(rx) = slot.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(value) => return value,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => *slot = None,
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
