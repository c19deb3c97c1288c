//! Headless Talk Mode host.
//!
//! Wires the real microphone, recognizer, gateway, speech server and
//! speakers into a conversation and drives it from stdin:
//!
//! ```text
//! start   begin listening
//! stop    cancel whatever is in progress
//! quit    shut down
//! ```
//!
//! Diagnostics go to stderr and to a daily log file under the data directory.

use anyhow::Context;
use clawk_talk::audio::capture::{AudioCaptureEngine, CpalCapture};
use clawk_talk::audio::playback::{CpalPlayback, PlaybackSink};
use clawk_talk::config::default_log_dir;
use clawk_talk::cues::ToneCues;
use clawk_talk::gateway::GatewayConnection;
use clawk_talk::history::JsonFileHistoryStore;
use clawk_talk::stt::{ParakeetEngine, SpeechRecognizer};
use clawk_talk::tts::{CommandSynthesizer, StreamingSynthesizer, WebSocketSpeechBackend};
use clawk_talk::{Collaborators, ConversationOrchestrator, RuntimeEvent, TalkConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = default_log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "talk.log"));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("clawk_talk=info,hf_hub=warn,ort=warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let config_path = TalkConfig::default_config_path();
    let config = if config_path.exists() {
        TalkConfig::from_file(&config_path)
            .with_context(|| format!("cannot load {}", config_path.display()))?
    } else {
        tracing::info!("no config at {}, using defaults", config_path.display());
        TalkConfig::default()
    };
    config.validate()?;

    tracing::info!("clawk-talk v{} starting", env!("CARGO_PKG_VERSION"));

    let capture = AudioCaptureEngine::new(Arc::new(CpalCapture::new(&config.audio)?));
    let engine = Arc::new(ParakeetEngine::new(&config.recognizer, &config.models)?);
    {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = engine.ensure_loaded() {
                tracing::warn!("recognizer preload failed: {e}");
            }
        });
    }
    let recognizer = SpeechRecognizer::new(engine, config.recognizer.silence_timeout());

    // Connects on the first message.
    let gateway = GatewayConnection::spawn(config.gateway.clone());

    let speech = Arc::new(WebSocketSpeechBackend::new(&config.tts));
    match speech.health_check().await {
        Ok(health) => tracing::info!(
            status = %health.status,
            version = ?health.version,
            "speech server reachable"
        ),
        Err(e) => tracing::warn!("speech server unavailable, offline voice will be used: {e}"),
    }

    let speakers: Arc<dyn PlaybackSink> = Arc::new(CpalPlayback::new(&config.audio)?);
    let synthesizer = StreamingSynthesizer::new(
        &config.tts,
        speech,
        Arc::new(CommandSynthesizer::new(&config.tts)),
        Arc::clone(&speakers),
    );

    let talk = ConversationOrchestrator::spawn(
        &config,
        Collaborators {
            capture,
            recognizer,
            backend: Arc::new(gateway),
            synthesizer,
            history: Arc::new(JsonFileHistoryStore::new(
                config.conversation.history_path.clone(),
            )),
            cues: Arc::new(ToneCues::new(speakers)),
        },
    )
    .await;

    tokio::spawn(log_events(talk.subscribe()));

    println!("commands: start | stop | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "start" => talk.start().await?,
            "stop" => talk.stop().await?,
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    talk.shutdown().await;
    tracing::info!("clawk-talk shut down cleanly");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<RuntimeEvent>) {
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::InputLevel { .. }) => {}
            Ok(RuntimeEvent::State(state)) => println!("[{state}]"),
            Ok(RuntimeEvent::UserMessage(text)) => println!("you: {text}"),
            Ok(RuntimeEvent::AssistantMessage(text)) => println!("assistant: {text}"),
            Ok(RuntimeEvent::Error { kind, message }) => {
                tracing::error!(?kind, "{message}");
            }
            Ok(event) => tracing::debug!(?event, "runtime event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
