//! Gateway connection lifecycle against a loopback WebSocket server.

use crate::helpers::{
    FakeMicrophone, FakeSpeakers, MemoryHistory, QuietOffline, RecordingCues, ScriptedEngine,
    ToneSpeech, WAIT, test_config,
};
use clawk_talk::audio::capture::AudioCaptureEngine;
use clawk_talk::config::{GatewayConfig, ReconnectConfig};
use clawk_talk::error::TalkError;
use clawk_talk::gateway::{ConnectionStatus, GatewayConnection, GatewayUpdate};
use clawk_talk::history::Role;
use clawk_talk::pipeline::ConversationState;
use clawk_talk::stt::SpeechRecognizer;
use clawk_talk::tts::StreamingSynthesizer;
use clawk_talk::{Collaborators, ConversationOrchestrator, RuntimeEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

fn gateway_config(port: u16) -> GatewayConfig {
    GatewayConfig {
        url: format!("ws://127.0.0.1:{port}"),
        handshake_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        reconnect: ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 1_000,
            failure_threshold: 5,
            cooldown_secs: 60,
        },
        ..GatewayConfig::default()
    }
}

async fn send(ws: &mut ServerWs, v: Value) {
    ws.send(Message::Text(v.to_string())).await.unwrap();
}

/// Next request frame as `(id, method, params)`. `None` once the client hangs up.
async fn recv_req(ws: &mut ServerWs) -> Option<(String, String, Value)> {
    while let Some(msg) = ws.next().await {
        if let Ok(Message::Text(t)) = msg {
            let v: Value = serde_json::from_str(&t).unwrap();
            return Some((
                v["id"].as_str().unwrap().to_owned(),
                v["method"].as_str().unwrap().to_owned(),
                v["params"].clone(),
            ));
        }
    }
    None
}

async fn accept_and_hello(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    send(
        &mut ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n1"}}),
    )
    .await;
    let (id, method, _) = recv_req(&mut ws).await.unwrap();
    assert_eq!(method, "connect");
    send(
        &mut ws,
        json!({"type": "res", "id": id, "ok": true, "payload": {"snapshot": {}}}),
    )
    .await;
    ws
}

async fn next_status(updates: &mut broadcast::Receiver<GatewayUpdate>) -> ConnectionStatus {
    loop {
        let update = tokio::time::timeout(WAIT, updates.recv())
            .await
            .expect("no status change")
            .unwrap();
        if let GatewayUpdate::Status(status) = update {
            return status;
        }
    }
}

#[tokio::test]
async fn unreachable_gateway_backs_off_then_opens_circuit() {
    // Bind and release a port so nothing is listening on it.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let gw = GatewayConnection::spawn(gateway_config(port));
    let mut updates = gw.subscribe();

    assert!(matches!(gw.connect().await, Err(TalkError::Transport(_))));

    let mut delays = Vec::new();
    let retry_in = loop {
        match next_status(&mut updates).await {
            ConnectionStatus::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay.as_millis());
            }
            ConnectionStatus::CircuitOpen { retry_in } => break retry_in,
            _ => {}
        }
    };
    assert_eq!(delays, [10, 20, 40, 80]);
    assert!(retry_in > Duration::from_secs(50));

    // While the circuit is open nothing waits for a connection.
    let started = std::time::Instant::now();
    assert!(matches!(gw.connect().await, Err(TalkError::Transport(_))));
    let err = gw.send_chat("hello", "run-1").await.unwrap_err();
    assert!(matches!(err, TalkError::Transport(ref m) if m.contains("unavailable")), "{err}");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn lost_session_reconnects_after_base_delay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let first = accept_and_hello(&listener).await;
        drop(first);
        let mut second = accept_and_hello(&listener).await;
        while recv_req(&mut second).await.is_some() {}
    });

    let gw = GatewayConnection::spawn(gateway_config(port));
    let mut updates = gw.subscribe();
    gw.connect().await.unwrap();

    let mut seen = Vec::new();
    loop {
        let status = next_status(&mut updates).await;
        seen.push(status);
        if seen.len() > 1 && status == ConnectionStatus::Connected {
            break;
        }
    }
    assert_eq!(
        seen,
        [
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(10)
            },
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
    gw.disconnect().await;
    assert_eq!(gw.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conversation_over_a_real_gateway_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let mut ws = accept_and_hello(&listener).await;
        let (id, method, params) = recv_req(&mut ws).await.unwrap();
        assert_eq!(method, "chat.send");
        assert_eq!(params["message"], "How far is the moon?");
        assert_eq!(params["deliver"], false);
        let key = params["idempotencyKey"].as_str().unwrap().to_owned();
        send(
            &mut ws,
            json!({"type": "res", "id": id, "ok": true, "payload": {"runId": key, "status": "started"}}),
        )
        .await;
        for text in ["About 384,000", "About 384,000 kilometres. Give or take."] {
            send(
                &mut ws,
                json!({"type": "event", "event": "chat", "payload": {"runId": key, "sessionKey": "main", "state": "delta", "message": text}}),
            )
            .await;
        }
        send(
            &mut ws,
            json!({"type": "event", "event": "chat", "payload": {"runId": key, "sessionKey": "main", "state": "final"}}),
        )
        .await;
        while recv_req(&mut ws).await.is_some() {}
    });

    let config = test_config();
    let gateway = GatewayConnection::spawn(gateway_config(port));
    let speech = Arc::new(ToneSpeech::default());
    let speakers = Arc::new(FakeSpeakers::default());
    let history = Arc::new(MemoryHistory::default());
    let talk = ConversationOrchestrator::spawn(
        &config,
        Collaborators {
            capture: AudioCaptureEngine::new(Arc::new(FakeMicrophone::default())),
            recognizer: SpeechRecognizer::new(
                Arc::new(ScriptedEngine::hearing(&["How far is the moon?"])),
                config.recognizer.silence_timeout(),
            ),
            backend: Arc::new(gateway),
            synthesizer: StreamingSynthesizer::new(
                &config.tts,
                Arc::clone(&speech) as _,
                Arc::new(QuietOffline::default()),
                Arc::clone(&speakers) as _,
            ),
            history: Arc::clone(&history) as _,
            cues: Arc::new(RecordingCues::default()),
        },
    )
    .await;
    let mut events = talk.subscribe();
    talk.start().await.unwrap();

    let mut connected = false;
    let mut states = Vec::new();
    while states.last() != Some(&ConversationState::Idle) {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            RuntimeEvent::State(s) => states.push(s),
            RuntimeEvent::Connection(ConnectionStatus::Connected) => connected = true,
            RuntimeEvent::Error { message, .. } => panic!("conversation failed: {message}"),
            _ => {}
        }
    }
    assert!(connected);
    assert_eq!(
        states,
        [
            ConversationState::Listening,
            ConversationState::Thinking,
            ConversationState::Speaking,
            ConversationState::Idle
        ]
    );
    assert_eq!(
        speech.spoken.lock().unwrap().as_slice(),
        ["About 384,000 kilometres.", "Give or take."]
    );

    talk.shutdown().await;
    let saved = history.saved();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].role, Role::Assistant);
    assert_eq!(saved[1].text, "About 384,000 kilometres. Give or take.");
    server.await.unwrap();
}
