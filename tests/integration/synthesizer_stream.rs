//! Streaming synthesis against a loopback speech server.

use crate::helpers::{FakeSpeakers, QuietOffline, WAIT, wav_tone};
use clawk_talk::config::TtsConfig;
use clawk_talk::tts::{
    SentenceSegmenter, StreamingSynthesizer, SynthesisEvent, WebSocketSpeechBackend,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Serve one connection: a tone per sentence, an error frame for any
/// sentence containing "oops".
async fn speech_server(listener: TcpListener, heard: Arc<Mutex<Vec<String>>>, accepted: Arc<Mutex<u32>>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        *accepted.lock().unwrap() += 1;
        let heard = Arc::clone(&heard);
        tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                heard.lock().unwrap().push(text.clone());
                if text.contains("oops") {
                    let _ = ws
                        .send(Message::Text(r#"{"error":"rate limited"}"#.into()))
                        .await;
                } else {
                    for chunk in wav_tone(24_000, 0.25).chunks(4_096) {
                        let _ = ws.send(Message::Binary(chunk.to_vec())).await;
                    }
                }
                let _ = ws.send(Message::Text("END".into())).await;
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_snapshots_are_spoken_sentence_by_sentence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let heard = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(Mutex::new(0));
    tokio::spawn(speech_server(
        listener,
        Arc::clone(&heard),
        Arc::clone(&accepted),
    ));

    let config = TtsConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        min_buffer_ms: 50,
        frame_timeout_ms: 2_000,
        ..TtsConfig::default()
    };
    let offline = Arc::new(QuietOffline::default());
    let speakers = Arc::new(FakeSpeakers::default());
    let synth = StreamingSynthesizer::new(
        &config,
        Arc::new(WebSocketSpeechBackend::new(&config)),
        Arc::clone(&offline) as _,
        Arc::clone(&speakers) as _,
    );
    let mut events = synth.subscribe();
    let epoch = synth.epoch();

    let mut segmenter = SentenceSegmenter::new();
    let snapshots = [
        "Good",
        "Good morning! The **sun**",
        "Good morning! The **sun** is out. Well, oops",
    ];
    for snapshot in snapshots {
        for sentence in segmenter.push_snapshot(snapshot) {
            assert!(synth.enqueue(sentence));
        }
    }
    let full = "Good morning! The **sun** is out. Well, oops that was loud.";
    for sentence in segmenter.finish(full) {
        assert!(synth.enqueue(sentence));
    }
    synth.finalize();
    assert!(!synth.enqueue("too late"));

    let mut first_audio = false;
    let mut failures = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            SynthesisEvent::FirstAudio { epoch: e } => {
                assert_eq!(e, epoch);
                first_audio = true;
            }
            SynthesisEvent::SentenceFailed {
                message, recovered, ..
            } => failures.push((message, recovered)),
            SynthesisEvent::PlaybackFinished { epoch: e } => {
                assert_eq!(e, epoch);
                break;
            }
        }
    }

    assert!(first_audio);
    assert_eq!(
        heard.lock().unwrap().as_slice(),
        [
            "Good morning!",
            "The sun is out.",
            "Well, oops that was loud."
        ]
    );
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0.contains("rate limited"));
    assert!(failures[0].1, "offline voice should have covered the sentence");
    assert_eq!(
        offline.spoken.lock().unwrap().as_slice(),
        ["Well, oops that was loud."]
    );
    // The error frame was followed by END, so one connection served everything.
    assert_eq!(*accepted.lock().unwrap(), 1);
    assert!(synth.playback_counts().is_drained());
    assert!(speakers.played() > 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_falls_back_for_every_sentence() {
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let config = TtsConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        frame_timeout_ms: 1_000,
        ..TtsConfig::default()
    };
    let offline = Arc::new(QuietOffline::default());
    let synth = StreamingSynthesizer::new(
        &config,
        Arc::new(WebSocketSpeechBackend::new(&config)),
        Arc::clone(&offline) as _,
        Arc::new(FakeSpeakers::default()),
    );
    let mut events = synth.subscribe();
    synth.enqueue("One.");
    synth.enqueue("Two.");
    synth.finalize();

    let mut recovered = 0;
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            SynthesisEvent::SentenceFailed { recovered: true, .. } => recovered += 1,
            SynthesisEvent::PlaybackFinished { .. } => break,
            _ => {}
        }
    }
    assert_eq!(recovered, 2);
    assert_eq!(offline.spoken.lock().unwrap().as_slice(), ["One.", "Two."]);
}
