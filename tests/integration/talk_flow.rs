//! End-to-end conversations through the orchestrator with fake devices.

use crate::helpers::{FakeGateway, FakeMicrophone, FakeSpeakers, HarnessBuilder, MemoryHistory, WAIT};
use clawk_talk::RuntimeEvent;
use clawk_talk::cues::Cue;
use clawk_talk::error::ErrorKind;
use clawk_talk::gateway::GatewayUpdate;
use clawk_talk::history::{ChatMessage, Role};
use clawk_talk::pipeline::ConversationState::{Idle, Listening, Speaking, Thinking};
use std::time::Duration;

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spoken_question_gets_a_spoken_answer() {
    let mut h = HarnessBuilder::hearing(&["What time is it?"]).spawn().await;
    h.talk.start().await.unwrap();

    let (text, run) = h.gateway.next_sent().await;
    assert_eq!(text, "What time is it?");
    h.gateway.publish(GatewayUpdate::Delta {
        run: run.clone(),
        text: "It is noon.".into(),
    });
    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "It is noon. Enjoy lunch.".into(),
    });

    assert_eq!(
        h.states_until(Idle).await,
        [Listening, Thinking, Speaking, Idle]
    );
    assert_eq!(
        h.speech.spoken.lock().unwrap().as_slice(),
        ["It is noon.", "Enjoy lunch."]
    );
    assert!(h.speakers.played() > 0);
    assert_eq!(
        h.cues.cues(),
        [Cue::Listening, Cue::Thinking, Cue::Speaking, Cue::Done]
    );
    assert!(h.gateway.aborted().is_empty());
    // Listening, then level monitoring while speaking.
    assert_eq!(h.microphone.opened(), 2);

    let history = h.talk.history().await.unwrap();
    let turns: Vec<_> = history.iter().map(|m| (m.role, m.text.as_str())).collect();
    assert_eq!(
        turns,
        [
            (Role::User, "What time is it?"),
            (Role::Assistant, "It is noon. Enjoy lunch.")
        ]
    );

    h.talk.shutdown().await;
    assert_eq!(h.history.saved().len(), 2);
    assert!(*h.gateway.shut_down.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcript_events_precede_the_response() {
    let mut h = HarnessBuilder::hearing(&["Tell me a joke"]).spawn().await;
    h.talk.start().await.unwrap();

    let partial = h
        .expect(|e| match e {
            RuntimeEvent::PartialTranscript(t) => Some(t.clone()),
            _ => None,
        })
        .await;
    assert_eq!(partial, "Tell");
    let user = h
        .expect(|e| match e {
            RuntimeEvent::UserMessage(t) => Some(t.clone()),
            _ => None,
        })
        .await;
    assert_eq!(user, "Tell me a joke");

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Delta {
        run: run.clone(),
        text: "Why did".into(),
    });
    let response = h
        .expect(|e| match e {
            RuntimeEvent::ResponseText(t) => Some(t.clone()),
            _ => None,
        })
        .await;
    assert_eq!(response, "Why did");
    h.talk.stop().await.unwrap();
    h.expect_state(Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_transcript_returns_to_idle_without_sending() {
    let mut h = HarnessBuilder::hearing(&[""]).spawn().await;
    h.talk.start().await.unwrap();
    assert_eq!(h.states_until(Idle).await, [Listening, Idle]);
    assert!(h.gateway.sent.lock().await.try_recv().is_err());
    assert!(h.talk.history().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gateway_failure_reports_protocol_error() {
    let mut h = HarnessBuilder::hearing(&["Hello"]).spawn().await;
    h.talk.start().await.unwrap();
    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Failed {
        run,
        message: "model overloaded".into(),
    });

    let (kind, message) = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, message } => Some((*kind, message.clone())),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Protocol);
    assert!(message.contains("model overloaded"));
    assert_eq!(h.talk.state(), Idle);

    let history = h.talk.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_send_reports_transport_error() {
    let mut builder = HarnessBuilder::hearing(&["Hello"]);
    builder.gateway = FakeGateway::rejecting();
    let mut h = builder.spawn().await;
    h.talk.start().await.unwrap();

    let kind = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Transport);
    h.expect_state(Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_assistant_times_out_and_aborts_the_run() {
    let mut h = HarnessBuilder::hearing(&["Are you there?"]).spawn().await;
    h.talk.start().await.unwrap();
    let (_, run) = h.gateway.next_sent().await;

    let kind = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Timeout);
    assert_eq!(h.talk.state(), Idle);
    eventually(|| h.gateway.aborted() == [run.clone()]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_while_thinking_ignores_late_response() {
    let mut h = HarnessBuilder::hearing(&["Hello"]).spawn().await;
    h.talk.start().await.unwrap();
    let (_, run) = h.gateway.next_sent().await;
    h.expect_state(Thinking).await;

    h.talk.stop().await.unwrap();
    h.expect_state(Idle).await;
    eventually(|| h.gateway.aborted() == [run.clone()]).await;

    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "Too late.".into(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = h.events.try_recv() {
        assert!(
            !matches!(event, RuntimeEvent::ResponseText(_) | RuntimeEvent::State(_)),
            "unexpected {event:?}"
        );
    }
    assert!(h.speech.spoken.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn speaking_over_the_assistant_interrupts_it() {
    let mut builder = HarnessBuilder::hearing(&["Read me the news"]);
    builder.speakers = FakeSpeakers::holding();
    let mut h = builder.spawn().await;
    h.talk.start().await.unwrap();

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Delta {
        run: run.clone(),
        text: "Here are the headlines. First".into(),
    });
    h.expect_state(Speaking).await;

    h.microphone.set_level(0.5);
    assert_eq!(h.states_until(Listening).await, [Idle, Listening]);
    assert!(h.speakers.flushes() >= 1);
    eventually(|| h.gateway.aborted() == [run.clone()]).await;

    h.talk.stop().await.unwrap();
    h.expect_state(Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_playback_times_out() {
    let mut builder = HarnessBuilder::hearing(&["Sing"]);
    builder.speakers = FakeSpeakers::holding();
    builder.config.barge_in.enabled = false;
    let mut h = builder.spawn().await;
    h.talk.start().await.unwrap();

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "La la la.".into(),
    });
    h.expect_state(Speaking).await;

    let kind = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Timeout);
    assert_eq!(h.talk.state(), Idle);
    assert!(h.speakers.flushes() >= 1);
    // Barge-in disabled: only the listening capture was opened.
    assert_eq!(h.microphone.opened(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_in_the_response_after_playback_drains_is_not_a_stall() {
    let mut h = HarnessBuilder::hearing(&["What's the weather?"]).spawn().await;
    h.talk.start().await.unwrap();

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Delta {
        run: run.clone(),
        text: "Let me look. Checking".into(),
    });
    h.expect_state(Speaking).await;

    // A tool call: text trickles in with no sentence end for longer than
    // the stall timeout, long after the first sentence has played.
    let mut text = String::from("Let me look. Checking");
    for word in [" the", " forecast", " for", " today"] {
        tokio::time::sleep(Duration::from_millis(400)).await;
        text.push_str(word);
        h.gateway.publish(GatewayUpdate::Delta {
            run: run.clone(),
            text: text.clone(),
        });
    }
    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "Let me look. Checking the forecast for today. Sunny.".into(),
    });

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, h.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RuntimeEvent::Error { message, .. } => panic!("turn failed: {message}"),
            RuntimeEvent::State(Idle) => break,
            _ => {}
        }
    }
    assert_eq!(
        h.speech.spoken.lock().unwrap().as_slice(),
        ["Let me look.", "Checking the forecast for today.", "Sunny."]
    );
    assert!(h.gateway.aborted().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_gateway_after_playback_drains_times_out() {
    let mut h = HarnessBuilder::hearing(&["Tell me more"]).spawn().await;
    h.talk.start().await.unwrap();

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Delta {
        run: run.clone(),
        text: "Sure. And then".into(),
    });
    h.expect_state(Speaking).await;

    let (kind, message) = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, message } => Some((*kind, message.clone())),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Timeout);
    assert!(message.contains("assistant"), "{message}");
    assert_eq!(h.talk.state(), Idle);
    eventually(|| h.gateway.aborted() == [run.clone()]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unspeakable_response_returns_to_idle_from_thinking() {
    let mut h = HarnessBuilder::hearing(&["Draw a line", "Say nothing"]).spawn().await;

    for final_text in ["***", ""] {
        h.talk.start().await.unwrap();
        let (_, run) = h.gateway.next_sent().await;
        h.gateway.publish(GatewayUpdate::Final {
            run,
            text: final_text.into(),
        });
        assert_eq!(h.states_until(Idle).await, [Listening, Thinking, Idle]);
    }

    assert!(h.speech.spoken.lock().unwrap().is_empty());
    assert_eq!(h.speakers.played(), 0);
    assert!(h.gateway.aborted().is_empty());
    assert_eq!(
        h.cues.cues(),
        [Cue::Listening, Cue::Thinking, Cue::Listening, Cue::Thinking]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sentence_falls_back_to_offline_voice() {
    let mut h = HarnessBuilder::hearing(&["Hi"]).spawn().await;
    h.talk.start().await.unwrap();
    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "FAIL this one. Then this.".into(),
    });

    let recovered = h
        .expect(|e| match e {
            RuntimeEvent::SynthesisFallback { recovered, .. } => Some(*recovered),
            _ => None,
        })
        .await;
    assert!(recovered);
    h.expect_state(Idle).await;
    assert_eq!(
        h.offline.spoken.lock().unwrap().as_slice(),
        ["FAIL this one."]
    );
    assert_eq!(h.speech.spoken.lock().unwrap().as_slice(), ["Then this."]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_listen_reopens_the_microphone() {
    let mut builder = HarnessBuilder::hearing(&["Hi"]);
    builder.config.conversation.auto_listen = true;
    let mut h = builder.spawn().await;
    h.talk.start().await.unwrap();

    let (_, run) = h.gateway.next_sent().await;
    h.gateway.publish(GatewayUpdate::Final {
        run,
        text: "Hello.".into(),
    });
    assert_eq!(
        h.states_until(Idle).await,
        [Listening, Thinking, Speaking, Idle]
    );
    h.expect_state(Listening).await;
    h.talk.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_microphone_stays_idle() {
    let mut builder = HarnessBuilder::hearing(&["unused"]);
    builder.microphone = FakeMicrophone::broken();
    let mut h = builder.spawn().await;
    h.talk.start().await.unwrap();

    let kind = h
        .expect(|e| match e {
            RuntimeEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::Device);
    assert_eq!(h.talk.state(), Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_start_is_ignored_while_listening() {
    let mut h = HarnessBuilder::hearing(&[]).spawn().await;
    h.talk.start().await.unwrap();
    h.expect_state(Listening).await;
    h.talk.start().await.unwrap();
    h.talk.history().await.unwrap();
    assert_eq!(h.microphone.opened(), 1);
    assert_eq!(h.talk.state(), Listening);

    h.microphone.set_level(0.2);
    let rms = h
        .expect(|e| match e {
            RuntimeEvent::InputLevel { rms } if *rms > 0.0 => Some(*rms),
            _ => None,
        })
        .await;
    assert!((rms - 0.2).abs() < 1e-6);
    h.talk.stop().await.unwrap();
    h.expect_state(Idle).await;
}

#[tokio::test]
async fn saved_history_is_loaded_and_trimmed() {
    let mut builder = HarnessBuilder::hearing(&[]);
    builder.config.conversation.history_limit = 2;
    builder.history = MemoryHistory::with(vec![
        ChatMessage::new(Role::User, "one"),
        ChatMessage::new(Role::Assistant, "two"),
        ChatMessage::new(Role::User, "three"),
    ]);
    let h = builder.spawn().await;

    let texts: Vec<_> = h
        .talk
        .history()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, ["two", "three"]);
    h.talk.shutdown().await;
}
