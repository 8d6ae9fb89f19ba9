//! End-to-end session scenarios driven through the effects layer.
//!
//! These run on a paused runtime: detector loops, timers and the provider
//! pool all advance deterministically, and VAD silence is measured in audio
//! time, so the flows reproduce exactly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use asrhub_core::bootstrap::{bootstrap_hub, BackendFactory, HubServices};
use asrhub_core::config::HubConfig;
use asrhub_core::effects::ServiceSet;
use asrhub_core::fcm::{FcmState, InterruptSource, InterruptTarget, Strategy};
use asrhub_core::provider::{AsrBackend, MockBackend};
use asrhub_core::services::ScriptedWakeWord;
use asrhub_core::store::Action;
use asrhub_core::OutboundEvent;

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

fn factories() -> HashMap<String, BackendFactory> {
    let mut map: HashMap<String, BackendFactory> = HashMap::new();
    map.insert(
        "default".to_string(),
        Arc::new(|| {
            Arc::new(MockBackend::new(
                "mock",
                vec!["hello world".to_string()],
                Duration::ZERO,
            )) as Arc<dyn AsrBackend>
        }),
    );
    map
}

fn harness(tune: impl FnOnce(&mut HubConfig)) -> HubServices {
    let mut config = HubConfig::with_defaults();
    config.services.recording_enabled = false;
    config.fcm.awake_timeout_ms = 8_000;
    config.fcm.llm_claim_ttl_ms = 3_000;
    config.fcm.tts_claim_ttl_ms = 3_000;
    config.fcm.keep_awake_after_reply = true;
    config.fcm.auto_capture_on_wake = true;
    tune(&mut config);
    bootstrap_hub(config, factories(), ServiceSet::reference()).unwrap()
}

/// Collects the FCM state sequence from `status` events.
fn collect_states(services: &HubServices) -> Arc<Mutex<Vec<FcmState>>> {
    let states: Arc<Mutex<Vec<FcmState>>> = Arc::default();
    let sink = Arc::clone(&states);
    let mut rx = services.bridge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let OutboundEvent::Status { state, .. } = event {
                sink.lock().push(state);
            }
        }
    });
    states
}

fn dedup(states: &[FcmState]) -> Vec<FcmState> {
    let mut out: Vec<FcmState> = Vec::new();
    for state in states {
        if out.last() != Some(state) {
            out.push(*state);
        }
    }
    out
}

fn pcm(samples: &[i16]) -> Bytes {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

/// One wake-word frame: mostly silence with the detector's marker sample.
fn wake_chunk() -> Bytes {
    let mut samples = vec![0i16; 512];
    samples[100] = ScriptedWakeWord::DEFAULT_MARKER;
    pcm(&samples)
}

/// One VAD window (400 ms) of speech-level audio.
fn speech_chunk() -> Bytes {
    pcm(&vec![8_000i16; 6_400])
}

/// One VAD window (400 ms) of silence.
fn silence_chunk() -> Bytes {
    pcm(&vec![0i16; 6_400])
}

fn push_audio(services: &HubServices, session_id: &str, audio: Bytes) {
    services
        .effects
        .submit(Action::AudioChunk {
            session_id: session_id.to_string(),
            chunk_id: None,
            timestamp: None,
            audio,
        })
        .unwrap();
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn state_of(services: &HubServices, session_id: &str) -> Option<FcmState> {
    services.registry.state(session_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

/// Natural reply: wake word, speech, VAD-ended recording, transcription,
/// LLM reply, TTS playback, back to ACTIVATED.
#[tokio::test(start_paused = true)]
async fn s1_natural_reply_non_streaming() {
    let services = harness(|_| {});
    let states = collect_states(&services);

    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();

    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    settle(100).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Listening));

    // Wake word, then the auto-capture chain into RECORDING.
    push_audio(&services, &id, wake_chunk());
    settle(600).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Recording));

    // Speech, then sustained silence past the 2s VAD threshold.
    for _ in 0..3 {
        push_audio(&services, &id, speech_chunk());
    }
    for _ in 0..7 {
        push_audio(&services, &id, silence_chunk());
    }
    // Recording ends, tail padding elapses, mock transcription returns.
    settle(2_000).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));
    let transcript = services
        .store
        .select(|s| s.sessions[&id].last_transcript.clone());
    assert_eq!(transcript.as_deref(), Some("hello world"));

    // LLM claims the turn, finishes, TTS plays and finishes.
    for action in [
        Action::LlmReplyStarted {
            session_id: id.clone(),
        },
        Action::LlmReplyFinished {
            session_id: id.clone(),
        },
        Action::TtsPlaybackStarted {
            session_id: id.clone(),
        },
        Action::TtsPlaybackFinished {
            session_id: id.clone(),
        },
    ] {
        services.effects.submit(action).unwrap();
        settle(200).await;
    }
    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));

    let observed = dedup(&states.lock());
    assert_eq!(
        observed,
        vec![
            FcmState::Listening,
            FcmState::Activated,
            FcmState::Recording,
            FcmState::Transcribing,
            FcmState::Activated,
            FcmState::Busy,
            FcmState::Activated,
        ],
    );
}

/// No LLM takeover: the llm_claim timer fires and the session returns to
/// ACTIVATED with the awake timer armed; no spurious BUSY entries.
#[tokio::test(start_paused = true)]
async fn s2_no_llm_takeover() {
    let services = harness(|_| {});
    let states = collect_states(&services);

    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();
    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    push_audio(&services, &id, wake_chunk());
    settle(600).await;
    for _ in 0..3 {
        push_audio(&services, &id, speech_chunk());
    }
    for _ in 0..7 {
        push_audio(&services, &id, silence_chunk());
    }
    settle(2_000).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));

    // Nobody claims the turn within llmClaimTtl.
    settle(4_000).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));
    assert!(
        services.timers.remaining(&id, "awake").is_some(),
        "awake timer must be re-armed after the claim window expires"
    );
    assert!(
        !states.lock().contains(&FcmState::Busy),
        "no spurious BUSY entries"
    );
}

/// Voice barge-in during BUSY jumps straight to RECORDING and stops the
/// reply machinery exactly once.
#[tokio::test(start_paused = true)]
async fn s3_voice_barge_in() {
    let services = harness(|config| {
        config.fcm.auto_capture_on_wake = false;
    });

    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();
    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::WakeTriggered {
            session_id: id.clone(),
            timestamp: 1.0,
            keyword: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::LlmReplyStarted {
            session_id: id.clone(),
        })
        .unwrap();
    settle(100).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Busy));

    // Live speech while the reply plays: VAD reports is_speech=true.
    for _ in 0..2 {
        push_audio(&services, &id, speech_chunk());
    }
    settle(300).await;

    services
        .effects
        .submit(Action::InterruptReply {
            session_id: id.clone(),
            source: InterruptSource::Voice,
            target: InterruptTarget::Both,
        })
        .unwrap();
    settle(100).await;

    assert_eq!(state_of(&services, &id), Some(FcmState::Recording));
    let runtime = services.effects.runtime(&id).unwrap();
    assert_eq!(
        runtime.tts_stops.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "TTS stopped exactly once"
    );
    assert_eq!(
        runtime.llm_cancels.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "LLM stream cancelled exactly once"
    );
}

/// Unlimited recording: the watchdog warns but never terminates; an
/// explicit end_recording completes normally.
#[tokio::test(start_paused = true)]
async fn s6_unlimited_recording_watchdog() {
    let services = harness(|config| {
        config.fcm.max_recording_ms = -1;
        config.fcm.auto_capture_on_wake = false;
        config.fcm.session_idle_timeout_ms = 3_600_000;
    });

    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();
    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::WakeTriggered {
            session_id: id.clone(),
            timestamp: 0.5,
            keyword: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::StartRecording {
            session_id: id.clone(),
        })
        .unwrap();
    settle(100).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Recording));

    // Push a little speech, then run for over ten minutes.
    push_audio(&services, &id, speech_chunk());
    tokio::time::sleep(Duration::from_secs(620)).await;
    assert_eq!(
        state_of(&services, &id),
        Some(FcmState::Recording),
        "watchdog must not auto-terminate an unlimited recording"
    );

    services
        .effects
        .submit(Action::EndRecording {
            session_id: id.clone(),
            trigger: asrhub_core::fcm::CaptureTrigger::Manual,
        })
        .unwrap();
    settle(2_000).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));
}

/// Destroying a session cascades: timers cancelled, queue closed, state
/// removed, `session_destroyed` emitted.
#[tokio::test(start_paused = true)]
async fn session_destroy_cascades() {
    let services = harness(|_| {});
    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();
    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    push_audio(&services, &id, speech_chunk());
    settle(100).await;

    let mut rx = services.bridge.subscribe();
    services
        .effects
        .submit(Action::SessionDestroy {
            session_id: id.clone(),
        })
        .unwrap();
    settle(200).await;

    assert_eq!(services.effects.session_count(), 0);
    assert!(services.registry.state(&id).is_none());
    assert_eq!(services.timers.running(), 0);
    assert!(!services.store.select(|s| s.sessions.contains_key(&id)));

    let mut destroyed = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, OutboundEvent::SessionDestroyed { .. }) {
            destroyed = true;
        }
    }
    assert!(destroyed, "session_destroyed event must be emitted");
}

/// Idle sessions are reaped after sessionIdleTimeoutMs without events.
#[tokio::test(start_paused = true)]
async fn idle_session_is_destroyed() {
    let services = harness(|config| {
        config.fcm.session_idle_timeout_ms = 5_000;
    });
    let id = services
        .effects
        .create_session(Strategy::NonStreaming, None)
        .unwrap();
    assert_eq!(services.effects.session_count(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(services.effects.session_count(), 0);
    assert!(services.registry.state(&id).is_none());
}

/// Streaming strategy: capture windows produce incremental transcripts and
/// the capture ends back in ACTIVATED.
#[tokio::test(start_paused = true)]
async fn streaming_capture_emits_transcripts() {
    let services = harness(|config| {
        config.fcm.auto_capture_on_wake = false;
    });
    let id = services
        .effects
        .create_session(Strategy::Streaming, None)
        .unwrap();

    let transcripts: Arc<Mutex<Vec<(String, bool)>>> = Arc::default();
    let sink = Arc::clone(&transcripts);
    let mut rx = services.bridge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let OutboundEvent::Transcript { text, is_final, .. } = event {
                sink.lock().push((text, is_final));
            }
        }
    });

    services
        .effects
        .submit(Action::StartListening {
            session_id: id.clone(),
            sample_rate: None,
            channels: None,
            format: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::WakeTriggered {
            session_id: id.clone(),
            timestamp: 0.5,
            keyword: None,
        })
        .unwrap();
    services
        .effects
        .submit(Action::StartAsrStreaming {
            session_id: id.clone(),
        })
        .unwrap();
    settle(100).await;
    assert_eq!(state_of(&services, &id), Some(FcmState::Streaming));

    // Push 4s of speech: enough for at least one 3s dynamic window.
    for _ in 0..10 {
        push_audio(&services, &id, speech_chunk());
    }
    settle(1_000).await;

    services
        .effects
        .submit(Action::EndAsrStreaming {
            session_id: id.clone(),
            trigger: asrhub_core::fcm::CaptureTrigger::Manual,
        })
        .unwrap();
    settle(1_000).await;

    assert_eq!(state_of(&services, &id), Some(FcmState::Activated));
    let collected = transcripts.lock().clone();
    assert!(
        !collected.is_empty(),
        "streaming capture must emit transcript segments"
    );
    assert!(
        collected.iter().any(|(_, is_final)| *is_final),
        "the flushed remainder must be marked final"
    );
}
