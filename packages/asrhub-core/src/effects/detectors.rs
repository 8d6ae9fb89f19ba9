//! Per-session detector tasks.
//!
//! Each detector owns one named queue reader and one buffer manager, and
//! exits when its cursor closes with the session. Detector loops never block
//! the queue writer: overflow follows the recipe's configured strategy and
//! at worst marks the reader lagged.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::{SessionEffects, SessionRuntime};
use crate::audio::{AudioQueue, BufferManager, QueueError, TimestampedChunk};
use crate::config::OverflowStrategy;
use crate::events::{iso_timestamp, EventSink, OutboundEvent};
use crate::fcm::{FcmState, Strategy};
use crate::store::Action;

/// How long a pull parks before re-checking for cancellation.
const PULL_TIMEOUT: Duration = Duration::from_millis(250);

const READER_WAKE: &str = "wake_word";
const READER_VAD: &str = "vad";
const READER_RECORDING: &str = "recording";
const READER_STREAMING: &str = "streaming_asr";

/// Spawns every detector the configuration enables for this session.
pub(super) fn spawn_all(effects: &Arc<SessionEffects>, runtime: &Arc<SessionRuntime>) {
    let mut tasks = Vec::new();
    let services = &effects.config().services;

    if services.wakeword_enabled {
        let effects = Arc::clone(effects);
        let runtime = Arc::clone(runtime);
        tasks.push(tokio::spawn(async move {
            wake_loop(effects, runtime).await;
        }));
    }
    if services.vad_enabled {
        let effects = Arc::clone(effects);
        let runtime = Arc::clone(runtime);
        tasks.push(tokio::spawn(async move {
            vad_loop(effects, runtime).await;
        }));
    }
    if services.recording_enabled {
        let effects = Arc::clone(effects);
        let runtime = Arc::clone(runtime);
        tasks.push(tokio::spawn(async move {
            recording_loop(effects, runtime).await;
        }));
    }
    if runtime.strategy == Strategy::Streaming {
        let effects = Arc::clone(effects);
        let runtime = Arc::clone(runtime);
        tasks.push(tokio::spawn(async move {
            streaming_loop(effects, runtime).await;
        }));
    }

    runtime.tasks.lock().extend(tasks);
}

/// Pulls the next chunk or reports that the loop should exit.
async fn next_chunk(queue: &AudioQueue, reader: &str) -> Result<Option<TimestampedChunk>, ()> {
    match queue.pull_blocking(reader, PULL_TIMEOUT).await {
        Ok(chunk) => Ok(chunk),
        Err(QueueError::Closed) | Err(QueueError::UnknownReader(_)) => Err(()),
    }
}

/// Feeds a buffer, applying the recipe's overflow strategy.
///
/// Returns false if the chunk was dropped (drop_newest / block).
fn push_with_overflow(
    effects: &SessionEffects,
    session_id: &str,
    reader: &str,
    buffer: &mut BufferManager,
    audio: &[u8],
) -> bool {
    match buffer.push(audio) {
        Ok(_) => true,
        Err(err) => {
            log::warn!("[Detector:{}:{}] {}", session_id, reader, err);
            effects.bridge().emit(OutboundEvent::error_reported(
                session_id,
                "buffer_overflow",
                &format!("{reader}: {err}"),
            ));
            match buffer.config().overflow_strategy {
                OverflowStrategy::DropOldest => {
                    buffer.make_room(audio.len());
                    buffer.push(audio).is_ok()
                }
                // Block degrades to dropping the newest window: detector
                // loops must never stall the queue writer.
                OverflowStrategy::DropNewest | OverflowStrategy::Block => false,
            }
        }
    }
}

/// Wake-word loop: active while LISTENING, silent otherwise.
async fn wake_loop(effects: Arc<SessionEffects>, runtime: Arc<SessionRuntime>) {
    let Some(recipe) = effects.config().buffer_recipe(READER_WAKE) else {
        return;
    };
    let mut buffer = BufferManager::new(recipe);
    let detector = (effects.services.wake)();
    runtime.queue.open_reader(READER_WAKE, None);

    while let Ok(pulled) = next_chunk(&runtime.queue, READER_WAKE).await {
        let Some(chunk) = pulled else { continue };
        if effects.registry.state(&runtime.id) != Some(FcmState::Listening) {
            buffer.reset();
            continue;
        }
        if !push_with_overflow(&effects, &runtime.id, READER_WAKE, &mut buffer, &chunk.audio) {
            continue;
        }
        while let Some(frame) = buffer.pop() {
            match detector.detect(&frame) {
                Ok(result) if result.triggered => {
                    log::info!(
                        "[Detector:{}] wake word {:?} at {:.2}s",
                        runtime.id,
                        result.keyword,
                        chunk.timestamp
                    );
                    runtime.submit(Action::WakeTriggered {
                        session_id: runtime.id.clone(),
                        timestamp: chunk.timestamp,
                        keyword: result.keyword,
                    });
                    buffer.reset();
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("[Detector:{}] wake detect skipped: {}", runtime.id, err);
                    break;
                }
            }
        }
    }
    log::debug!("[Detector:{}] wake loop exited", runtime.id);
}

/// VAD loop: keeps the live-voice flag fresh and ends captures on sustained
/// silence.
async fn vad_loop(effects: Arc<SessionEffects>, runtime: Arc<SessionRuntime>) {
    let Some(recipe) = effects.config().buffer_recipe(READER_VAD) else {
        return;
    };
    let mut buffer = BufferManager::new(recipe);
    let threshold = effects.config().services.silence_threshold_secs;
    runtime.queue.open_reader(READER_VAD, None);

    while let Ok(pulled) = next_chunk(&runtime.queue, READER_VAD).await {
        let Some(chunk) = pulled else { continue };
        if !push_with_overflow(&effects, &runtime.id, READER_VAD, &mut buffer, &chunk.audio) {
            continue;
        }
        while let Some(frame) = buffer.pop() {
            let result = match runtime.vad.detect(&frame) {
                Ok(result) => result,
                Err(err) => {
                    log::warn!("[Detector:{}] vad detect skipped: {}", runtime.id, err);
                    break;
                }
            };
            runtime
                .voice_active
                .store(result.is_speech, Ordering::Relaxed);

            let state = effects.registry.state(&runtime.id);
            if result.silence_duration >= threshold {
                match state {
                    Some(FcmState::Recording) => {
                        runtime.submit(Action::EndRecording {
                            session_id: runtime.id.clone(),
                            trigger: crate::fcm::CaptureTrigger::VadTimeout,
                        });
                        runtime.vad.reset();
                    }
                    Some(FcmState::Streaming) => {
                        runtime.submit(Action::EndAsrStreaming {
                            session_id: runtime.id.clone(),
                            trigger: crate::fcm::CaptureTrigger::VadTimeout,
                        });
                        runtime.vad.reset();
                    }
                    _ => {}
                }
            }
        }
    }
    log::debug!("[Detector:{}] vad loop exited", runtime.id);
}

/// Recording loop: streams queue audio into the recorder while active.
async fn recording_loop(effects: Arc<SessionEffects>, runtime: Arc<SessionRuntime>) {
    runtime.queue.open_reader(READER_RECORDING, None);
    while let Ok(pulled) = next_chunk(&runtime.queue, READER_RECORDING).await {
        let Some(chunk) = pulled else { continue };
        if !effects.recorder.is_recording(&runtime.id) {
            continue;
        }
        if let Err(err) = effects.recorder.write(&runtime.id, &chunk.audio) {
            log::warn!("[Detector:{}] recorder write failed: {}", runtime.id, err);
        }
    }
    log::debug!("[Detector:{}] recording loop exited", runtime.id);
}

/// Streaming-ASR loop: cuts dynamic windows while STREAMING and emits
/// incremental transcripts; a leftover window is flushed as final when the
/// capture ends.
async fn streaming_loop(effects: Arc<SessionEffects>, runtime: Arc<SessionRuntime>) {
    let Some(recipe) = effects.config().buffer_recipe(READER_STREAMING) else {
        return;
    };
    let mut buffer = BufferManager::new(recipe);
    runtime.queue.open_reader(READER_STREAMING, None);

    while let Ok(pulled) = next_chunk(&runtime.queue, READER_STREAMING).await {
        let streaming = effects.registry.state(&runtime.id) == Some(FcmState::Streaming);

        if let Some(chunk) = pulled {
            if streaming {
                if !push_with_overflow(
                    &effects,
                    &runtime.id,
                    READER_STREAMING,
                    &mut buffer,
                    &chunk.audio,
                ) {
                    continue;
                }
                while let Some(window) = buffer.pop() {
                    transcribe_window(&effects, &runtime, window, false).await;
                }
                continue;
            }
        }

        // Capture over: flush whatever is left as the final segment.
        if !streaming && buffer.buffered_bytes() > 0 {
            if let Some(window) = buffer.flush() {
                transcribe_window(&effects, &runtime, window, true).await;
            }
            buffer.reset();
        }
    }
    log::debug!("[Detector:{}] streaming loop exited", runtime.id);
}

/// One streaming window through the provider pool. Failures here are soft:
/// the segment is skipped and the capture continues.
async fn transcribe_window(
    effects: &Arc<SessionEffects>,
    runtime: &Arc<SessionRuntime>,
    window: Bytes,
    is_final: bool,
) {
    let timeout = Duration::from_secs(effects.pool_acquire_timeout_secs());
    let lease = match effects.pool.lease(&runtime.id, timeout).await {
        Ok(lease) => lease,
        Err(err) => {
            log::warn!(
                "[Detector:{}] streaming window dropped, no provider: {}",
                runtime.id,
                err
            );
            return;
        }
    };
    let result = lease
        .transcribe(window, crate::audio::AudioFormat::HUB)
        .await;
    lease.release().await;
    match result {
        Ok(transcript) => {
            effects.bridge().emit(OutboundEvent::Transcript {
                session_id: runtime.id.clone(),
                text: transcript.text,
                is_final,
                timestamp: iso_timestamp(),
            });
        }
        Err(err) => {
            log::warn!("[Detector:{}] streaming transcribe failed: {}", runtime.id, err);
        }
    }
}
