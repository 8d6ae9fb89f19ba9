//! Session effects: the business glue between transports, the store, the
//! audio pipeline and the provider pool.
//!
//! One `SessionEffects` instance runs per process. For each session it owns
//! the FCM (through the registry), the audio queue, the detector tasks and
//! the timers, and it brokers provider leases for transcription. All actions
//! for one session are processed in arrival order by that session's task;
//! different sessions proceed in parallel.

mod detectors;
mod registry;

pub use registry::FcmRegistry;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioQueue;
use crate::clock::{session_id as new_session_id, HubClock};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::events::{iso_timestamp, EventBridge, EventSink, OutboundEvent};
use crate::fcm::{
    CaptureTrigger, Directive, Fcm, FcmState, Strategy, TimerKind, Transition,
};
use crate::provider::{PoolError, ProviderPool};
use crate::services::{
    Converter, Denoiser, EnhancePurpose, Enhancer, RecorderService, VadDetector, WakeWordDetector,
};
use crate::store::{Action, StateStore};
use crate::timer::{TimerCallback, TimerService};

/// Delay before an auto-capture chain fires after entering ACTIVATED.
const AUTO_CAPTURE_DELAY: Duration = Duration::from_millis(150);

/// Telemetry watchdog for unlimited recordings.
const RECORDING_WATCHDOG: Duration = Duration::from_secs(600);
const RECORDING_WATCHDOG_TIMER: &str = "recording_watchdog";

/// The pluggable pipeline services, shared across sessions.
///
/// VAD and wake-word detectors are per-session (they carry rolling state),
/// so the set holds factories for those two.
#[derive(Clone)]
pub struct ServiceSet {
    pub converter: Arc<dyn Converter>,
    pub enhancer: Arc<dyn Enhancer>,
    pub denoiser: Arc<dyn Denoiser>,
    pub vad: Arc<dyn Fn() -> Arc<dyn VadDetector> + Send + Sync>,
    pub wake: Arc<dyn Fn() -> Arc<dyn WakeWordDetector> + Send + Sync>,
}

impl ServiceSet {
    /// The built-in reference implementations.
    #[must_use]
    pub fn reference() -> Self {
        Self {
            converter: Arc::new(crate::services::LinearConverter),
            enhancer: Arc::new(crate::services::PassthroughEnhancer),
            denoiser: Arc::new(crate::services::PassthroughDenoiser),
            vad: Arc::new(|| Arc::new(crate::services::EnergyVad::default()) as Arc<dyn VadDetector>),
            wake: Arc::new(|| {
                Arc::new(crate::services::ScriptedWakeWord::default()) as Arc<dyn WakeWordDetector>
            }),
        }
    }
}

/// Per-session runtime owned by the effects layer.
pub struct SessionRuntime {
    pub id: String,
    pub strategy: Strategy,
    pub queue: Arc<AudioQueue>,
    job_tx: mpsc::UnboundedSender<Action>,
    pub vad: Arc<dyn VadDetector>,
    pub voice_active: Arc<AtomicBool>,
    wake_timestamp: Mutex<Option<f64>>,
    capture_started_at: Mutex<Option<f64>>,
    recording_counter: AtomicU32,
    /// How many times TTS playback was stopped by an interrupt.
    pub tts_stops: AtomicU32,
    /// How many times an LLM stream was cancelled by an interrupt.
    pub llm_cancels: AtomicU32,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionRuntime {
    /// Enqueues an action onto this session's ordered job channel.
    pub fn submit(&self, action: Action) {
        if self.job_tx.send(action).is_err() {
            log::debug!("[Effects:{}] job channel closed, action dropped", self.id);
        }
    }
}

/// The process-wide effects dispatcher.
pub struct SessionEffects {
    clock: Arc<HubClock>,
    config: Arc<HubConfig>,
    store: Arc<StateStore>,
    timers: Arc<TimerService>,
    registry: Arc<FcmRegistry>,
    pool: Arc<ProviderPool>,
    bridge: Arc<EventBridge>,
    recorder: Arc<RecorderService>,
    services: ServiceSet,
    sessions: DashMap<String, Arc<SessionRuntime>>,
    cancel: CancellationToken,
}

impl SessionEffects {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        clock: Arc<HubClock>,
        config: Arc<HubConfig>,
        store: Arc<StateStore>,
        timers: Arc<TimerService>,
        registry: Arc<FcmRegistry>,
        pool: Arc<ProviderPool>,
        bridge: Arc<EventBridge>,
        recorder: Arc<RecorderService>,
        services: ServiceSet,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            config,
            store,
            timers,
            registry,
            pool,
            bridge,
            recorder,
            services,
            sessions: DashMap::new(),
            cancel,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn config(&self) -> &Arc<HubConfig> {
        &self.config
    }

    /// Live session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runtime handle for a session (tests and introspection).
    #[must_use]
    pub fn runtime(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.get(session_id).map(|r| Arc::clone(r.value()))
    }

    /// Creates a session: registers the FCM, spawns the session task and the
    /// detector loops, arms the idle timer, and announces the session.
    pub fn create_session(
        self: &Arc<Self>,
        strategy: Strategy,
        request_id: Option<String>,
    ) -> HubResult<String> {
        let id = new_session_id();
        let fcm = Fcm::new(&id, strategy, self.config.fcm.clone(), Arc::clone(&self.clock));
        let voice_active = self.registry.register(&id, fcm);

        let queue = Arc::new(AudioQueue::new(
            Arc::clone(&self.clock),
            self.config.queue.clone(),
        ));
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(SessionRuntime {
            id: id.clone(),
            strategy,
            queue,
            job_tx,
            vad: (self.services.vad)(),
            voice_active,
            wake_timestamp: Mutex::new(None),
            capture_started_at: Mutex::new(None),
            recording_counter: AtomicU32::new(0),
            tts_stops: AtomicU32::new(0),
            llm_cancels: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        self.sessions.insert(id.clone(), Arc::clone(&runtime));

        self.store.dispatch(&Action::SessionCreate {
            strategy,
            request_id: request_id.clone(),
            session_id: Some(id.clone()),
        })?;

        self.touch_idle_timer(&runtime);
        self.spawn_session_task(&runtime, job_rx);
        detectors::spawn_all(self, &runtime);

        self.bridge.emit(OutboundEvent::SessionCreated {
            session_id: id.clone(),
            request_id,
            timestamp: iso_timestamp(),
        });
        log::info!("[Effects] session {} created ({:?})", id, strategy);
        Ok(id)
    }

    /// Routes an inbound action to its session's ordered channel.
    ///
    /// Unknown sessions surface a validation error and exactly one
    /// `error_reported` event.
    pub fn submit(&self, action: Action) -> HubResult<()> {
        let Some(session_id) = action.session_id().map(str::to_string) else {
            return Err(HubError::Validation(
                "action carries no session_id".to_string(),
            ));
        };
        let Some(runtime) = self.runtime(&session_id) else {
            let err = HubError::UnknownSession(session_id.clone());
            self.bridge.emit(OutboundEvent::error_reported(
                &session_id,
                err.code(),
                &err.to_string(),
            ));
            return Err(err);
        };
        runtime.submit(action);
        Ok(())
    }

    /// Destroys every session and drains the pool. Used at shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            if let Some(runtime) = self.runtime(&id) {
                runtime.submit(Action::SessionDestroy { session_id: id });
            }
        }
        // Give session tasks a beat to run their teardown cascade.
        tokio::task::yield_now().await;
        self.pool.drain();
        self.cancel.cancel();
    }

    fn spawn_session_task(
        self: &Arc<Self>,
        runtime: &Arc<SessionRuntime>,
        mut job_rx: mpsc::UnboundedReceiver<Action>,
    ) {
        let effects = Arc::clone(self);
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            while let Some(action) = job_rx.recv().await {
                if !effects.process(&runtime, action).await {
                    break;
                }
            }
            log::debug!("[Effects:{}] session task exited", runtime.id);
        });
    }

    /// Processes one action for one session, in arrival order.
    /// Returns false when the session was torn down.
    async fn process(self: &Arc<Self>, runtime: &Arc<SessionRuntime>, action: Action) -> bool {
        match action {
            Action::SessionDestroy { .. } => {
                self.teardown(runtime).await;
                return false;
            }
            Action::TimeoutFired {
                timer: TimerKind::SessionIdle,
                ..
            } => {
                // Idle sessions are destroyed, cascading the full teardown.
                log::info!("[Effects:{}] idle timeout, destroying session", runtime.id);
                self.teardown(runtime).await;
                return false;
            }
            action => {
                self.touch_idle_timer(runtime);
                match action {
                    Action::AudioChunk {
                        session_id,
                        chunk_id,
                        audio,
                        ..
                    } => {
                        self.handle_audio_chunk(runtime, &session_id, chunk_id, audio);
                    }
                    Action::AudioMetadata { .. } => {
                        let _ = self.store.dispatch(&action);
                        self.bridge.emit(OutboundEvent::AudioMetadataAck {
                            session_id: runtime.id.clone(),
                            timestamp: iso_timestamp(),
                        });
                    }
                    Action::ChunkReceived { .. }
                    | Action::ChunkUploadStart { .. }
                    | Action::ChunkUploadDone { .. }
                    | Action::FileUploadDone { .. }
                    | Action::TranscriptionStart { .. }
                    | Action::TransportDisconnected { .. } => {
                        let _ = self.store.dispatch(&action);
                    }
                    action => self.dispatch_with_fcm(runtime, action).await,
                }
            }
        }
        true
    }

    /// Dispatches an FCM-relevant action and interprets the transition.
    async fn dispatch_with_fcm(self: &Arc<Self>, runtime: &Arc<SessionRuntime>, action: Action) {
        match self.store.dispatch(&action) {
            Ok(outcome) => {
                if let Some(transition) = outcome.transition {
                    self.apply_transition(runtime, &action, transition).await;
                }
            }
            Err(HubError::TransitionRejected(reason)) => {
                log::debug!("[Effects:{}] {}", runtime.id, reason);
            }
            Err(err) => {
                self.bridge.emit(OutboundEvent::error_reported(
                    &runtime.id,
                    err.code(),
                    &err.to_string(),
                ));
            }
        }
    }

    /// Executes a transition's directives and the per-action side effects.
    async fn apply_transition(
        self: &Arc<Self>,
        runtime: &Arc<SessionRuntime>,
        action: &Action,
        transition: Transition,
    ) {
        log::debug!(
            "[Effects:{}] {:?} -> {:?} ({:?})",
            runtime.id,
            transition.from,
            transition.to,
            action.session_id()
        );
        self.bridge.emit(OutboundEvent::Status {
            session_id: runtime.id.clone(),
            state: transition.to,
            timestamp: iso_timestamp(),
        });

        match action {
            Action::StartListening { .. } => {
                self.bridge.emit(OutboundEvent::ListeningStarted {
                    session_id: runtime.id.clone(),
                    timestamp: iso_timestamp(),
                });
            }
            Action::WakeTriggered {
                timestamp, keyword, ..
            } => {
                *runtime.wake_timestamp.lock() = Some(*timestamp);
                self.bridge.emit(OutboundEvent::PlayAsrFeedback {
                    session_id: runtime.id.clone(),
                    keyword: keyword.clone(),
                    timestamp: iso_timestamp(),
                });
            }
            Action::TranscriptionDone {
                text,
                confidence,
                language,
                ..
            } => {
                self.bridge.emit(OutboundEvent::TranscribeDone {
                    session_id: runtime.id.clone(),
                    text: text.clone(),
                    confidence: confidence.unwrap_or(0.0),
                    language: language.clone(),
                    timestamp: iso_timestamp(),
                });
            }
            Action::ErrorOccurred {
                error_code,
                error_message,
                ..
            } => {
                self.bridge.emit(OutboundEvent::error_reported(
                    &runtime.id,
                    error_code,
                    error_message,
                ));
            }
            _ => {}
        }

        for directive in &transition.directives {
            match directive {
                Directive::ArmTimer(kind) => self.arm_timer(runtime, *kind),
                Directive::DisarmTimer(kind) => self.timers.cancel(&runtime.id, kind.name()),
                Directive::StopTts => {
                    runtime.tts_stops.fetch_add(1, Ordering::SeqCst);
                    log::info!("[Effects:{}] stopping TTS playback", runtime.id);
                }
                Directive::CancelLlm => {
                    runtime.llm_cancels.fetch_add(1, Ordering::SeqCst);
                    log::info!("[Effects:{}] cancelling LLM stream", runtime.id);
                }
                Directive::ScheduleAutoCapture => self.schedule_auto_capture(runtime),
                Directive::EmitCaptureStarted => self.on_capture_started(runtime, transition.to),
                Directive::EmitCaptureEnded => self.on_capture_ended(runtime, transition.from),
            }
        }

        // A finished recording flows into transcription.
        if transition.from == FcmState::Recording && transition.to == FcmState::Transcribing {
            let trigger = match action {
                Action::EndRecording { trigger, .. } => *trigger,
                _ => CaptureTrigger::Timeout,
            };
            self.spawn_finalize_utterance(runtime, trigger);
        }
    }

    fn timer_callback(runtime: &Arc<SessionRuntime>, kind: TimerKind) -> TimerCallback {
        let tx = runtime.job_tx.clone();
        let session_id = runtime.id.clone();
        Arc::new(move |_, _| {
            let _ = tx.send(Action::TimeoutFired {
                session_id: session_id.clone(),
                timer: kind,
            });
        })
    }

    fn arm_timer(&self, runtime: &Arc<SessionRuntime>, kind: TimerKind) {
        let millis = match kind {
            TimerKind::Awake => self.config.fcm.awake_timeout_ms,
            TimerKind::LlmClaim => self.config.fcm.llm_claim_ttl_ms,
            TimerKind::TtsClaim => self.config.fcm.tts_claim_ttl_ms,
            TimerKind::Recording => self.config.fcm.max_recording_ms.max(0) as u64,
            TimerKind::Streaming => self.config.fcm.max_streaming_ms.max(0) as u64,
            TimerKind::SessionIdle => self.config.fcm.session_idle_timeout_ms,
        };
        self.timers.reset(
            &runtime.id,
            kind.name(),
            Some(Duration::from_millis(millis)),
            Self::timer_callback(runtime, kind),
        );
    }

    /// Re-arms the idle timer; called on every inbound event for the session.
    fn touch_idle_timer(&self, runtime: &Arc<SessionRuntime>) {
        self.timers.reset(
            &runtime.id,
            TimerKind::SessionIdle.name(),
            Some(Duration::from_millis(self.config.fcm.session_idle_timeout_ms)),
            Self::timer_callback(runtime, TimerKind::SessionIdle),
        );
    }

    fn schedule_auto_capture(&self, runtime: &Arc<SessionRuntime>) {
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_CAPTURE_DELAY).await;
            let action = match runtime.strategy {
                Strategy::NonStreaming => Action::StartRecording {
                    session_id: runtime.id.clone(),
                },
                Strategy::Streaming => Action::StartAsrStreaming {
                    session_id: runtime.id.clone(),
                },
                Strategy::Batch => return,
            };
            // Stale wakes are rejected by the FCM tables; just submit.
            runtime.submit(action);
        });
    }

    fn on_capture_started(&self, runtime: &Arc<SessionRuntime>, state: FcmState) {
        let now = self.clock.now();
        *runtime.capture_started_at.lock() = Some(now);
        runtime.vad.reset();

        self.bridge.emit(OutboundEvent::AsrCaptureStarted {
            session_id: runtime.id.clone(),
            state,
            timestamp: iso_timestamp(),
        });

        // Unlimited recordings get a telemetry watchdog, never a hard stop.
        if state == FcmState::Recording && self.config.fcm.max_recording_ms < 0 {
            let session_id = runtime.id.clone();
            self.timers.start(
                &runtime.id,
                RECORDING_WATCHDOG_TIMER,
                RECORDING_WATCHDOG,
                Arc::new(move |_, _| {
                    log::warn!(
                        "[Effects:{}] recording has been running for over {}s with no cap",
                        session_id,
                        RECORDING_WATCHDOG.as_secs()
                    );
                }),
            );
        }

        if state == FcmState::Recording && self.config.services.recording_enabled {
            let n = runtime.recording_counter.fetch_add(1, Ordering::SeqCst);
            let filename = format!("{}-{:03}.wav", runtime.id, n);
            let metadata = serde_json::json!({ "strategy": format!("{:?}", runtime.strategy) });
            if let Err(err) = self.recorder.start(&runtime.id, &filename, metadata) {
                log::warn!("[Effects:{}] recorder start failed: {}", runtime.id, err);
                return;
            }
            // Pre-roll: seed the file from before the wake word.
            let wake_ts = runtime.wake_timestamp.lock().unwrap_or(now);
            let start = (wake_ts - self.config.services.pre_roll_secs).max(0.0);
            for chunk in runtime.queue.get_between(start, now) {
                if let Err(err) = self.recorder.write(&runtime.id, &chunk.audio) {
                    log::warn!("[Effects:{}] pre-roll write failed: {}", runtime.id, err);
                    break;
                }
            }
            let _ = self.recorder.add_marker(
                &runtime.id,
                wake_ts,
                "wake",
                serde_json::json!({ "pre_roll_secs": self.config.services.pre_roll_secs }),
            );
        }
    }

    fn on_capture_ended(&self, runtime: &Arc<SessionRuntime>, state: FcmState) {
        self.timers.cancel(&runtime.id, RECORDING_WATCHDOG_TIMER);
        self.bridge.emit(OutboundEvent::AsrCaptureEnded {
            session_id: runtime.id.clone(),
            state,
            timestamp: iso_timestamp(),
        });
        if self.recorder.is_recording(&runtime.id) {
            match self.recorder.stop(&runtime.id) {
                Ok(paths) => log::info!(
                    "[Effects:{}] recording finalized: {} file(s)",
                    runtime.id,
                    paths.len()
                ),
                Err(err) => log::warn!("[Effects:{}] recorder stop failed: {}", runtime.id, err),
            }
        }
    }

    /// Collects the finished utterance (with pre-roll and tail padding),
    /// runs the optional cleanup stages, leases a provider and transcribes.
    fn spawn_finalize_utterance(self: &Arc<Self>, runtime: &Arc<SessionRuntime>, trigger: CaptureTrigger) {
        let effects = Arc::clone(self);
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            effects.finalize_utterance(&runtime, trigger).await;
        });
    }

    async fn finalize_utterance(&self, runtime: &Arc<SessionRuntime>, trigger: CaptureTrigger) {
        let services = &self.config.services;
        // Short hold so trailing audio lands in the queue (tail padding).
        tokio::time::sleep(Duration::from_secs_f64(services.tail_padding_secs)).await;

        let now = self.clock.now();
        let capture_start = runtime.capture_started_at.lock().unwrap_or(now);
        let wake_ts = runtime.wake_timestamp.lock().unwrap_or(capture_start);
        let start = capture_start.min(wake_ts - services.pre_roll_secs).max(0.0);
        let chunks = runtime.queue.get_between(start, now);
        let mut utterance = Vec::new();
        for chunk in &chunks {
            utterance.extend_from_slice(&chunk.audio);
        }
        log::debug!(
            "[Effects:{}] finalizing utterance: {} bytes, trigger {:?}",
            runtime.id,
            utterance.len(),
            trigger
        );

        let mut audio = Bytes::from(utterance);
        if services.denoise_enabled {
            match self.services.denoiser.denoise(&audio) {
                Ok(clean) => audio = clean,
                Err(err) => self.soft_service_error(&runtime.id, "denoise", &err.to_string()),
            }
        }
        if services.enhance_enabled {
            match self
                .services
                .enhancer
                .auto_enhance(&audio, EnhancePurpose::Asr)
            {
                Ok((enhanced, _report)) => audio = enhanced,
                Err(err) => self.soft_service_error(&runtime.id, "enhance", &err.to_string()),
            }
        }

        let _ = self.store.dispatch(&Action::TranscriptionStart {
            session_id: runtime.id.clone(),
        });

        let acquire_timeout = Duration::from_secs(self.pool_acquire_timeout_secs());
        let lease = match self.pool.lease(&runtime.id, acquire_timeout).await {
            Ok(lease) => lease,
            Err(err) => {
                let err = match err {
                    PoolError::AcquireTimeout => {
                        HubError::AcquireTimeout(acquire_timeout.as_secs_f64())
                    }
                    PoolError::QuotaExceeded => HubError::QuotaExceeded(runtime.id.clone()),
                    PoolError::PoolDraining => HubError::PoolDraining,
                };
                self.hard_error(runtime, &err);
                return;
            }
        };

        match lease
            .transcribe(audio, crate::audio::AudioFormat::HUB)
            .await
        {
            Ok(transcript) => {
                lease.release().await;
                runtime.submit(Action::TranscriptionDone {
                    session_id: runtime.id.clone(),
                    text: transcript.text,
                    confidence: Some(transcript.confidence),
                    language: transcript.language,
                });
            }
            Err(err) => {
                lease.release().await;
                self.hard_error(runtime, &HubError::ProviderFailure(err.to_string()));
            }
        }
    }

    fn pool_acquire_timeout_secs(&self) -> u64 {
        self.config
            .providers
            .values()
            .find(|p| p.enabled)
            .map(|p| p.acquire_timeout_secs)
            .unwrap_or(10)
    }

    /// Soft errors log, emit, and skip the stage; the session continues.
    fn soft_service_error(&self, session_id: &str, stage: &str, message: &str) {
        log::warn!("[Effects:{}] {} skipped: {}", session_id, stage, message);
        self.bridge.emit(OutboundEvent::error_reported(
            session_id,
            "service_unavailable",
            message,
        ));
    }

    /// Hard errors become an `error` action, sending the FCM to ERROR.
    fn hard_error(&self, runtime: &Arc<SessionRuntime>, err: &HubError) {
        log::error!("[Effects:{}] hard error: {}", runtime.id, err);
        runtime.submit(Action::ErrorOccurred {
            session_id: runtime.id.clone(),
            error_code: err.code().to_string(),
            error_message: err.to_string(),
        });
    }

    fn handle_audio_chunk(
        &self,
        runtime: &Arc<SessionRuntime>,
        session_id: &str,
        chunk_id: Option<String>,
        audio: Bytes,
    ) {
        let format = self
            .store
            .select(|s| s.sessions.get(session_id).map(|session| session.audio_format))
            .unwrap_or_default();

        let hub_audio = match self.services.converter.to_hub_format(&audio, format) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.soft_service_error(session_id, "convert", &err.to_string());
                return;
            }
        };

        let timestamp = match runtime.queue.push(hub_audio) {
            Ok(ts) => ts,
            Err(err) => {
                log::debug!("[Effects:{}] push after close: {}", session_id, err);
                return;
            }
        };

        let bytes = audio.len();
        let _ = self.store.dispatch(&Action::AudioChunk {
            session_id: session_id.to_string(),
            chunk_id: chunk_id.clone(),
            timestamp: Some(timestamp),
            audio: Bytes::new(),
        });
        self.bridge.emit(OutboundEvent::AudioReceived {
            session_id: session_id.to_string(),
            chunk_id,
            bytes,
            timestamp: iso_timestamp(),
        });
    }

    /// Destruction cascade: timers, queue cursors, recorder, registry, store.
    async fn teardown(&self, runtime: &Arc<SessionRuntime>) {
        log::info!("[Effects:{}] destroying session", runtime.id);
        self.timers.cancel_all(&runtime.id);
        // Closing the queue wakes every detector loop, which then exits.
        runtime.queue.close();
        if self.recorder.is_recording(&runtime.id) {
            let _ = self.recorder.stop(&runtime.id);
        }

        // Detector loops notice the closed queue on their next pull; give
        // them a moment, then drop whatever is left.
        tokio::task::yield_now().await;
        for task in runtime.tasks.lock().drain(..) {
            task.abort();
        }

        self.registry.unregister(&runtime.id);
        self.sessions.remove(&runtime.id);
        let _ = self.store.dispatch(&Action::SessionDestroy {
            session_id: runtime.id.clone(),
        });
        self.bridge.emit(OutboundEvent::SessionDestroyed {
            session_id: runtime.id.clone(),
            timestamp: iso_timestamp(),
        });
    }
}
