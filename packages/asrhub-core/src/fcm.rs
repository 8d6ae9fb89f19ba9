//! Per-session finite control machine.
//!
//! The FCM is a pure, synchronous component: it validates events against the
//! session's strategy table and the common rules, mutates its own state, runs
//! hooks, and hands back a [`Transition`] whose directives the effects layer
//! interprets (arming timers, stopping TTS, scheduling auto-capture). It
//! references the session only by id; timers and queues are owned elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::HubClock;
use crate::config::{FcmConfig, ReturnTarget};

/// Control-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FcmState {
    Idle,
    Listening,
    Activated,
    Recording,
    Streaming,
    Transcribing,
    Processing,
    Busy,
    Error,
    Recovering,
}

impl FcmState {
    /// Whether live audio capture is active in this state.
    #[must_use]
    pub fn is_capture(&self) -> bool {
        matches!(self, Self::Recording | Self::Streaming)
    }
}

/// Session strategy; fixed for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Batch,
    NonStreaming,
    Streaming,
}

/// What ended a capture phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureTrigger {
    #[default]
    Manual,
    VadTimeout,
    Timeout,
}

/// Who raised an interrupt during BUSY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptSource {
    Voice,
    Text,
    Ui,
}

/// What an interrupt cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptTarget {
    Tts,
    Llm,
    Both,
}

/// Named countdowns the FCM owns through the effects layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Awake,
    Recording,
    Streaming,
    LlmClaim,
    TtsClaim,
    SessionIdle,
}

impl TimerKind {
    /// Timer-service name for this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Awake => "awake",
            Self::Recording => "recording",
            Self::Streaming => "streaming",
            Self::LlmClaim => "llm_claim",
            Self::TtsClaim => "tts_claim",
            Self::SessionIdle => "session_idle",
        }
    }
}

/// Events the FCM understands.
#[derive(Debug, Clone, PartialEq)]
pub enum FcmEvent {
    StartListening,
    WakeTriggered { timestamp: f64 },
    StartRecording,
    EndRecording { trigger: CaptureTrigger },
    StartAsrStreaming,
    EndAsrStreaming { trigger: CaptureTrigger },
    UploadFile,
    TranscriptionDone,
    Timeout { timer: TimerKind },
    Reset,
    Fault,
    Recover,
    LlmReplyStarted,
    LlmReplyFinished,
    TtsPlaybackStarted,
    TtsPlaybackFinished,
    InterruptReply {
        source: InterruptSource,
        target: InterruptTarget,
        /// Live VAD verdict at the moment of the interrupt.
        voice_active: bool,
    },
}

/// Side effects a transition asks the effects layer to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    ArmTimer(TimerKind),
    DisarmTimer(TimerKind),
    StopTts,
    CancelLlm,
    /// Entering ACTIVATED with auto-capture enabled: schedule capture start.
    ScheduleAutoCapture,
    EmitCaptureStarted,
    EmitCaptureEnded,
}

/// A completed state change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: FcmState,
    pub to: FcmState,
    pub directives: Vec<Directive>,
}

/// Rejection of an event by the transition tables.
#[derive(Debug, Error, PartialEq)]
#[error("event {event:?} not allowed in {state:?}")]
pub struct TransitionError {
    pub state: FcmState,
    pub event: FcmEvent,
}

/// When a hook runs relative to the state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Enter,
    Exit,
}

type Hook = Box<dyn Fn(&str, FcmState) -> Result<(), String> + Send + Sync>;

/// The per-session finite control machine.
pub struct Fcm {
    session_id: String,
    strategy: Strategy,
    config: FcmConfig,
    clock: Arc<HubClock>,
    state: FcmState,
    state_entered_at: f64,
    hooks: HashMap<(FcmState, HookPhase), Vec<Hook>>,
}

impl Fcm {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        strategy: Strategy,
        config: FcmConfig,
        clock: Arc<HubClock>,
    ) -> Self {
        let state_entered_at = clock.now();
        Self {
            session_id: session_id.into(),
            strategy,
            config,
            clock,
            state: FcmState::Idle,
            state_entered_at,
            hooks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> FcmState {
        self.state
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[must_use]
    pub fn state_entered_at(&self) -> f64 {
        self.state_entered_at
    }

    /// Registers a hook for entering or exiting a state.
    pub fn add_hook(
        &mut self,
        state: FcmState,
        phase: HookPhase,
        hook: impl Fn(&str, FcmState) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.hooks
            .entry((state, phase))
            .or_default()
            .push(Box::new(hook));
    }

    fn run_hooks(&self, state: FcmState, phase: HookPhase) {
        if let Some(hooks) = self.hooks.get(&(state, phase)) {
            for hook in hooks {
                // Hook errors never abort a transition.
                if let Err(err) = hook(&self.session_id, state) {
                    log::warn!(
                        "[FCM:{}] {:?} hook for {:?} failed: {}",
                        self.session_id,
                        phase,
                        state,
                        err
                    );
                }
            }
        }
    }

    /// Applies an event: common rules first (in priority order), then the
    /// strategy table. Rejected events leave the state unchanged.
    ///
    /// Hook order: exit(old) -> state assignment -> enter(new); store
    /// listeners are notified by the caller after this returns.
    pub fn apply(&mut self, event: FcmEvent) -> Result<Transition, TransitionError> {
        let target = self
            .common_rule_target(&event)
            .or_else(|| self.strategy_target(&event));

        let Some(to) = target else {
            return Err(TransitionError {
                state: self.state,
                event,
            });
        };

        let from = self.state;
        let directives = self.directives_for(from, to, &event);

        self.run_hooks(from, HookPhase::Exit);
        self.state = to;
        self.state_entered_at = self.clock.now();
        self.run_hooks(to, HookPhase::Enter);

        Ok(Transition {
            from,
            to,
            directives,
        })
    }

    /// Common rules, applied before any strategy table.
    fn common_rule_target(&self, event: &FcmEvent) -> Option<FcmState> {
        use FcmState::*;
        match event {
            // 1. reset wins from any state.
            FcmEvent::Reset => Some(Idle),

            // 2. error handling.
            FcmEvent::Fault if self.state != Error => Some(Error),
            FcmEvent::Recover if self.state == Error => Some(Recovering),

            // 3. timeouts.
            FcmEvent::Timeout { timer } => match (timer, self.state) {
                (TimerKind::Awake, Activated) => Some(Listening),
                (TimerKind::Recording, Recording) => Some(Transcribing),
                (TimerKind::Streaming, Streaming) => Some(Activated),
                // "No LLM took over": confirm ACTIVATED and re-arm awake.
                (TimerKind::LlmClaim, Activated) => Some(Activated),
                (TimerKind::TtsClaim, Busy) => Some(Activated),
                (TimerKind::SessionIdle, _) => Some(Idle),
                _ => None,
            },

            // 4. a reply claim puts the session into BUSY.
            FcmEvent::LlmReplyStarted | FcmEvent::TtsPlaybackStarted
                if !matches!(self.state, Error | Recovering) =>
            {
                Some(Busy)
            }

            // 5. BUSY-only rules.
            FcmEvent::InterruptReply {
                source,
                voice_active,
                ..
            } if self.state == Busy => {
                if *source == InterruptSource::Voice && !self.config.allow_barge_in {
                    return None;
                }
                if *source == InterruptSource::Voice && *voice_active {
                    match self.strategy {
                        Strategy::NonStreaming => Some(Recording),
                        Strategy::Streaming => Some(Streaming),
                        Strategy::Batch => Some(Activated),
                    }
                } else {
                    Some(Activated)
                }
            }
            FcmEvent::TtsPlaybackFinished if self.state == Busy => {
                if self.config.keep_awake_after_reply {
                    Some(Activated)
                } else {
                    Some(Listening)
                }
            }
            FcmEvent::LlmReplyFinished if self.state == Busy => Some(Busy),

            _ => None,
        }
    }

    /// The strategy-specific transition table.
    fn strategy_target(&self, event: &FcmEvent) -> Option<FcmState> {
        use FcmState::*;
        match self.strategy {
            Strategy::Batch => match (self.state, event) {
                (Idle, FcmEvent::UploadFile) => Some(Processing),
                (Processing, FcmEvent::TranscriptionDone) => Some(Idle),
                _ => None,
            },
            Strategy::NonStreaming => match (self.state, event) {
                (Idle, FcmEvent::StartListening) => Some(Listening),
                (Listening, FcmEvent::WakeTriggered { .. }) => Some(Activated),
                (Activated, FcmEvent::StartRecording) => Some(Recording),
                (Recording, FcmEvent::EndRecording { .. }) => Some(Transcribing),
                (Transcribing, FcmEvent::TranscriptionDone) => Some(Activated),
                _ => None,
            },
            Strategy::Streaming => match (self.state, event) {
                (Idle, FcmEvent::StartListening) => Some(Listening),
                (Listening, FcmEvent::WakeTriggered { .. }) => Some(Activated),
                (Activated, FcmEvent::StartAsrStreaming) => Some(Streaming),
                (Streaming, FcmEvent::EndAsrStreaming { .. }) => {
                    match self.config.return_after_capture {
                        ReturnTarget::Activated => Some(Activated),
                        ReturnTarget::Listening => Some(Listening),
                    }
                }
                _ => None,
            },
        }
    }

    /// Side-effect directives for a state change.
    fn directives_for(&self, from: FcmState, to: FcmState, event: &FcmEvent) -> Vec<Directive> {
        use FcmState::*;
        let mut out = Vec::new();

        // Interrupt handling comes first: stop the reply machinery.
        if let FcmEvent::InterruptReply { target, .. } = event {
            match target {
                InterruptTarget::Tts => out.push(Directive::StopTts),
                InterruptTarget::Llm => out.push(Directive::CancelLlm),
                InterruptTarget::Both => {
                    out.push(Directive::StopTts);
                    out.push(Directive::CancelLlm);
                }
            }
        }

        // Exit-side timer teardown.
        if from != to {
            match from {
                Activated => out.push(Directive::DisarmTimer(TimerKind::Awake)),
                Recording => {
                    out.push(Directive::DisarmTimer(TimerKind::Recording));
                    out.push(Directive::EmitCaptureEnded);
                }
                Streaming => {
                    out.push(Directive::DisarmTimer(TimerKind::Streaming));
                    out.push(Directive::EmitCaptureEnded);
                }
                _ => {}
            }
        }

        // Claim timers follow the reply lifecycle, not state changes.
        match event {
            FcmEvent::TranscriptionDone if self.strategy != Strategy::Batch => {
                out.push(Directive::ArmTimer(TimerKind::LlmClaim));
            }
            FcmEvent::LlmReplyStarted => out.push(Directive::DisarmTimer(TimerKind::LlmClaim)),
            FcmEvent::LlmReplyFinished => out.push(Directive::ArmTimer(TimerKind::TtsClaim)),
            FcmEvent::TtsPlaybackStarted => out.push(Directive::DisarmTimer(TimerKind::TtsClaim)),
            _ => {}
        }

        // Enter-side timer setup.
        if from != to || matches!(event, FcmEvent::Timeout { timer: TimerKind::LlmClaim }) {
            match to {
                Activated => {
                    out.push(Directive::ArmTimer(TimerKind::Awake));
                    if from != to && self.config.auto_capture_on_wake && from == Listening {
                        out.push(Directive::ScheduleAutoCapture);
                    }
                }
                Recording => {
                    if self.config.max_recording_ms >= 0 {
                        out.push(Directive::ArmTimer(TimerKind::Recording));
                    }
                    out.push(Directive::EmitCaptureStarted);
                }
                Streaming => {
                    if self.config.max_streaming_ms >= 0 {
                        out.push(Directive::ArmTimer(TimerKind::Streaming));
                    }
                    out.push(Directive::EmitCaptureStarted);
                }
                _ => {}
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fcm(strategy: Strategy) -> Fcm {
        Fcm::new("s-1", strategy, FcmConfig::default(), HubClock::arc())
    }

    fn fcm_with(strategy: Strategy, config: FcmConfig) -> Fcm {
        Fcm::new("s-1", strategy, config, HubClock::arc())
    }

    #[test]
    fn non_streaming_happy_path() {
        let mut m = fcm(Strategy::NonStreaming);
        assert_eq!(m.state(), FcmState::Idle);
        m.apply(FcmEvent::StartListening).unwrap();
        assert_eq!(m.state(), FcmState::Listening);
        m.apply(FcmEvent::WakeTriggered { timestamp: 1.0 }).unwrap();
        assert_eq!(m.state(), FcmState::Activated);
        m.apply(FcmEvent::StartRecording).unwrap();
        assert_eq!(m.state(), FcmState::Recording);
        m.apply(FcmEvent::EndRecording {
            trigger: CaptureTrigger::VadTimeout,
        })
        .unwrap();
        assert_eq!(m.state(), FcmState::Transcribing);
        m.apply(FcmEvent::TranscriptionDone).unwrap();
        assert_eq!(m.state(), FcmState::Activated);
    }

    #[test]
    fn batch_table() {
        let mut m = fcm(Strategy::Batch);
        m.apply(FcmEvent::UploadFile).unwrap();
        assert_eq!(m.state(), FcmState::Processing);
        m.apply(FcmEvent::TranscriptionDone).unwrap();
        assert_eq!(m.state(), FcmState::Idle);
        // start_listening is not in the batch table.
        assert!(m.apply(FcmEvent::StartListening).is_err());
    }

    #[test]
    fn streaming_return_after_capture_is_configurable() {
        let mut m = fcm(Strategy::Streaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.5 }).unwrap();
        m.apply(FcmEvent::StartAsrStreaming).unwrap();
        m.apply(FcmEvent::EndAsrStreaming {
            trigger: CaptureTrigger::Manual,
        })
        .unwrap();
        assert_eq!(m.state(), FcmState::Activated);

        let mut config = FcmConfig::default();
        config.return_after_capture = ReturnTarget::Listening;
        let mut m = fcm_with(Strategy::Streaming, config);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.5 }).unwrap();
        m.apply(FcmEvent::StartAsrStreaming).unwrap();
        m.apply(FcmEvent::EndAsrStreaming {
            trigger: CaptureTrigger::Manual,
        })
        .unwrap();
        assert_eq!(m.state(), FcmState::Listening);
    }

    #[test]
    fn unknown_events_leave_state_unchanged() {
        // Property: every event outside (strategy table U common rules)
        // is rejected with the state intact.
        let mut m = fcm(Strategy::NonStreaming);
        let before = m.state();
        for event in [
            FcmEvent::StartRecording,
            FcmEvent::EndRecording {
                trigger: CaptureTrigger::Manual,
            },
            FcmEvent::TranscriptionDone,
            FcmEvent::UploadFile,
            FcmEvent::StartAsrStreaming,
            FcmEvent::TtsPlaybackFinished,
        ] {
            assert!(m.apply(event).is_err());
            assert_eq!(m.state(), before);
        }
    }

    #[test]
    fn reset_wins_from_any_state() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::Reset).unwrap();
        assert_eq!(m.state(), FcmState::Idle);
    }

    #[test]
    fn error_recover_reset_cycle() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::Fault).unwrap();
        assert_eq!(m.state(), FcmState::Error);
        // Only recover applies in ERROR.
        assert!(m.apply(FcmEvent::StartListening).is_err());
        assert!(m.apply(FcmEvent::Fault).is_err());
        m.apply(FcmEvent::Recover).unwrap();
        assert_eq!(m.state(), FcmState::Recovering);
        m.apply(FcmEvent::Reset).unwrap();
        assert_eq!(m.state(), FcmState::Idle);
    }

    #[test]
    fn busy_admits_only_its_own_events() {
        // Property: after entering BUSY no state change happens until one of
        // interrupt_reply / tts_playback_finished / llm_reply_finished /
        // reset / error.
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::LlmReplyStarted).unwrap();
        assert_eq!(m.state(), FcmState::Busy);

        for event in [
            FcmEvent::StartListening,
            FcmEvent::WakeTriggered { timestamp: 1.0 },
            FcmEvent::StartRecording,
            FcmEvent::TranscriptionDone,
            FcmEvent::Timeout {
                timer: TimerKind::Awake,
            },
        ] {
            assert!(m.apply(event).is_err());
            assert_eq!(m.state(), FcmState::Busy);
        }

        // llm_reply_finished keeps BUSY but arms the tts claim timer.
        let transition = m.apply(FcmEvent::LlmReplyFinished).unwrap();
        assert_eq!(transition.to, FcmState::Busy);
        assert!(transition
            .directives
            .contains(&Directive::ArmTimer(TimerKind::TtsClaim)));

        m.apply(FcmEvent::TtsPlaybackFinished).unwrap();
        assert_eq!(m.state(), FcmState::Activated);
    }

    #[test]
    fn keep_awake_false_returns_to_listening() {
        let mut config = FcmConfig::default();
        config.keep_awake_after_reply = false;
        let mut m = fcm_with(Strategy::NonStreaming, config);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::TtsPlaybackStarted).unwrap();
        m.apply(FcmEvent::TtsPlaybackFinished).unwrap();
        assert_eq!(m.state(), FcmState::Listening);
    }

    #[test]
    fn voice_interrupt_with_speech_jumps_to_capture() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::LlmReplyStarted).unwrap();
        let transition = m
            .apply(FcmEvent::InterruptReply {
                source: InterruptSource::Voice,
                target: InterruptTarget::Both,
                voice_active: true,
            })
            .unwrap();
        assert_eq!(transition.to, FcmState::Recording);
        assert!(transition.directives.contains(&Directive::StopTts));
        assert!(transition.directives.contains(&Directive::CancelLlm));
    }

    #[test]
    fn non_voice_interrupt_goes_to_activated() {
        let mut m = fcm(Strategy::Streaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::TtsPlaybackStarted).unwrap();
        let transition = m
            .apply(FcmEvent::InterruptReply {
                source: InterruptSource::Ui,
                target: InterruptTarget::Tts,
                voice_active: true,
            })
            .unwrap();
        assert_eq!(transition.to, FcmState::Activated);
        assert_eq!(transition.directives.iter().filter(|d| **d == Directive::StopTts).count(), 1);
    }

    #[test]
    fn barge_in_disabled_rejects_voice_interrupt() {
        let mut config = FcmConfig::default();
        config.allow_barge_in = false;
        let mut m = fcm_with(Strategy::NonStreaming, config);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::LlmReplyStarted).unwrap();
        assert!(m
            .apply(FcmEvent::InterruptReply {
                source: InterruptSource::Voice,
                target: InterruptTarget::Both,
                voice_active: true,
            })
            .is_err());
        assert_eq!(m.state(), FcmState::Busy);
    }

    #[test]
    fn awake_timeout_returns_to_listening() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::Timeout {
            timer: TimerKind::Awake,
        })
        .unwrap();
        assert_eq!(m.state(), FcmState::Listening);
    }

    #[test]
    fn llm_claim_expiry_rearms_awake() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        let transition = m
            .apply(FcmEvent::Timeout {
                timer: TimerKind::LlmClaim,
            })
            .unwrap();
        assert_eq!(transition.to, FcmState::Activated);
        assert!(transition
            .directives
            .contains(&Directive::ArmTimer(TimerKind::Awake)));
    }

    #[test]
    fn transcription_done_arms_llm_claim() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::StartRecording).unwrap();
        m.apply(FcmEvent::EndRecording {
            trigger: CaptureTrigger::VadTimeout,
        })
        .unwrap();
        let transition = m.apply(FcmEvent::TranscriptionDone).unwrap();
        assert!(transition
            .directives
            .contains(&Directive::ArmTimer(TimerKind::LlmClaim)));
    }

    #[test]
    fn wake_schedules_auto_capture_and_arms_awake() {
        let mut m = fcm(Strategy::NonStreaming);
        m.apply(FcmEvent::StartListening).unwrap();
        let transition = m.apply(FcmEvent::WakeTriggered { timestamp: 0.5 }).unwrap();
        assert!(transition
            .directives
            .contains(&Directive::ArmTimer(TimerKind::Awake)));
        assert!(transition
            .directives
            .contains(&Directive::ScheduleAutoCapture));
    }

    #[test]
    fn recording_timer_disabled_by_sentinel() {
        let mut config = FcmConfig::default();
        config.max_recording_ms = -1;
        let mut m = fcm_with(Strategy::NonStreaming, config);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        let transition = m.apply(FcmEvent::StartRecording).unwrap();
        assert!(!transition
            .directives
            .contains(&Directive::ArmTimer(TimerKind::Recording)));
        assert!(transition.directives.contains(&Directive::EmitCaptureStarted));
    }

    #[test]
    fn hook_errors_never_abort_transitions() {
        let mut m = fcm(Strategy::NonStreaming);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        m.add_hook(FcmState::Listening, HookPhase::Enter, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("hook exploded".to_string())
        });
        m.apply(FcmEvent::StartListening).unwrap();
        assert_eq!(m.state(), FcmState::Listening);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_order_is_exit_then_enter() {
        let mut m = fcm(Strategy::NonStreaming);
        let order: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();
        let exit_log = Arc::clone(&order);
        m.add_hook(FcmState::Idle, HookPhase::Exit, move |_, _| {
            exit_log.lock().push("exit_idle");
            Ok(())
        });
        let enter_log = Arc::clone(&order);
        m.add_hook(FcmState::Listening, HookPhase::Enter, move |_, _| {
            enter_log.lock().push("enter_listening");
            Ok(())
        });
        m.apply(FcmEvent::StartListening).unwrap();
        assert_eq!(*order.lock(), vec!["exit_idle", "enter_listening"]);
    }

    #[test]
    fn session_idle_timeout_resets() {
        let mut m = fcm(Strategy::Streaming);
        m.apply(FcmEvent::StartListening).unwrap();
        m.apply(FcmEvent::WakeTriggered { timestamp: 0.0 }).unwrap();
        m.apply(FcmEvent::Timeout {
            timer: TimerKind::SessionIdle,
        })
        .unwrap();
        assert_eq!(m.state(), FcmState::Idle);
    }
}
