//! FCM registry: maps actions to machine events and validates transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::fcm::{Fcm, FcmEvent, FcmState, Strategy, Transition, TransitionError};
use crate::store::{Action, TransitionValidator};

/// Per-session machines plus the live VAD verdicts interrupts consult.
///
/// Shared between the store (as its [`TransitionValidator`]) and the effects
/// layer (which registers machines and reads states); neither owns the other,
/// which keeps the session/FCM/effects graph acyclic.
#[derive(Default)]
pub struct FcmRegistry {
    machines: DashMap<String, Arc<Mutex<Fcm>>>,
    voice_active: DashMap<String, Arc<AtomicBool>>,
}

impl FcmRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a session's machine and its live-voice flag.
    pub fn register(&self, session_id: &str, fcm: Fcm) -> Arc<AtomicBool> {
        let voice = Arc::new(AtomicBool::new(false));
        self.machines
            .insert(session_id.to_string(), Arc::new(Mutex::new(fcm)));
        self.voice_active
            .insert(session_id.to_string(), Arc::clone(&voice));
        voice
    }

    /// Drops a session's machine. The FCM instance dies with the session.
    pub fn unregister(&self, session_id: &str) {
        self.machines.remove(session_id);
        self.voice_active.remove(session_id);
    }

    /// Current state of a session's machine.
    #[must_use]
    pub fn state(&self, session_id: &str) -> Option<FcmState> {
        self.machines
            .get(session_id)
            .map(|machine| machine.lock().state())
    }

    /// Strategy of a session's machine.
    #[must_use]
    pub fn strategy(&self, session_id: &str) -> Option<Strategy> {
        self.machines
            .get(session_id)
            .map(|machine| machine.lock().strategy())
    }

    fn live_voice(&self, session_id: &str) -> bool {
        self.voice_active
            .get(session_id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Translates a store action into the FCM event it corresponds to.
    /// Returns None for bookkeeping actions that are not transitions.
    fn map_event(&self, action: &Action) -> Option<FcmEvent> {
        match action {
            Action::StartListening { .. } => Some(FcmEvent::StartListening),
            Action::WakeTriggered { timestamp, .. } => Some(FcmEvent::WakeTriggered {
                timestamp: *timestamp,
            }),
            Action::StartRecording { .. } => Some(FcmEvent::StartRecording),
            Action::EndRecording { trigger, .. } => Some(FcmEvent::EndRecording {
                trigger: *trigger,
            }),
            Action::StartAsrStreaming { .. } => Some(FcmEvent::StartAsrStreaming),
            Action::EndAsrStreaming { trigger, .. } => Some(FcmEvent::EndAsrStreaming {
                trigger: *trigger,
            }),
            Action::FileUpload { .. } => Some(FcmEvent::UploadFile),
            Action::TranscriptionDone { .. } => Some(FcmEvent::TranscriptionDone),
            Action::TimeoutFired { timer, .. } => Some(FcmEvent::Timeout { timer: *timer }),
            Action::Reset { .. } => Some(FcmEvent::Reset),
            Action::ErrorOccurred { .. } => Some(FcmEvent::Fault),
            Action::Recover { .. } => Some(FcmEvent::Recover),
            Action::LlmReplyStarted { .. } => Some(FcmEvent::LlmReplyStarted),
            Action::LlmReplyFinished { .. } => Some(FcmEvent::LlmReplyFinished),
            Action::TtsPlaybackStarted { .. } => Some(FcmEvent::TtsPlaybackStarted),
            Action::TtsPlaybackFinished { .. } => Some(FcmEvent::TtsPlaybackFinished),
            Action::InterruptReply {
                session_id,
                source,
                target,
            } => Some(FcmEvent::InterruptReply {
                source: *source,
                target: *target,
                voice_active: self.live_voice(session_id),
            }),
            _ => None,
        }
    }
}

impl TransitionValidator for FcmRegistry {
    fn validate(&self, action: &Action) -> Result<Option<Transition>, TransitionError> {
        let Some(event) = self.map_event(action) else {
            return Ok(None);
        };
        let Some(session_id) = action.session_id() else {
            return Ok(None);
        };
        let Some(machine) = self.machines.get(session_id).map(|m| Arc::clone(&m)) else {
            // Unknown session: not a transition; the effects layer surfaces
            // the validation error before dispatch.
            return Ok(None);
        };
        let mut machine = machine.lock();
        machine.apply(event).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HubClock;
    use crate::config::FcmConfig;
    use crate::fcm::{CaptureTrigger, InterruptSource, InterruptTarget};

    fn registry_with_session(session_id: &str, strategy: Strategy) -> Arc<FcmRegistry> {
        let registry = FcmRegistry::new();
        let fcm = Fcm::new(session_id, strategy, FcmConfig::default(), HubClock::arc());
        registry.register(session_id, fcm);
        registry
    }

    #[test]
    fn validates_and_advances_machine() {
        let registry = registry_with_session("s-1", Strategy::NonStreaming);
        let transition = registry
            .validate(&Action::StartListening {
                session_id: "s-1".to_string(),
                sample_rate: None,
                channels: None,
                format: None,
            })
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, FcmState::Listening);
        assert_eq!(registry.state("s-1"), Some(FcmState::Listening));
    }

    #[test]
    fn rejected_event_propagates_error() {
        let registry = registry_with_session("s-1", Strategy::NonStreaming);
        let err = registry
            .validate(&Action::EndRecording {
                session_id: "s-1".to_string(),
                trigger: CaptureTrigger::Manual,
            })
            .unwrap_err();
        assert_eq!(err.state, FcmState::Idle);
    }

    #[test]
    fn bookkeeping_actions_are_not_transitions() {
        let registry = registry_with_session("s-1", Strategy::NonStreaming);
        let outcome = registry
            .validate(&Action::ChunkReceived {
                session_id: "s-1".to_string(),
                chunk_id: None,
            })
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn interrupt_consults_live_voice_flag() {
        let registry = FcmRegistry::new();
        let mut fcm = Fcm::new(
            "s-1",
            Strategy::NonStreaming,
            FcmConfig::default(),
            HubClock::arc(),
        );
        fcm.apply(FcmEvent::StartListening).unwrap();
        fcm.apply(FcmEvent::LlmReplyStarted).unwrap();
        let voice = registry.register("s-1", fcm);

        voice.store(true, Ordering::Relaxed);
        let transition = registry
            .validate(&Action::InterruptReply {
                session_id: "s-1".to_string(),
                source: InterruptSource::Voice,
                target: InterruptTarget::Both,
            })
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, FcmState::Recording);
    }
}
