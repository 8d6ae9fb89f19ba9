//! Event-driven state store.
//!
//! `dispatch` runs one action through FCM validation (when the action maps to
//! a state transition), applies the pure reducer atomically, then notifies
//! subscribers in registration order with the (prev, next) snapshot pair.
//! Dispatch is serialized by a single lock: readers always see a consistent
//! snapshot per dispatch.

mod actions;

pub use actions::Action;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::audio::AudioFormat;
use crate::error::{HubError, HubResult};
use crate::fcm::{FcmState, Strategy, Transition, TransitionError};

/// Per-session slice of the store.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub id: String,
    pub strategy: Strategy,
    pub state: FcmState,
    pub state_entered_at: f64,
    pub audio_format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_since: Option<f64>,
    pub last_activity_at: f64,
    pub recording_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_lease_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transcript: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SessionState {
    fn new(id: String, strategy: Strategy, request_id: Option<String>, now: f64) -> Self {
        Self {
            id,
            strategy,
            state: FcmState::Idle,
            state_entered_at: now,
            audio_format: AudioFormat::HUB,
            request_id,
            wake_timestamp: None,
            silence_since: None,
            last_activity_at: now,
            recording_active: false,
            provider_lease_id: None,
            last_transcript: None,
            metadata: HashMap::new(),
        }
    }
}

/// Aggregate counters surfaced through `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub actions_dispatched: u64,
    pub chunks_received: u64,
    pub transcriptions_done: u64,
    pub errors_reported: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
}

/// The whole store shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubState {
    pub sessions: HashMap<String, SessionState>,
    pub stats: HubStats,
}

/// Outcome handed back to the dispatch caller.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The FCM transition this action caused, if it was a transition action.
    pub transition: Option<Transition>,
}

/// Validates transition actions against the per-session FCM.
///
/// The effects layer implements this by locking the session's machine and
/// applying the mapped event, so validation and the FCM's own state change
/// are one atomic step from the store's point of view.
pub trait TransitionValidator: Send + Sync {
    fn validate(&self, action: &Action) -> Result<Option<Transition>, TransitionError>;
}

/// Receives every dispatched action with the pre/post state pair.
pub trait StoreSubscriber: Send + Sync {
    fn on_action(&self, action: &Action, prev: &HubState, next: &HubState);
}

/// The event-driven store.
pub struct StateStore {
    state: RwLock<HubState>,
    /// Serializes dispatch: one logical writer at a time.
    dispatch_lock: Mutex<()>,
    validator: RwLock<Option<Arc<dyn TransitionValidator>>>,
    subscribers: RwLock<Vec<Arc<dyn StoreSubscriber>>>,
    clock: Arc<crate::clock::HubClock>,
}

impl StateStore {
    #[must_use]
    pub fn new(clock: Arc<crate::clock::HubClock>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HubState::default()),
            dispatch_lock: Mutex::new(()),
            validator: RwLock::new(None),
            subscribers: RwLock::new(Vec::new()),
            clock,
        })
    }

    /// Registers the FCM validator. Set once during bootstrap.
    pub fn set_validator(&self, validator: Arc<dyn TransitionValidator>) {
        *self.validator.write() = Some(validator);
    }

    /// Registers an effect subscriber; notification order is registration
    /// order.
    pub fn subscribe(&self, subscriber: Arc<dyn StoreSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Pure projection over the current state.
    pub fn select<T>(&self, selector: impl FnOnce(&HubState) -> T) -> T {
        selector(&self.state.read())
    }

    /// Dispatches one action: validate (FCM) -> reduce -> notify.
    ///
    /// A rejected transition leaves the state untouched and surfaces as
    /// `TransitionRejected`; the reducer runs exactly once for every
    /// accepted action.
    pub fn dispatch(&self, action: &Action) -> HubResult<DispatchOutcome> {
        let _serialized = self.dispatch_lock.lock();

        let transition = {
            let validator = self.validator.read();
            match validator.as_ref() {
                Some(validator) => validator
                    .validate(action)
                    .map_err(|err| HubError::TransitionRejected(err.to_string()))?,
                None => None,
            }
        };

        let now = self.clock.now();
        let (prev, next) = {
            let mut state = self.state.write();
            let prev = state.clone();
            let next = reduce(&prev, action, transition.as_ref(), now);
            *state = next.clone();
            (prev, next)
        };

        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            subscriber.on_action(action, &prev, &next);
        }

        Ok(DispatchOutcome { transition })
    }
}

/// The reducer: pure, deterministic, total.
///
/// Unknown-to-this-reducer actions (none, since the enum is closed) and
/// actions for unknown sessions fall through to an unchanged clone.
fn reduce(
    state: &HubState,
    action: &Action,
    transition: Option<&Transition>,
    now: f64,
) -> HubState {
    let mut next = state.clone();
    next.stats.actions_dispatched += 1;

    // Apply the FCM outcome first so per-action handling sees the new state.
    if let (Some(transition), Some(session_id)) = (transition, action.session_id()) {
        if let Some(session) = next.sessions.get_mut(session_id) {
            session.state = transition.to;
            session.state_entered_at = now;
        }
    }

    if let Some(session_id) = action.session_id() {
        if let Some(session) = next.sessions.get_mut(session_id) {
            session.last_activity_at = now;
        }
    }

    match action {
        Action::SessionCreate {
            strategy,
            request_id,
            session_id: Some(session_id),
        } => {
            next.stats.sessions_created += 1;
            next.sessions.insert(
                session_id.clone(),
                SessionState::new(session_id.clone(), *strategy, request_id.clone(), now),
            );
        }
        Action::SessionDestroy { session_id } => {
            if next.sessions.remove(session_id).is_some() {
                next.stats.sessions_destroyed += 1;
            }
        }
        Action::StartListening {
            session_id,
            sample_rate,
            channels,
            ..
        } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                // The inbound format is fixed at start_listening.
                session.audio_format = AudioFormat::new(
                    sample_rate.unwrap_or(AudioFormat::HUB.sample_rate),
                    channels.unwrap_or(AudioFormat::HUB.channels),
                    AudioFormat::HUB.sample_width,
                );
            }
        }
        Action::AudioChunk { .. } => {
            next.stats.chunks_received += 1;
        }
        Action::AudioMetadata {
            session_id,
            sample_rate,
            channels,
            ..
        } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                if let Some(rate) = sample_rate {
                    session.audio_format.sample_rate = *rate;
                }
                if let Some(ch) = channels {
                    session.audio_format.channels = *ch;
                }
            }
        }
        Action::WakeTriggered {
            session_id,
            timestamp,
            keyword,
        } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                session.wake_timestamp = Some(*timestamp);
                session.silence_since = None;
                if let Some(keyword) = keyword {
                    session
                        .metadata
                        .insert("wake_keyword".to_string(), keyword.clone());
                }
            }
        }
        Action::StartRecording { session_id } | Action::StartAsrStreaming { session_id } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                session.recording_active = true;
                session.silence_since = None;
            }
        }
        Action::EndRecording { session_id, .. } | Action::EndAsrStreaming { session_id, .. } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                session.recording_active = false;
            }
        }
        Action::TranscriptionDone {
            session_id, text, ..
        } => {
            next.stats.transcriptions_done += 1;
            if let Some(session) = next.sessions.get_mut(session_id) {
                session.last_transcript = Some(text.clone());
            }
        }
        Action::ErrorOccurred { .. } => {
            next.stats.errors_reported += 1;
        }
        Action::Reset { session_id } => {
            if let Some(session) = next.sessions.get_mut(session_id) {
                session.wake_timestamp = None;
                session.silence_since = None;
                session.recording_active = false;
                session.provider_lease_id = None;
            }
        }
        // Bookkeeping-free actions: the FCM/transition block above and the
        // activity touch are all they need.
        _ => {}
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HubClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSubscriber {
        notified: AtomicUsize,
    }

    impl StoreSubscriber for CountingSubscriber {
        fn on_action(&self, _action: &Action, prev: &HubState, next: &HubState) {
            self.notified.fetch_add(1, Ordering::SeqCst);
            // Every notification carries a consistent snapshot pair.
            assert_eq!(
                prev.stats.actions_dispatched + 1,
                next.stats.actions_dispatched
            );
        }
    }

    fn create_action(session_id: &str) -> Action {
        Action::SessionCreate {
            strategy: Strategy::NonStreaming,
            request_id: Some("req-1".to_string()),
            session_id: Some(session_id.to_string()),
        }
    }

    #[test]
    fn dispatch_reduces_once_and_notifies_subscribers() {
        // Property: one reducer invocation and at least one subscriber
        // notification per dispatched action.
        let store = StateStore::new(HubClock::arc());
        let subscriber = Arc::new(CountingSubscriber {
            notified: AtomicUsize::new(0),
        });
        store.subscribe(Arc::clone(&subscriber) as Arc<dyn StoreSubscriber>);

        store.dispatch(&create_action("s-1")).unwrap();
        store
            .dispatch(&Action::ChunkReceived {
                session_id: "s-1".to_string(),
                chunk_id: None,
            })
            .unwrap();

        assert_eq!(subscriber.notified.load(Ordering::SeqCst), 2);
        assert_eq!(store.select(|s| s.stats.actions_dispatched), 2);
    }

    #[test]
    fn session_create_and_destroy_round_trip() {
        let store = StateStore::new(HubClock::arc());
        store.dispatch(&create_action("s-1")).unwrap();
        assert!(store.select(|s| s.sessions.contains_key("s-1")));
        assert_eq!(
            store.select(|s| s.sessions["s-1"].request_id.clone()),
            Some("req-1".to_string())
        );

        store
            .dispatch(&Action::SessionDestroy {
                session_id: "s-1".to_string(),
            })
            .unwrap();
        assert!(!store.select(|s| s.sessions.contains_key("s-1")));
        assert_eq!(store.select(|s| s.stats.sessions_destroyed), 1);
    }

    #[test]
    fn rejected_transition_leaves_state_unchanged() {
        struct RejectAll;
        impl TransitionValidator for RejectAll {
            fn validate(&self, _action: &Action) -> Result<Option<Transition>, TransitionError> {
                Err(TransitionError {
                    state: FcmState::Idle,
                    event: crate::fcm::FcmEvent::StartRecording,
                })
            }
        }
        let store = StateStore::new(HubClock::arc());
        store.set_validator(Arc::new(RejectAll));
        let err = store.dispatch(&create_action("s-1")).unwrap_err();
        assert!(matches!(err, HubError::TransitionRejected(_)));
        assert_eq!(store.select(|s| s.stats.actions_dispatched), 0);
        assert!(!store.select(|s| s.sessions.contains_key("s-1")));
    }

    #[test]
    fn transition_outcome_updates_session_state() {
        struct FixedTransition;
        impl TransitionValidator for FixedTransition {
            fn validate(&self, action: &Action) -> Result<Option<Transition>, TransitionError> {
                Ok(match action {
                    Action::StartListening { .. } => Some(Transition {
                        from: FcmState::Idle,
                        to: FcmState::Listening,
                        directives: vec![],
                    }),
                    _ => None,
                })
            }
        }
        let store = StateStore::new(HubClock::arc());
        store.dispatch(&create_action("s-1")).unwrap();
        store.set_validator(Arc::new(FixedTransition));
        let outcome = store
            .dispatch(&Action::StartListening {
                session_id: "s-1".to_string(),
                sample_rate: Some(48_000),
                channels: Some(2),
                format: None,
            })
            .unwrap();
        assert!(outcome.transition.is_some());
        assert_eq!(
            store.select(|s| s.sessions["s-1"].state),
            FcmState::Listening
        );
        assert_eq!(
            store.select(|s| s.sessions["s-1"].audio_format.sample_rate),
            48_000
        );
    }

    #[test]
    fn transcript_and_chunk_counters_accumulate() {
        let store = StateStore::new(HubClock::arc());
        store.dispatch(&create_action("s-1")).unwrap();
        store
            .dispatch(&Action::AudioChunk {
                session_id: "s-1".to_string(),
                chunk_id: None,
                timestamp: Some(0.1),
                audio: bytes::Bytes::new(),
            })
            .unwrap();
        store
            .dispatch(&Action::TranscriptionDone {
                session_id: "s-1".to_string(),
                text: "hello world".to_string(),
                confidence: Some(0.9),
                language: None,
            })
            .unwrap();
        assert_eq!(store.select(|s| s.stats.chunks_received), 1);
        assert_eq!(store.select(|s| s.stats.transcriptions_done), 1);
        assert_eq!(
            store.select(|s| s.sessions["s-1"].last_transcript.clone()),
            Some("hello world".to_string())
        );
    }
}
