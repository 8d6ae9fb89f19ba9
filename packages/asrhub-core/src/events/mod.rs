//! Outbound event system for real-time client communication.
//!
//! Domain code emits typed [`OutboundEvent`]s through the [`EventSink`]
//! trait; the [`EventBridge`] forwards them onto a broadcast channel that
//! every transport (SSE, WebSocket, Socket.IO, Redis) subscribes to and
//! filters by session id.

mod bridge;

pub use bridge::{EventBridge, EventSink, LoggingEventSink, NoopEventSink};

use serde::Serialize;

use crate::fcm::FcmState;
use crate::provider::Transcript;

/// Wall-clock timestamp in ISO-8601 for wire payloads.
#[must_use]
pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Events fanned out to connected clients.
///
/// Every payload carries the owning `session_id` (absent only for
/// channel-level events like `connection_ready` and `heartbeat`) and an
/// ISO-8601 wall-clock `timestamp`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    ConnectionReady {
        timestamp: String,
    },
    Heartbeat {
        timestamp: String,
    },
    SessionCreated {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: String,
    },
    SessionDestroyed {
        session_id: String,
        timestamp: String,
    },
    ListeningStarted {
        session_id: String,
        timestamp: String,
    },
    /// FCM entered a capture state (RECORDING or STREAMING).
    AsrCaptureStarted {
        session_id: String,
        state: FcmState,
        timestamp: String,
    },
    /// FCM left a capture state.
    AsrCaptureEnded {
        session_id: String,
        state: FcmState,
        timestamp: String,
    },
    /// Short confirmation cue for the client to play on wake.
    PlayAsrFeedback {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        keyword: Option<String>,
        timestamp: String,
    },
    /// A finalized utterance transcription.
    TranscribeDone {
        session_id: String,
        text: String,
        confidence: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        timestamp: String,
    },
    /// Incremental transcript segment (streaming strategy).
    Transcript {
        session_id: String,
        text: String,
        is_final: bool,
        timestamp: String,
    },
    /// FCM state change notification.
    Status {
        session_id: String,
        state: FcmState,
        timestamp: String,
    },
    #[serde(rename = "audio/received")]
    AudioReceived {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_id: Option<String>,
        bytes: usize,
        timestamp: String,
    },
    AudioMetadataAck {
        session_id: String,
        timestamp: String,
    },
    ErrorReported {
        session_id: String,
        error_code: String,
        error_message: String,
        timestamp: String,
    },
}

impl OutboundEvent {
    /// The session this event belongs to; None for channel-level events.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionReady { .. } | Self::Heartbeat { .. } => None,
            Self::SessionCreated { session_id, .. }
            | Self::SessionDestroyed { session_id, .. }
            | Self::ListeningStarted { session_id, .. }
            | Self::AsrCaptureStarted { session_id, .. }
            | Self::AsrCaptureEnded { session_id, .. }
            | Self::PlayAsrFeedback { session_id, .. }
            | Self::TranscribeDone { session_id, .. }
            | Self::Transcript { session_id, .. }
            | Self::Status { session_id, .. }
            | Self::AudioReceived { session_id, .. }
            | Self::AudioMetadataAck { session_id, .. }
            | Self::ErrorReported { session_id, .. } => Some(session_id),
        }
    }

    /// Builds a `transcribe_done` event from a provider transcript.
    #[must_use]
    pub fn transcribe_done(session_id: &str, transcript: &Transcript) -> Self {
        Self::TranscribeDone {
            session_id: session_id.to_string(),
            text: transcript.text.clone(),
            confidence: transcript.confidence,
            language: transcript.language.clone(),
            timestamp: iso_timestamp(),
        }
    }

    /// Builds an `error_reported` event.
    #[must_use]
    pub fn error_reported(session_id: &str, code: &str, message: &str) -> Self {
        Self::ErrorReported {
            session_id: session_id.to_string(),
            error_code: code.to_string(),
            error_message: message.to_string(),
            timestamp: iso_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_uses_snake_case_types() {
        let event = OutboundEvent::ErrorReported {
            session_id: "s-1".to_string(),
            error_code: "acquire_timeout".to_string(),
            error_message: "no instance".to_string(),
            timestamp: iso_timestamp(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error_reported");
        assert_eq!(json["payload"]["session_id"], "s-1");
        assert!(json["payload"]["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn session_routing() {
        assert_eq!(
            OutboundEvent::Heartbeat {
                timestamp: iso_timestamp()
            }
            .session_id(),
            None
        );
        assert_eq!(
            OutboundEvent::SessionDestroyed {
                session_id: "s-9".to_string(),
                timestamp: iso_timestamp()
            }
            .session_id(),
            Some("s-9")
        );
    }
}
