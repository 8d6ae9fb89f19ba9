//! Canonical action vocabulary.
//!
//! Every transport normalizes inbound payloads into the same tagged
//! `{type, payload}` envelope with slash-form type names. Unknown types are
//! dropped at the transport boundary with a log line; the reducer itself is
//! total over this enum.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fcm::{CaptureTrigger, InterruptSource, InterruptTarget, Strategy, TimerKind};

/// Canonical hub action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Action {
    #[serde(rename = "session/create")]
    SessionCreate {
        strategy: Strategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Assigned by the hub before dispatch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    #[serde(rename = "session/destroy")]
    SessionDestroy { session_id: String },

    #[serde(rename = "start_listening", alias = "session/start")]
    StartListening {
        session_id: String,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
        #[serde(default)]
        format: Option<String>,
    },

    #[serde(rename = "audio/chunk")]
    AudioChunk {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_id: Option<String>,
        /// Queue-assigned timestamp, filled in by the effects layer.
        #[serde(default)]
        timestamp: Option<f64>,
        /// Raw PCM travels out-of-band (binary frames), never in JSON.
        #[serde(skip, default)]
        audio: Bytes,
    },

    #[serde(rename = "audio/metadata")]
    AudioMetadata {
        session_id: String,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
        #[serde(default)]
        format: Option<String>,
    },

    #[serde(rename = "chunk/received")]
    ChunkReceived {
        session_id: String,
        #[serde(default)]
        chunk_id: Option<String>,
    },

    #[serde(rename = "file/upload")]
    FileUpload { session_id: String },

    #[serde(rename = "file/upload/done")]
    FileUploadDone { session_id: String },

    #[serde(rename = "chunk/upload/start")]
    ChunkUploadStart { session_id: String },

    #[serde(rename = "chunk/upload/done")]
    ChunkUploadDone { session_id: String },

    #[serde(rename = "wake_triggered")]
    WakeTriggered {
        session_id: String,
        timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyword: Option<String>,
    },

    #[serde(rename = "start_recording", alias = "recording/start")]
    StartRecording { session_id: String },

    #[serde(rename = "end_recording", alias = "recording/end")]
    EndRecording {
        session_id: String,
        #[serde(default)]
        trigger: CaptureTrigger,
    },

    #[serde(rename = "start_asr_streaming")]
    StartAsrStreaming { session_id: String },

    #[serde(rename = "end_asr_streaming")]
    EndAsrStreaming {
        session_id: String,
        #[serde(default)]
        trigger: CaptureTrigger,
    },

    #[serde(rename = "transcription/start")]
    TranscriptionStart { session_id: String },

    #[serde(rename = "transcription/done")]
    TranscriptionDone {
        session_id: String,
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    #[serde(rename = "llm_reply_started")]
    LlmReplyStarted { session_id: String },

    #[serde(rename = "llm_reply_finished")]
    LlmReplyFinished { session_id: String },

    #[serde(rename = "tts_playback_started")]
    TtsPlaybackStarted { session_id: String },

    #[serde(rename = "tts_playback_finished")]
    TtsPlaybackFinished { session_id: String },

    #[serde(rename = "interrupt_reply")]
    InterruptReply {
        session_id: String,
        source: InterruptSource,
        target: InterruptTarget,
    },

    #[serde(rename = "timeout")]
    TimeoutFired { session_id: String, timer: TimerKind },

    #[serde(rename = "reset")]
    Reset { session_id: String },

    #[serde(rename = "error")]
    ErrorOccurred {
        session_id: String,
        #[serde(default)]
        error_code: String,
        #[serde(default)]
        error_message: String,
    },

    #[serde(rename = "recover")]
    Recover { session_id: String },

    #[serde(rename = "transport/disconnected")]
    TransportDisconnected {
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl Action {
    /// The session this action addresses, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreate { session_id, .. } => session_id.as_deref(),
            Self::TransportDisconnected { session_id } => session_id.as_deref(),
            Self::SessionDestroy { session_id }
            | Self::StartListening { session_id, .. }
            | Self::AudioChunk { session_id, .. }
            | Self::AudioMetadata { session_id, .. }
            | Self::ChunkReceived { session_id, .. }
            | Self::FileUpload { session_id }
            | Self::FileUploadDone { session_id }
            | Self::ChunkUploadStart { session_id }
            | Self::ChunkUploadDone { session_id }
            | Self::WakeTriggered { session_id, .. }
            | Self::StartRecording { session_id }
            | Self::EndRecording { session_id, .. }
            | Self::StartAsrStreaming { session_id }
            | Self::EndAsrStreaming { session_id, .. }
            | Self::TranscriptionStart { session_id }
            | Self::TranscriptionDone { session_id, .. }
            | Self::LlmReplyStarted { session_id }
            | Self::LlmReplyFinished { session_id }
            | Self::TtsPlaybackStarted { session_id }
            | Self::TtsPlaybackFinished { session_id }
            | Self::InterruptReply { session_id, .. }
            | Self::TimeoutFired { session_id, .. }
            | Self::Reset { session_id }
            | Self::ErrorOccurred { session_id, .. }
            | Self::Recover { session_id } => Some(session_id),
        }
    }

    /// Parses a raw `{type, payload}` envelope value.
    ///
    /// Returns None for unknown type names (the legacy bracket vocabulary
    /// included); callers log and drop those.
    #[must_use]
    pub fn from_envelope(envelope: &Value) -> Option<Self> {
        serde_json::from_value(envelope.clone()).ok()
    }

    /// Serializes back into the wire envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let action = Action::WakeTriggered {
            session_id: "s-1".to_string(),
            timestamp: 1.25,
            keyword: Some("hi-hub".to_string()),
        };
        let envelope = action.to_envelope();
        assert_eq!(envelope["type"], "wake_triggered");
        assert_eq!(envelope["payload"]["timestamp"], 1.25);
        assert_eq!(Action::from_envelope(&envelope), Some(action));
    }

    #[test]
    fn session_start_alias_is_accepted() {
        let envelope = json!({
            "type": "session/start",
            "payload": {"session_id": "s-1"}
        });
        assert!(matches!(
            Action::from_envelope(&envelope),
            Some(Action::StartListening { .. })
        ));
    }

    #[test]
    fn unknown_and_legacy_types_are_dropped() {
        let unknown = json!({"type": "frobnicate", "payload": {}});
        assert_eq!(Action::from_envelope(&unknown), None);
        // The legacy bracket vocabulary is not parsed.
        let legacy = json!({"type": "[Session] Create", "payload": {"strategy": "batch"}});
        assert_eq!(Action::from_envelope(&legacy), None);
    }

    #[test]
    fn audio_bytes_never_serialize() {
        let action = Action::AudioChunk {
            session_id: "s-1".to_string(),
            chunk_id: None,
            timestamp: Some(0.5),
            audio: Bytes::from(vec![1, 2, 3]),
        };
        let envelope = action.to_envelope();
        assert!(envelope["payload"].get("audio").is_none());
    }
}
