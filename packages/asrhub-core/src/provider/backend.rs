//! ASR backend contract and the mock used by probes and tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::audio::AudioFormat;

/// Errors surfaced by ASR backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The model rejected the audio or failed mid-decode.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// The worker process/model is gone and cannot recover.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// One finalized transcription result.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub confidence: f32,
    /// Seconds of audio transcribed.
    pub audio_duration: f64,
}

/// Contract every ASR worker implements.
///
/// An instance is one loaded model bound to CPU/GPU resources; the pool
/// guarantees an instance serves one session at a time.
#[async_trait]
pub trait AsrBackend: Send + Sync {
    /// Backend type name (pool key, e.g. "whisper").
    fn name(&self) -> &str;

    /// Transcribes one utterance of hub-format PCM.
    async fn transcribe(
        &self,
        audio: Bytes,
        format: AudioFormat,
    ) -> Result<Transcript, BackendError>;

    /// Cheap synthetic probe used by pool health checks.
    ///
    /// Default: transcribe 100 ms of silence and report success.
    async fn probe(&self) -> bool {
        let silence = Bytes::from(vec![0u8; AudioFormat::HUB.secs_to_bytes(0.1)]);
        self.transcribe(silence, AudioFormat::HUB).await.is_ok()
    }
}

/// Deterministic in-process backend.
///
/// Returns canned responses in order (cycling on exhaustion), sleeps for a
/// configurable latency to model real decode time, and can be told to fail
/// the next N calls for failure-path tests.
pub struct MockBackend {
    name: String,
    responses: Mutex<Vec<String>>,
    cursor: AtomicU64,
    latency: Duration,
    fail_next: AtomicU32,
    calls: AtomicU64,
}

impl MockBackend {
    #[must_use]
    pub fn new(name: impl Into<String>, responses: Vec<String>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses),
            cursor: AtomicU64::new(0),
            latency,
            fail_next: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Backend that always answers `text` instantly.
    #[must_use]
    pub fn canned(text: &str) -> Self {
        Self::new("mock", vec![text.to_string()], Duration::ZERO)
    }

    /// Makes the next `n` transcriptions fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total transcription calls served (including failures).
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsrBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transcribe(
        &self,
        audio: Bytes,
        format: AudioFormat,
    ) -> Result<Transcript, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Transcription("injected failure".to_string()));
        }
        let responses = self.responses.lock();
        let text = if responses.is_empty() {
            String::new()
        } else {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst) as usize % responses.len();
            responses[idx].clone()
        };
        Ok(Transcript {
            text,
            language: Some("en".to_string()),
            confidence: 0.95,
            audio_duration: format.duration_secs(audio.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_cycles_responses() {
        let backend = MockBackend::new(
            "mock",
            vec!["one".to_string(), "two".to_string()],
            Duration::ZERO,
        );
        let audio = Bytes::from(vec![0u8; 3200]);
        let a = backend
            .transcribe(audio.clone(), AudioFormat::HUB)
            .await
            .unwrap();
        let b = backend
            .transcribe(audio.clone(), AudioFormat::HUB)
            .await
            .unwrap();
        let c = backend.transcribe(audio, AudioFormat::HUB).await.unwrap();
        assert_eq!(a.text, "one");
        assert_eq!(b.text, "two");
        assert_eq!(c.text, "one");
        assert!((a.audio_duration - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let backend = MockBackend::canned("ok");
        backend.fail_next(2);
        let audio = Bytes::from(vec![0u8; 320]);
        assert!(backend
            .transcribe(audio.clone(), AudioFormat::HUB)
            .await
            .is_err());
        assert!(backend
            .transcribe(audio.clone(), AudioFormat::HUB)
            .await
            .is_err());
        assert!(backend.transcribe(audio, AudioFormat::HUB).await.is_ok());
    }

    #[tokio::test]
    async fn probe_uses_transcription_path() {
        let backend = MockBackend::canned("ok");
        assert!(backend.probe().await);
        backend.fail_next(1);
        assert!(!backend.probe().await);
    }
}
