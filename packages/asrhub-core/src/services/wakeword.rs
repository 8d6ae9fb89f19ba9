//! Marker-byte wake-word detector.

use super::{ServiceError, WakeResult, WakeWordDetector};

/// Detector that triggers on an embedded int16 marker sample.
///
/// A window containing the marker value counts as the wake word. Real
/// deployments plug a model-backed detector into the same trait; this one
/// exists for bring-up and deterministic tests (inject the marker into a
/// chunk, get a trigger).
pub struct ScriptedWakeWord {
    keyword: String,
    marker: i16,
}

impl ScriptedWakeWord {
    /// The marker sample reference detectors listen for.
    pub const DEFAULT_MARKER: i16 = 0x5A5A;

    #[must_use]
    pub fn new(keyword: impl Into<String>, marker: i16) -> Self {
        Self {
            keyword: keyword.into(),
            marker,
        }
    }
}

impl Default for ScriptedWakeWord {
    fn default() -> Self {
        Self::new("hi-hub", Self::DEFAULT_MARKER)
    }
}

impl WakeWordDetector for ScriptedWakeWord {
    fn detect(&self, audio: &[u8]) -> Result<WakeResult, ServiceError> {
        let samples = super::pcm_to_samples(audio)?;
        let triggered = samples.iter().any(|&s| s == self.marker);
        Ok(WakeResult {
            triggered,
            keyword: triggered.then(|| self.keyword.clone()),
            confidence: if triggered { 1.0 } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::samples_to_pcm;

    #[test]
    fn silence_does_not_trigger() {
        let detector = ScriptedWakeWord::default();
        let audio = samples_to_pcm(&vec![0i16; 512]);
        let result = detector.detect(&audio).unwrap();
        assert!(!result.triggered);
        assert!(result.keyword.is_none());
    }

    #[test]
    fn marker_triggers_with_keyword() {
        let detector = ScriptedWakeWord::default();
        let mut samples = vec![0i16; 512];
        samples[100] = ScriptedWakeWord::DEFAULT_MARKER;
        let result = detector.detect(&samples_to_pcm(&samples)).unwrap();
        assert!(result.triggered);
        assert_eq!(result.keyword.as_deref(), Some("hi-hub"));
        assert_eq!(result.confidence, 1.0);
    }
}
