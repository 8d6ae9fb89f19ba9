//! Energy-threshold voice activity detector.

use parking_lot::Mutex;

use super::{pcm_to_samples, ServiceError, VadDetector, VadResult};
use crate::audio::AudioFormat;

/// RMS-energy VAD with an internal rolling silence window.
///
/// Windows whose root-mean-square amplitude reaches `threshold` count as
/// speech; silence accumulates across consecutive non-speech windows using
/// the audio duration of each window (not wall time), which keeps detection
/// deterministic regardless of scheduling.
pub struct EnergyVad {
    threshold: f64,
    silence_secs: Mutex<f64>,
}

impl EnergyVad {
    /// Default RMS threshold (int16 full scale is 32768).
    pub const DEFAULT_THRESHOLD: f64 = 500.0;

    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            silence_secs: Mutex::new(0.0),
        }
    }

    fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl VadDetector for EnergyVad {
    fn detect(&self, audio: &[u8]) -> Result<VadResult, ServiceError> {
        let samples = pcm_to_samples(audio)?;
        let rms = Self::rms(&samples);
        let is_speech = rms >= self.threshold;
        let window_secs = AudioFormat::HUB.duration_secs(audio.len());

        let mut silence = self.silence_secs.lock();
        if is_speech {
            *silence = 0.0;
        } else {
            *silence += window_secs;
        }

        // Probability as a soft margin around the threshold.
        let probability = (rms / (self.threshold * 2.0)).clamp(0.0, 1.0) as f32;
        Ok(VadResult {
            is_speech,
            probability,
            silence_duration: *silence,
        })
    }

    fn reset(&self) {
        *self.silence_secs.lock() = 0.0;
    }
}
