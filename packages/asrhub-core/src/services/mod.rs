//! Pipeline service contracts and reference implementations.
//!
//! Every service is a stateless callable over 16 kHz mono int16 PCM (the VAD
//! keeps an internal rolling silence window behind interior mutability).
//! Concrete models live outside this crate; the reference implementations
//! here make the pipeline runnable end-to-end and give tests deterministic
//! detectors.
//!
//! Failure semantics: [`ServiceError::Unavailable`] is a soft error — the
//! effects layer logs it, emits an error event, and skips the stage for the
//! current window without aborting the session.

mod convert;
mod recorder;
mod vad;
mod wakeword;

pub use convert::LinearConverter;
pub use recorder::{RecorderError, RecorderService, RecordingMarker};
pub use vad::EnergyVad;
pub use wakeword::ScriptedWakeWord;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::audio::AudioFormat;

/// Errors surfaced by pipeline services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Soft error: the service cannot process the current window.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The input bytes do not form whole samples for the declared format.
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// What the enhanced audio is destined for; tunes the enhancement profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancePurpose {
    Vad,
    Wakeword,
    Asr,
    Recording,
    General,
}

/// Summary of what an enhancement pass did.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EnhanceReport {
    pub gain_db: f32,
    pub clipped: bool,
}

/// Outcome of one VAD window.
#[derive(Debug, Clone, Serialize)]
pub struct VadResult {
    pub is_speech: bool,
    pub probability: f32,
    /// Seconds of sustained silence, measured by the VAD's own rolling window.
    pub silence_duration: f64,
}

/// Outcome of one wake-word window.
#[derive(Debug, Clone, Serialize)]
pub struct WakeResult {
    pub triggered: bool,
    pub keyword: Option<String>,
    pub confidence: f32,
}

/// Sample format and rate conversion.
pub trait Converter: Send + Sync {
    /// Converts raw PCM between arbitrary formats.
    fn convert(&self, audio: &[u8], from: AudioFormat, to: AudioFormat)
        -> Result<Bytes, ServiceError>;

    /// Shortcut to the hub-internal 16 kHz mono int16 format.
    fn to_hub_format(&self, audio: &[u8], source: AudioFormat) -> Result<Bytes, ServiceError> {
        if source.is_hub_format() {
            return Ok(Bytes::copy_from_slice(audio));
        }
        self.convert(audio, source, AudioFormat::HUB)
    }
}

/// Purpose-aware audio enhancement.
pub trait Enhancer: Send + Sync {
    fn auto_enhance(
        &self,
        audio: &[u8],
        purpose: EnhancePurpose,
    ) -> Result<(Bytes, EnhanceReport), ServiceError>;
}

/// Noise suppression over a whole utterance or window.
pub trait Denoiser: Send + Sync {
    fn denoise(&self, audio: &[u8]) -> Result<Bytes, ServiceError>;
}

/// Voice activity detection over fixed windows.
pub trait VadDetector: Send + Sync {
    fn detect(&self, audio: &[u8]) -> Result<VadResult, ServiceError>;

    /// Clears the rolling silence window (called when capture starts).
    fn reset(&self);
}

/// Wake-word detection over fixed windows.
pub trait WakeWordDetector: Send + Sync {
    fn detect(&self, audio: &[u8]) -> Result<WakeResult, ServiceError>;
}

/// Enhancer that passes audio through untouched.
///
/// Stands in when no enhancement model is configured; keeps the pipeline
/// shape identical whether or not enhancement is enabled.
pub struct PassthroughEnhancer;

impl Enhancer for PassthroughEnhancer {
    fn auto_enhance(
        &self,
        audio: &[u8],
        _purpose: EnhancePurpose,
    ) -> Result<(Bytes, EnhanceReport), ServiceError> {
        Ok((Bytes::copy_from_slice(audio), EnhanceReport::default()))
    }
}

/// Denoiser that passes audio through untouched.
pub struct PassthroughDenoiser;

impl Denoiser for PassthroughDenoiser {
    fn denoise(&self, audio: &[u8]) -> Result<Bytes, ServiceError> {
        Ok(Bytes::copy_from_slice(audio))
    }
}

/// Decodes a little-endian int16 PCM byte slice.
pub(crate) fn pcm_to_samples(audio: &[u8]) -> Result<Vec<i16>, ServiceError> {
    if audio.len() % 2 != 0 {
        return Err(ServiceError::MalformedInput(format!(
            "odd byte count {} for int16 PCM",
            audio.len()
        )));
    }
    Ok(audio
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encodes int16 samples back to little-endian bytes.
pub(crate) fn samples_to_pcm(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_pcm(&samples);
        assert_eq!(pcm_to_samples(&bytes).unwrap(), samples);
    }

    #[test]
    fn odd_byte_count_is_malformed() {
        assert!(matches!(
            pcm_to_samples(&[0u8; 3]),
            Err(ServiceError::MalformedInput(_))
        ));
    }

    #[test]
    fn passthrough_enhancer_keeps_bytes() {
        let (out, report) = PassthroughEnhancer
            .auto_enhance(&[1, 2, 3, 4], EnhancePurpose::Asr)
            .unwrap();
        assert_eq!(&out[..], &[1, 2, 3, 4]);
        assert_eq!(report.gain_db, 0.0);
    }
}
