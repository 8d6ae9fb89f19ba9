//! Linear-interpolation PCM converter.

use bytes::Bytes;

use super::{pcm_to_samples, samples_to_pcm, Converter, ServiceError};
use crate::audio::AudioFormat;

/// Converter using channel averaging for downmix and linear interpolation
/// for resampling. Adequate for detector front-ends; ASR-bound audio keeps
/// whatever fidelity the client sent once it is at the hub rate.
pub struct LinearConverter;

impl LinearConverter {
    /// Downmixes interleaved frames to mono by averaging channels.
    fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
        if channels <= 1 {
            return samples.to_vec();
        }
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    }

    /// Linear resampling from `from_rate` to `to_rate` over mono samples.
    fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
        if from_rate == to_rate || samples.is_empty() {
            return samples.to_vec();
        }
        let ratio = from_rate as f64 / to_rate as f64;
        let out_len = ((samples.len() as f64) / ratio).floor() as usize;
        let mut out = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let src = i as f64 * ratio;
            let idx = src.floor() as usize;
            let frac = src - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
        out
    }
}

impl Converter for LinearConverter {
    fn convert(
        &self,
        audio: &[u8],
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Bytes, ServiceError> {
        if from.sample_width != 2 || to.sample_width != 2 {
            return Err(ServiceError::Unavailable(
                "only int16 PCM is supported".to_string(),
            ));
        }
        if to.channels != 1 {
            return Err(ServiceError::Unavailable(
                "only mono output is supported".to_string(),
            ));
        }
        let samples = pcm_to_samples(audio)?;
        if from.channels > 1 && samples.len() % from.channels as usize != 0 {
            return Err(ServiceError::MalformedInput(format!(
                "{} samples not divisible by {} channels",
                samples.len(),
                from.channels
            )));
        }
        let mono = Self::downmix(&samples, from.channels as usize);
        let resampled = Self::resample(&mono, from.sample_rate, to.sample_rate);
        Ok(samples_to_pcm(&resampled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_already_hub_format() {
        let audio = samples_to_pcm(&[1, 2, 3, 4]);
        let out = LinearConverter
            .to_hub_format(&audio, AudioFormat::HUB)
            .unwrap();
        assert_eq!(out, audio);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let stereo = samples_to_pcm(&[100, 200, -100, 300]);
        let out = LinearConverter
            .convert(
                &stereo,
                AudioFormat::new(16_000, 2, 2),
                AudioFormat::HUB,
            )
            .unwrap();
        assert_eq!(pcm_to_samples(&out).unwrap(), vec![150, 100]);
    }

    #[test]
    fn downsampling_halves_sample_count() {
        let samples: Vec<i16> = (0..320).collect();
        let audio = samples_to_pcm(&samples);
        let out = LinearConverter
            .convert(&audio, AudioFormat::new(32_000, 1, 2), AudioFormat::HUB)
            .unwrap();
        assert_eq!(pcm_to_samples(&out).unwrap().len(), 160);
    }

    #[test]
    fn rejects_unsupported_width() {
        let err = LinearConverter
            .convert(&[0u8; 8], AudioFormat::new(16_000, 1, 4), AudioFormat::HUB)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }
}
