//! Audio format descriptor and PCM byte math.

use serde::{Deserialize, Serialize};

/// Description of a raw PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample (2 for int16).
    pub sample_width: u16,
}

impl AudioFormat {
    /// The hub's internal format: 16 kHz mono int16.
    pub const HUB: Self = Self {
        sample_rate: 16_000,
        channels: 1,
        sample_width: 2,
    };

    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, sample_width: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_width,
        }
    }

    /// Bytes per second of audio in this format.
    #[must_use]
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.sample_width as usize
    }

    /// Duration in seconds of `len` bytes of audio in this format.
    #[must_use]
    pub fn duration_secs(&self, len: usize) -> f64 {
        len as f64 / self.bytes_per_second() as f64
    }

    /// Byte count covering `secs` seconds, rounded down to a whole sample.
    #[must_use]
    pub fn secs_to_bytes(&self, secs: f64) -> usize {
        let frame = self.channels as usize * self.sample_width as usize;
        let bytes = (secs * self.bytes_per_second() as f64) as usize;
        bytes - bytes % frame
    }

    /// Whether this is already the hub-internal format.
    #[must_use]
    pub fn is_hub_format(&self) -> bool {
        *self == Self::HUB
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::HUB
    }
}
