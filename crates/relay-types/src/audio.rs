//! Audio format description shared by the frame buffer and providers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample encodings the relay can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 μ-law, one byte per sample. Telephony default.
    #[default]
    Mulaw,
    /// Signed 16-bit little-endian PCM.
    Linear16,
}

impl AudioEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Mulaw => 1,
            Self::Linear16 => 2,
        }
    }

    /// Provider-facing encoding name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mulaw => "mulaw",
            Self::Linear16 => "linear16",
        }
    }
}

/// Format of the raw audio a session exchanges with its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Mulaw,
            sample_rate: 8_000,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Bytes of audio per second of wall-clock time.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.encoding.bytes_per_sample()
    }

    /// Number of bytes covering `duration` of audio, rounded down.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        (self.bytes_per_second() as u128 * duration.as_millis() / 1_000) as usize
    }
}
