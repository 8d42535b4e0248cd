//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Sample rate used for speech recognition input
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate TTS providers typically stream at
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Captured audio shorter than this is treated as a barge-in false positive
pub const MIN_CAPTURED_SAMPLES: usize = 100;

/// On-wire audio container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw 16-bit signed little-endian PCM, no header
    Pcm,
    Wav,
    Mp3,
    Opus,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Pcm => "pcm",
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Opus => "opus",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Pcm => "audio/pcm",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Opus => "audio/opus",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm" => Ok(AudioFormat::Pcm),
            "wav" => Ok(AudioFormat::Wav),
            "mp3" => Ok(AudioFormat::Mp3),
            "opus" => Ok(AudioFormat::Opus),
            other => Err(format!("unknown audio format: {}", other)),
        }
    }
}

/// Encoded audio with the metadata needed to decode it.
///
/// Only the codec layer pattern-matches on `format`; everything else
/// passes this struct through opaquely.
#[derive(Debug, Clone)]
pub struct AudioBytes {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<u8>,
}

impl AudioBytes {
    pub fn new(format: AudioFormat, sample_rate: u32, channels: u16, data: Vec<u8>) -> Self {
        Self {
            format,
            sample_rate,
            channels,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A buffer of 16-bit signed mono PCM samples at a single sample rate.
///
/// Produced by capture, consumed by playback and the STT pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl PcmBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels: 1,
        }
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Append samples, preserving capture order
    pub fn push(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    /// Raw little-endian bytes of the samples
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// Timing breakdown for one streamed TTS playback
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    /// Time to first audio, seconds
    pub ttfa: Option<f64>,
    /// Total generation time, seconds
    pub generation_time: Option<f64>,
    pub chunks_received: usize,
    pub chunks_played: usize,
    pub total_bytes: usize,
    pub interrupted: bool,
    /// Elapsed playback seconds at the moment of interrupt
    pub interrupted_at: Option<f64>,
    /// Audio captured by the barge-in monitor, when one was attached
    pub captured_audio: Option<PcmBuffer>,
    pub captured_samples: usize,
}

impl StreamMetrics {
    /// Whether the captured audio is long enough to hand to STT
    pub fn has_usable_capture(&self) -> bool {
        self.captured_audio
            .as_ref()
            .map(|b| b.len() >= MIN_CAPTURED_SAMPLES)
            .unwrap_or(false)
    }
}
