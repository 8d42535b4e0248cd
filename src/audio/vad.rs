//! Voice activity detection
//!
//! Thin wrapper around webrtc-vad. Aggressiveness 0..=3 maps onto the
//! WebRTC modes; frames must be 10, 20, or 30 ms at 8/16/32/48 kHz.

use anyhow::{bail, Result};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies short frames as speech vs non-speech
pub trait VoiceDetector: Send {
    /// True if the frame contains speech
    fn is_voice(&mut self, frame: &[i16]) -> bool;
}

/// Parameters for the WebRTC detector
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// 0 (least filtering) ..= 3 (most aggressive filtering of non-speech)
    pub aggressiveness: u8,
    pub sample_rate: u32,
    pub frame_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: 2,
            sample_rate: 16_000,
            frame_ms: 20,
        }
    }
}

impl VadConfig {
    /// Whether this combination is one the VAD engine accepts
    pub fn is_supported(&self) -> bool {
        self.aggressiveness <= 3
            && matches!(self.sample_rate, 8_000 | 16_000 | 32_000 | 48_000)
            && matches!(self.frame_ms, 10 | 20 | 30)
    }

    /// Samples per frame
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }
}

/// WebRTC GMM voice activity detector
pub struct WebRtcVoiceDetector {
    vad: Vad,
    frame_len: usize,
}

// The VAD instance has no thread affinity; it is only ever driven from
// one worker at a time.
unsafe impl Send for WebRtcVoiceDetector {}

impl WebRtcVoiceDetector {
    pub fn new(config: VadConfig) -> Result<Self> {
        if !config.is_supported() {
            bail!(
                "unsupported VAD config: {} Hz / {} ms / aggressiveness {}",
                config.sample_rate,
                config.frame_ms,
                config.aggressiveness
            );
        }

        let rate = match config.sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            _ => SampleRate::Rate48kHz,
        };

        let mode = match config.aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };

        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, mode),
            frame_len: config.frame_len(),
        })
    }
}

impl VoiceDetector for WebRtcVoiceDetector {
    fn is_voice(&mut self, frame: &[i16]) -> bool {
        if frame.len() != self.frame_len {
            return false;
        }
        self.vad.is_voice_segment(frame).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_support_matrix() {
        assert!(VadConfig::default().is_supported());
        assert!(!VadConfig {
            aggressiveness: 4,
            ..VadConfig::default()
        }
        .is_supported());
        assert!(!VadConfig {
            sample_rate: 44_100,
            ..VadConfig::default()
        }
        .is_supported());
        assert!(!VadConfig {
            frame_ms: 25,
            ..VadConfig::default()
        }
        .is_supported());
    }

    #[test]
    fn test_frame_len() {
        let config = VadConfig {
            aggressiveness: 2,
            sample_rate: 16_000,
            frame_ms: 20,
        };
        assert_eq!(config.frame_len(), 320);
    }

    #[test]
    fn test_detector_rejects_wrong_frame_size() {
        let mut detector = WebRtcVoiceDetector::new(VadConfig::default()).unwrap();
        assert!(!detector.is_voice(&[0i16; 100]));
    }

    #[test]
    fn test_silence_is_not_voice() {
        let mut detector = WebRtcVoiceDetector::new(VadConfig::default()).unwrap();
        let silence = vec![0i16; 320];
        assert!(!detector.is_voice(&silence));
    }

    #[test]
    fn test_unsupported_config_rejected_at_construction() {
        let config = VadConfig {
            aggressiveness: 2,
            sample_rate: 44_100,
            frame_ms: 20,
        };
        assert!(WebRtcVoiceDetector::new(config).is_err());
    }
}
