//! Audio subsystem
//!
//! Real-time audio capture and playback using:
//! - cpal: Cross-platform audio I/O (microphone input, speaker output)
//! - rodio: Decoding and simple chime playback
//! - hound: WAV file format handling
//! - webrtc-vad: Voice activity detection for barge-in
//!
//! # Architecture
//!
//! ```text
//! Microphone → AudioInput → FrameSource → BargeInMonitor ──┐
//!                                │                         │ interrupt()
//!                                └──→ recording            ▼
//! Speaker ← NonBlockingPlayer ← PCM queue ← SynthesizePipeline
//! ```
//!
//! The cpal streams are `!Send`, so each stream lives on a dedicated
//! worker thread; the rest of the crate talks to queues and atomics.

pub mod barge_in;
pub mod codec;
pub mod io;
pub mod player;
pub mod vad;

pub use barge_in::{BargeInConfig, BargeInMonitor, BargeInState};
pub use codec::{decode_to_pcm, encode_mp3, encode_wav};
pub use io::{AudioInput, FrameSource, RecordingOptions};
pub use player::{NonBlockingPlayer, PlayerState};
pub use vad::{VadConfig, VoiceDetector, WebRtcVoiceDetector};
