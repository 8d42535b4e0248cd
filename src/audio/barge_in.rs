//! Barge-in monitor
//!
//! Watches the microphone while TTS is playing. When accumulated speech
//! reaches `min_speech_ms`, fires a one-shot callback (typically
//! `player.interrupt`) and keeps buffering captured audio until stopped,
//! so the utterance that interrupted playback can go straight to STT.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::io::{AudioInput, FrameSource};
use crate::audio::vad::{VadConfig, VoiceDetector, WebRtcVoiceDetector};
use crate::types::PcmBuffer;

/// Monitor session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInState {
    Stopped,
    Listening,
    /// Terminal for one session; the callback fires exactly once
    VoiceDetected,
}

/// Barge-in tuning
#[derive(Debug, Clone)]
pub struct BargeInConfig {
    pub vad: VadConfig,
    /// Accumulated speech required before the callback fires
    pub min_speech_ms: u64,
    /// Bound on the onset pre-roll kept before detection
    pub buffer_window_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            min_speech_ms: 150,
            buffer_window_ms: 1_000,
        }
    }
}

struct MonitorShared {
    state: Mutex<BargeInState>,
    voice_detected: AtomicBool,
    stop: AtomicBool,
    capture: Mutex<Vec<i16>>,
}

impl MonitorShared {
    fn set_state(&self, state: BargeInState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

/// Monitors capture frames for voice and fires a one-shot interrupt
pub struct BargeInMonitor {
    config: BargeInConfig,
    available: bool,
    shared: Arc<MonitorShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BargeInMonitor {
    pub fn new(config: BargeInConfig) -> Self {
        let available = config.vad.is_supported();
        if !available {
            warn!(
                "Barge-in unavailable: unsupported VAD config {:?}",
                config.vad
            );
        }
        Self {
            config,
            available,
            shared: Arc::new(MonitorShared {
                state: Mutex::new(BargeInState::Stopped),
                voice_detected: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                capture: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Whether VAD support is present; when false, `start_monitoring` is a no-op
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Begin monitoring the default microphone. The callback is invoked on
    /// the monitor worker, receives no arguments, and fires at most once
    /// per session; exceptions inside it are logged and swallowed.
    pub fn start_monitoring(&self, on_voice: impl Fn() + Send + Sync + 'static) -> Result<()> {
        if !self.available {
            debug!("Barge-in start ignored: VAD unavailable");
            return Ok(());
        }

        let input =
            AudioInput::open(self.config.vad.sample_rate).context("Barge-in microphone open")?;
        let source = input.frame_source(self.config.vad.frame_ms)?;
        let detector = WebRtcVoiceDetector::new(self.config.vad)?;

        self.start_with_source(Box::new(source), Box::new(detector), on_voice, Some(input))
    }

    /// Start with an explicit frame source and detector. Used by tests and
    /// callers that already own a capture stream.
    pub fn start_with_source(
        &self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn VoiceDetector>,
        on_voice: impl Fn() + Send + Sync + 'static,
        input: Option<AudioInput>,
    ) -> Result<()> {
        // Reset the previous session
        self.stop_monitoring();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.voice_detected.store(false, Ordering::SeqCst);
        if let Ok(mut capture) = self.shared.capture.lock() {
            capture.clear();
        }
        self.shared.set_state(BargeInState::Listening);

        let shared = self.shared.clone();
        let config = self.config.clone();
        let callback: Box<dyn Fn() + Send + Sync> = Box::new(on_voice);
        let handle = std::thread::Builder::new()
            .name("barge-in".to_string())
            .spawn(move || {
                // Keep the capture stream alive for the whole session
                let _input = input;
                monitor_loop(shared, source, detector, config, callback);
            })
            .context("Failed to spawn barge-in worker")?;

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
        info!("Barge-in monitoring started");
        Ok(())
    }

    /// Stop the worker and end the session. Safe to call when not running.
    pub fn stop_monitoring(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!("Barge-in monitoring stopped");
        }
        self.shared.set_state(BargeInState::Stopped);
    }

    /// Whether the callback has fired this session. Safe from any thread.
    pub fn voice_detected(&self) -> bool {
        self.shared.voice_detected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BargeInState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(BargeInState::Stopped)
    }

    /// Concatenation of all buffered frames, or None if nothing was
    /// captured. Safe from any thread.
    pub fn get_captured_audio(&self) -> Option<PcmBuffer> {
        let capture = self.shared.capture.lock().ok()?;
        if capture.is_empty() {
            return None;
        }
        Some(PcmBuffer::from_samples(
            capture.clone(),
            self.config.vad.sample_rate,
        ))
    }
}

impl Drop for BargeInMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn monitor_loop(
    shared: Arc<MonitorShared>,
    mut source: Box<dyn FrameSource>,
    mut detector: Box<dyn VoiceDetector>,
    config: BargeInConfig,
    callback: Box<dyn Fn() + Send + Sync>,
) {
    let frame_ms = config.vad.frame_ms as u64;
    let window_samples =
        (config.vad.sample_rate as u64 * config.buffer_window_ms / 1000) as usize;

    // Pre-roll from the first voiced frame of the current speech run
    let mut onset: Vec<i16> = Vec::new();
    let mut speech_ms: u64 = 0;

    while !shared.stop.load(Ordering::SeqCst) {
        let frame = match source.next_frame(Duration::from_millis(100)) {
            Some(frame) => frame,
            None => {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                // Source timed out or ran dry; don't spin
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        if shared.voice_detected.load(Ordering::SeqCst) {
            // Already fired: keep buffering until stop_monitoring()
            if let Ok(mut capture) = shared.capture.lock() {
                capture.extend_from_slice(&frame);
            }
            continue;
        }

        if detector.is_voice(&frame) {
            onset.extend_from_slice(&frame);
            if onset.len() > window_samples {
                let excess = onset.len() - window_samples;
                onset.drain(..excess);
            }
            speech_ms += frame_ms;

            if speech_ms >= config.min_speech_ms {
                if let Ok(mut capture) = shared.capture.lock() {
                    capture.extend_from_slice(&onset);
                }
                onset.clear();
                shared.set_state(BargeInState::VoiceDetected);
                shared.voice_detected.store(true, Ordering::SeqCst);

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                }));
                if result.is_err() {
                    error!("Barge-in callback raised; VoiceDetected stands");
                }
                info!("Barge-in: voice detected after {} ms of speech", speech_ms);
            }
        } else {
            speech_ms = 0;
            onset.clear();
        }
    }
}
