//! Integration tests for barge-in driving the player's interrupt path

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use voicemode::audio::barge_in::{BargeInConfig, BargeInMonitor};
use voicemode::audio::io::FrameSource;
use voicemode::audio::player::NonBlockingPlayer;
use voicemode::audio::vad::{VadConfig, VoiceDetector};

/// Frame source yielding a fixed number of "voiced" frames, then silence
struct ScriptedSource {
    frame_len: usize,
    voiced_remaining: usize,
    silent_remaining: usize,
}

impl FrameSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn next_frame(&mut self, _timeout: Duration) -> Option<Vec<i16>> {
        if self.voiced_remaining > 0 {
            self.voiced_remaining -= 1;
            // Paced like a real microphone
            std::thread::sleep(Duration::from_millis(5));
            return Some(vec![2000i16; self.frame_len]);
        }
        if self.silent_remaining > 0 {
            self.silent_remaining -= 1;
            std::thread::sleep(Duration::from_millis(5));
            return Some(vec![0i16; self.frame_len]);
        }
        None
    }
}

/// Treats any frame with a loud first sample as voice
struct LoudnessDetector;

impl VoiceDetector for LoudnessDetector {
    fn is_voice(&mut self, frame: &[i16]) -> bool {
        frame.first().map(|&s| s.abs() > 1000).unwrap_or(false)
    }
}

fn barge_in_config(min_speech_ms: u64) -> BargeInConfig {
    BargeInConfig {
        vad: VadConfig {
            aggressiveness: 2,
            sample_rate: 16_000,
            frame_ms: 20,
        },
        min_speech_ms,
        buffer_window_ms: 1_000,
    }
}

#[test]
fn test_voice_detection_interrupts_player_once() {
    let player = Arc::new(NonBlockingPlayer::new());
    let monitor = BargeInMonitor::new(barge_in_config(100));

    let interrupts = Arc::new(AtomicUsize::new(0));
    let interrupts_clone = interrupts.clone();
    player.set_on_interrupt(move || {
        interrupts_clone.fetch_add(1, Ordering::SeqCst);
    });

    // 20 voiced frames (400 ms of speech), then trailing silence
    let source = ScriptedSource {
        frame_len: 320,
        voiced_remaining: 20,
        silent_remaining: 20,
    };

    let player_for_callback = player.clone();
    monitor
        .start_with_source(
            Box::new(source),
            Box::new(LoudnessDetector),
            move || player_for_callback.interrupt(),
            None,
        )
        .unwrap();

    // Give the monitor time to accumulate 100 ms of speech and fire
    std::thread::sleep(Duration::from_millis(500));
    monitor.stop_monitoring();

    assert!(monitor.voice_detected());
    assert!(player.was_interrupted());
    assert_eq!(interrupts.load(Ordering::SeqCst), 1);

    // The captured utterance includes the onset pre-roll and is long
    // enough for STT (>= 100 samples)
    let captured = monitor.get_captured_audio().unwrap();
    assert!(captured.len() >= 100);
    assert_eq!(captured.sample_rate(), 16_000);
}

#[test]
fn test_short_blip_does_not_interrupt() {
    let player = Arc::new(NonBlockingPlayer::new());
    let monitor = BargeInMonitor::new(barge_in_config(200));

    // Only 2 voiced frames (40 ms): below the 200 ms threshold
    let source = ScriptedSource {
        frame_len: 320,
        voiced_remaining: 2,
        silent_remaining: 10,
    };

    let player_for_callback = player.clone();
    monitor
        .start_with_source(
            Box::new(source),
            Box::new(LoudnessDetector),
            move || player_for_callback.interrupt(),
            None,
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    monitor.stop_monitoring();

    assert!(!monitor.voice_detected());
    assert!(!player.was_interrupted());
    assert!(monitor.get_captured_audio().is_none());
}

#[test]
fn test_interrupt_after_detection_leaves_player_drained() {
    let player = Arc::new(NonBlockingPlayer::new());
    let monitor = BargeInMonitor::new(barge_in_config(60));

    let source = ScriptedSource {
        frame_len: 320,
        voiced_remaining: 10,
        silent_remaining: 0,
    };

    let player_for_callback = player.clone();
    monitor
        .start_with_source(
            Box::new(source),
            Box::new(LoudnessDetector),
            move || player_for_callback.interrupt(),
            None,
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(400));
    monitor.stop_monitoring();

    // After interrupt the queue is empty and wait() returns promptly
    assert!(player.was_interrupted());
    assert!(player.wait(Duration::from_millis(100)));
}

#[test]
fn test_monitor_restart_clears_previous_session() {
    let monitor = BargeInMonitor::new(barge_in_config(60));

    let fire = || {
        let source = ScriptedSource {
            frame_len: 320,
            voiced_remaining: 10,
            silent_remaining: 0,
        };
        monitor
            .start_with_source(Box::new(source), Box::new(LoudnessDetector), || {}, None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        monitor.stop_monitoring();
    };

    fire();
    assert!(monitor.voice_detected());
    let first_len = monitor.get_captured_audio().unwrap().len();

    fire();
    assert!(monitor.voice_detected());
    // Second session starts from an empty capture buffer
    assert_eq!(monitor.get_captured_audio().unwrap().len(), first_len);
}
