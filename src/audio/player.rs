//! Non-blocking PCM player with interrupt support
//!
//! The cpal output stream lives on a worker thread; callers interact with
//! an audio queue and atomic flags, so `interrupt()` is safe from any
//! thread. `stop()` closes the stream and drains the queue without firing
//! the interrupt callback; only `interrupt()` fires it, exactly once per
//! play session. Callback errors are logged and never reach the caller.

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::barge_in::BargeInMonitor;
use crate::audio::codec;
use crate::types::{PcmBuffer, StreamMetrics};

/// Playback session outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Completed,
    Interrupted,
    Failed,
}

/// One-shot latch with blocking wait
struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        if let Ok(mut flag) = self.flag.lock() {
            *flag = true;
            self.cond.notify_all();
        }
    }

    fn reset(&self) {
        if let Ok(mut flag) = self.flag.lock() {
            *flag = false;
        }
    }

    fn is_set(&self) -> bool {
        self.flag.lock().map(|f| *f).unwrap_or(false)
    }

    /// Wait until set; `timeout` of None blocks indefinitely
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut flag = match self.flag.lock() {
            Ok(f) => f,
            Err(_) => return false,
        };
        while !*flag {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = match self.cond.wait_timeout(flag, deadline - now) {
                        Ok(r) => r,
                        Err(_) => return false,
                    };
                    flag = guard;
                }
                None => {
                    flag = match self.cond.wait(flag) {
                        Ok(f) => f,
                        Err(_) => return false,
                    };
                }
            }
        }
        true
    }
}

/// Callback fired exactly once per play session on interrupt
pub type InterruptCallback = Box<dyn Fn() + Send + Sync>;

struct PlayerShared {
    /// Mono samples awaiting playback, at the device rate
    queue: Mutex<VecDeque<i16>>,
    /// No further samples will be queued this session
    finished_queueing: AtomicBool,
    stop_requested: AtomicBool,
    interrupted: AtomicBool,
    interrupt_fired: AtomicBool,
    state: Mutex<PlayerState>,
    playback_error: Mutex<Option<String>>,
    on_interrupt: Mutex<Option<InterruptCallback>>,
    /// Samples consumed by the output callback (device rate)
    samples_consumed: AtomicUsize,
    /// Actual output device rate, set by the worker after opening
    device_rate: AtomicU32,
    playback_complete: Signal,
    stream_closed: Signal,
}

impl PlayerShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            finished_queueing: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt_fired: AtomicBool::new(false),
            state: Mutex::new(PlayerState::Idle),
            playback_error: Mutex::new(None),
            on_interrupt: Mutex::new(None),
            samples_consumed: AtomicUsize::new(0),
            device_rate: AtomicU32::new(0),
            playback_complete: Signal::new(),
            stream_closed: Signal::new(),
        }
    }

    fn set_state(&self, state: PlayerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn set_error(&self, message: String) {
        if let Ok(mut guard) = self.playback_error.lock() {
            *guard = Some(message);
        }
    }
}

/// Plays a PCM sample buffer or a streamed byte sequence without blocking
/// the caller.
pub struct NonBlockingPlayer {
    shared: Arc<PlayerShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl NonBlockingPlayer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PlayerShared::new()),
            worker: Mutex::new(None),
        }
    }

    /// Create with an interrupt callback already attached
    pub fn with_on_interrupt(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let player = Self::new();
        player.set_on_interrupt(callback);
        player
    }

    /// Attach or replace the interrupt callback
    pub fn set_on_interrupt(&self, callback: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut guard) = self.shared.on_interrupt.lock() {
            *guard = Some(Box::new(callback));
        }
    }

    /// Play a sample buffer. Resets the interrupted flag and error, primes
    /// the audio queue, starts the output stream, and returns. In blocking
    /// mode, returns once playback completes.
    pub fn play(
        &self,
        samples: &PcmBuffer,
        blocking: bool,
        on_interrupt: Option<InterruptCallback>,
    ) -> Result<()> {
        self.begin_session(on_interrupt);

        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
            queue.extend(samples.samples().iter().copied());
        }
        self.shared.finished_queueing.store(true, Ordering::SeqCst);

        self.spawn_worker(samples.sample_rate())?;

        if blocking {
            self.shared.playback_complete.wait(None);
            if let Some(err) = self.playback_error() {
                bail!("playback failed: {}", err);
            }
        }
        Ok(())
    }

    /// Play a streamed byte sequence of raw PCM chunks.
    ///
    /// Checks the interrupt flag both before pulling a chunk and after
    /// queueing it. If a barge-in monitor is attached, captured audio is
    /// copied into the returned metrics on interrupt.
    pub async fn play_stream<S>(
        &self,
        mut chunks: S,
        sample_rate: u32,
        monitor: Option<&BargeInMonitor>,
    ) -> Result<StreamMetrics>
    where
        S: futures_util::Stream<Item = Result<Vec<u8>>> + Unpin,
    {
        self.begin_session(None);
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
        self.shared.finished_queueing.store(false, Ordering::SeqCst);

        self.spawn_worker(sample_rate)?;

        let started = Instant::now();
        let mut metrics = StreamMetrics::default();
        let mut leftover: Option<u8> = None;
        // Cumulative device-rate sample count at the end of each chunk
        let mut chunk_boundaries: Vec<usize> = Vec::new();
        let mut queued_samples = 0usize;
        let mut stream_error: Option<String> = None;

        loop {
            if self.shared.interrupted.load(Ordering::SeqCst)
                || self.shared.stop_requested.load(Ordering::SeqCst)
            {
                break;
            }
            if self.playback_error().is_some() {
                break;
            }

            let item = chunks.next().await;
            let bytes = match item {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    stream_error = Some(e.to_string());
                    break;
                }
                None => break,
            };

            if metrics.chunks_received == 0 {
                metrics.ttfa = Some(started.elapsed().as_secs_f64());
            }
            metrics.chunks_received += 1;
            metrics.total_bytes += bytes.len();

            // Re-join a carried odd byte with the next chunk
            let mut data = Vec::with_capacity(bytes.len() + 1);
            if let Some(b) = leftover.take() {
                data.push(b);
            }
            data.extend_from_slice(&bytes);
            if data.len() % 2 == 1 {
                leftover = data.pop();
            }

            let mut samples = codec::le_bytes_to_i16(&data);
            let device_rate = self.shared.device_rate.load(Ordering::SeqCst);
            if device_rate != 0 && device_rate != sample_rate {
                samples = codec::resample(&samples, sample_rate, device_rate);
            }

            queued_samples += samples.len();
            chunk_boundaries.push(queued_samples);
            if let Ok(mut queue) = self.shared.queue.lock() {
                queue.extend(samples);
            }

            if self.shared.interrupted.load(Ordering::SeqCst) {
                break;
            }
        }

        metrics.generation_time = Some(started.elapsed().as_secs_f64());
        self.shared.finished_queueing.store(true, Ordering::SeqCst);

        if let Some(err) = stream_error {
            self.shared.set_error(err.clone());
            self.shared.set_state(PlayerState::Failed);
            let _ = self.stop();
            bail!("TTS stream failed: {}", err);
        }

        // Wait for the queue to drain or an interrupt to land
        loop {
            if self.shared.playback_complete.is_set()
                || self.shared.interrupted.load(Ordering::SeqCst)
                || self.shared.stop_requested.load(Ordering::SeqCst)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let consumed = self.shared.samples_consumed.load(Ordering::SeqCst);
        metrics.chunks_played = chunk_boundaries.iter().filter(|&&b| b <= consumed).count();

        if !self.shared.interrupted.load(Ordering::SeqCst) {
            if let Some(err) = self.playback_error() {
                bail!("playback failed: {}", err);
            }
        }

        if self.shared.interrupted.load(Ordering::SeqCst) {
            metrics.interrupted = true;
            let device_rate = self.shared.device_rate.load(Ordering::SeqCst).max(1);
            metrics.interrupted_at = Some(consumed as f64 / device_rate as f64);

            if let Some(monitor) = monitor {
                if let Some(captured) = monitor.get_captured_audio() {
                    metrics.captured_samples = captured.len();
                    metrics.captured_audio = Some(captured);
                }
            }
        } else {
            metrics.chunks_played = metrics.chunks_received;
        }

        Ok(metrics)
    }

    /// Close the stream, drain the queue, and signal completion. Does NOT
    /// fire the interrupt callback. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if !self.shared.stream_closed.wait(Some(Duration::from_secs(2))) {
                warn!("Player worker did not close the stream in time");
            }
            let _ = handle.join();
        }

        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
        self.shared.playback_complete.set();
        Ok(())
    }

    /// Stop playback and fire the interrupt callback (once per session).
    ///
    /// Errors inside the callback are logged, never propagated. Even if
    /// `stop()` fails, the interrupted flag is set.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);

        if let Err(e) = self.stop() {
            error!("Player stop during interrupt failed: {}", e);
        }
        self.shared.set_state(PlayerState::Interrupted);

        if !self.shared.interrupt_fired.swap(true, Ordering::SeqCst) {
            let guard = self.shared.on_interrupt.lock();
            if let Ok(guard) = guard {
                if let Some(callback) = guard.as_ref() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback();
                    }));
                    if result.is_err() {
                        error!("on_interrupt callback raised; continuing");
                    }
                }
            }
        }
    }

    /// Block until playback completes or the timeout elapses. Returns
    /// true if playback completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.shared.playback_complete.wait(Some(timeout))
    }

    /// Whether the current/most recent play session was interrupted
    pub fn was_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state.lock().map(|s| *s).unwrap_or(PlayerState::Idle)
    }

    pub fn playback_error(&self) -> Option<String> {
        self.shared.playback_error.lock().ok().and_then(|e| e.clone())
    }

    /// Reset per-session flags and attach the session callback
    fn begin_session(&self, on_interrupt: Option<InterruptCallback>) {
        // Release any previous session first
        let _ = self.stop();

        self.shared.interrupted.store(false, Ordering::SeqCst);
        self.shared.interrupt_fired.store(false, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.samples_consumed.store(0, Ordering::SeqCst);
        self.shared.playback_complete.reset();
        self.shared.stream_closed.reset();
        if let Ok(mut err) = self.shared.playback_error.lock() {
            *err = None;
        }
        if let Some(callback) = on_interrupt {
            if let Ok(mut guard) = self.shared.on_interrupt.lock() {
                *guard = Some(callback);
            }
        }
        self.shared.set_state(PlayerState::Playing);
    }

    fn spawn_worker(&self, sample_rate: u32) -> Result<()> {
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || playback_worker(shared, sample_rate))
            .context("Failed to spawn playback thread")?;
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
        Ok(())
    }
}

impl Default for NonBlockingPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NonBlockingPlayer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn playback_worker(shared: Arc<PlayerShared>, sample_rate: u32) {
    let stream = match open_output_stream(&shared, sample_rate) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Audio output unavailable: {}", e);
            shared.set_error(e.to_string());
            shared.set_state(PlayerState::Failed);
            shared.stream_closed.set();
            shared.playback_complete.set();
            return;
        }
    };

    if let Err(e) = stream.play() {
        shared.set_error(e.to_string());
        shared.set_state(PlayerState::Failed);
        drop(stream);
        shared.stream_closed.set();
        shared.playback_complete.set();
        return;
    }

    // Park until the queue drains or a stop lands
    while !shared.playback_complete.is_set() && !shared.stop_requested.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(5));
    }

    // Close the stream and drain anything left, atomically from the
    // caller's point of view: stream_closed is only set afterwards.
    drop(stream);
    if let Ok(mut queue) = shared.queue.lock() {
        queue.clear();
    }

    if shared.interrupted.load(Ordering::SeqCst) {
        shared.set_state(PlayerState::Interrupted);
    } else if shared.playback_error.lock().map(|e| e.is_some()).unwrap_or(false) {
        shared.set_state(PlayerState::Failed);
    } else {
        shared.set_state(PlayerState::Completed);
    }

    shared.stream_closed.set();
    shared.playback_complete.set();
    debug!("Playback worker exited");
}

fn open_output_stream(shared: &Arc<PlayerShared>, sample_rate: u32) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("speakers not found")?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let default_config = device
        .default_output_config()
        .context("Failed to get output config")?;
    let channels = default_config.channels();

    // Prefer the source rate when the device supports it
    let device_rate = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.min_sample_rate().0 <= sample_rate && sample_rate <= c.max_sample_rate().0
            })
        })
        .map(|_| sample_rate)
        .unwrap_or(default_config.sample_rate().0);

    shared.device_rate.store(device_rate, Ordering::SeqCst);

    // Buffered sessions are primed at the source rate; convert in place
    // when the device cannot run at that rate.
    if device_rate != sample_rate {
        if let Ok(mut queue) = shared.queue.lock() {
            if !queue.is_empty() {
                let samples: Vec<i16> = queue.drain(..).collect();
                queue.extend(codec::resample(&samples, sample_rate, device_rate));
            }
        }
    }

    info!(
        "Output device: {} ({} Hz, {} ch)",
        device_name, device_rate, channels
    );

    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = shared.clone();
    let err_fn = |err| warn!("Audio output error: {}", err);

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels as usize;
            let mut written = 0usize;
            if let Ok(mut queue) = callback_shared.queue.lock() {
                while written < frames {
                    match queue.pop_front() {
                        Some(sample) => {
                            let value = sample as f32 / 32768.0;
                            for ch in 0..channels as usize {
                                data[written * channels as usize + ch] = value;
                            }
                            written += 1;
                        }
                        None => break,
                    }
                }
                let drained = queue.is_empty();
                drop(queue);
                callback_shared
                    .samples_consumed
                    .fetch_add(written, Ordering::SeqCst);
                if drained && callback_shared.finished_queueing.load(Ordering::SeqCst) {
                    callback_shared.playback_complete.set();
                }
            }
            // Underrun: pad with silence, never crash
            for slot in data[written * channels as usize..].iter_mut() {
                *slot = 0.0;
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interrupt_sets_flag_and_fires_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let player = NonBlockingPlayer::with_on_interrupt(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!player.was_interrupted());
        player.interrupt();

        assert!(player.was_interrupted());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(player.state(), PlayerState::Interrupted);
    }

    #[test]
    fn test_interrupt_callback_fires_once_per_session() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let player = NonBlockingPlayer::with_on_interrupt(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        player.interrupt();
        player.interrupt();
        player.interrupt();

        assert!(player.was_interrupted());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_without_callback_is_safe() {
        let player = NonBlockingPlayer::new();
        player.interrupt();
        assert!(player.was_interrupted());
    }

    #[test]
    fn test_callback_panic_is_swallowed() {
        let player = NonBlockingPlayer::with_on_interrupt(|| {
            panic!("callback failed");
        });
        player.interrupt();
        assert!(player.was_interrupted());
    }

    #[test]
    fn test_stop_does_not_fire_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let player = NonBlockingPlayer::with_on_interrupt(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        player.stop().unwrap();

        assert!(!player.was_interrupted());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_is_idempotent_and_drains_queue() {
        let player = NonBlockingPlayer::new();
        if let Ok(mut queue) = player.shared.queue.lock() {
            queue.extend([1i16, 2, 3]);
        }
        player.stop().unwrap();
        player.stop().unwrap();
        assert!(player.shared.queue.lock().unwrap().is_empty());
        assert!(player.shared.playback_complete.is_set());
    }

    #[test]
    fn test_queue_empty_after_interrupt() {
        let player = NonBlockingPlayer::new();
        if let Ok(mut queue) = player.shared.queue.lock() {
            queue.extend(std::iter::repeat(0i16).take(4800));
        }
        player.interrupt();
        assert!(player.shared.queue.lock().unwrap().is_empty());
        assert!(player.was_interrupted());
    }

    #[test]
    fn test_wait_times_out_while_incomplete() {
        let player = NonBlockingPlayer::new();
        player.shared.playback_complete.reset();
        assert!(!player.wait(Duration::from_millis(20)));
        player.shared.playback_complete.set();
        assert!(player.wait(Duration::from_millis(20)));
    }

    #[test]
    fn test_signal_latch() {
        let signal = Signal::new();
        assert!(!signal.is_set());
        assert!(!signal.wait(Some(Duration::from_millis(10))));
        signal.set();
        assert!(signal.is_set());
        assert!(signal.wait(Some(Duration::from_millis(10))));
        signal.reset();
        assert!(!signal.is_set());
    }
}
