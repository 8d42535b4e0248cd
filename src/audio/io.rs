//! Microphone capture and simple playback
//!
//! The cpal input stream lives on a dedicated worker thread (cpal streams
//! are `!Send`); consumers pull fixed-size frames through a `FrameSource`
//! backed by a shared queue. Failure to acquire a device is fatal for the
//! caller; transient underruns are logged and dropped.

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::codec;
use crate::types::PcmBuffer;

/// Frame lengths the VAD accepts
pub const VALID_FRAME_MS: [u32; 3] = [10, 20, 30];

/// A source of fixed-duration PCM frames in capture order
pub trait FrameSource: Send {
    /// Sample rate of the frames this source yields
    fn sample_rate(&self) -> u32;

    /// Samples per frame
    fn frame_len(&self) -> usize;

    /// Pull the next frame, waiting up to `timeout`. Returns None when the
    /// source has ended or no frame arrived in time.
    fn next_frame(&mut self, timeout: Duration) -> Option<Vec<i16>>;
}

struct CaptureShared {
    /// Raw mono samples at the device rate
    queue: Mutex<VecDeque<i16>>,
    cond: Condvar,
    running: AtomicBool,
    /// Set once the stream is open (or failed)
    status: Mutex<Option<Result<u32, String>>>,
    status_cond: Condvar,
}

/// Audio input (microphone) handle.
///
/// Owns the capture worker; dropping it stops the stream.
pub struct AudioInput {
    shared: Arc<CaptureShared>,
    device_rate: u32,
    requested_rate: u32,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AudioInput {
    /// Open the default input device, capturing mono at (or near) `sample_rate`
    pub fn open(sample_rate: u32) -> Result<Self> {
        let shared = Arc::new(CaptureShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            status: Mutex::new(None),
            status_cond: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_worker(worker_shared, sample_rate))
            .context("Failed to spawn capture thread")?;

        // Wait for the worker to report the actual device rate or an error
        let device_rate = {
            let mut status = shared.status.lock().unwrap();
            while status.is_none() {
                let (guard, timeout) = shared
                    .status_cond
                    .wait_timeout(status, Duration::from_secs(10))
                    .unwrap();
                status = guard;
                if timeout.timed_out() && status.is_none() {
                    shared.running.store(false, Ordering::SeqCst);
                    bail!("Timed out opening audio input device");
                }
            }
            match status.take().unwrap() {
                Ok(rate) => rate,
                Err(e) => {
                    bail!("No input device available: {}", e);
                }
            }
        };

        info!(
            "Audio input open: device {} Hz, requested {} Hz",
            device_rate, sample_rate
        );

        Ok(Self {
            shared,
            device_rate,
            requested_rate: sample_rate,
            worker: Some(worker),
        })
    }

    /// A frame source yielding `frame_ms` frames at the requested rate
    pub fn frame_source(&self, frame_ms: u32) -> Result<QueueFrameSource> {
        if !VALID_FRAME_MS.contains(&frame_ms) {
            bail!("frame_ms must be one of {:?}, got {}", VALID_FRAME_MS, frame_ms);
        }
        Ok(QueueFrameSource {
            shared: self.shared.clone(),
            device_rate: self.device_rate,
            target_rate: self.requested_rate,
            frame_len: (self.requested_rate as u64 * frame_ms as u64 / 1000) as usize,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.requested_rate
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Frame source backed by the capture queue
pub struct QueueFrameSource {
    shared: Arc<CaptureShared>,
    device_rate: u32,
    target_rate: u32,
    frame_len: usize,
}

impl FrameSource for QueueFrameSource {
    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn next_frame(&mut self, timeout: Duration) -> Option<Vec<i16>> {
        // Raw samples needed at the device rate to produce one target frame
        let raw_needed =
            (self.frame_len as u64 * self.device_rate as u64 / self.target_rate as u64) as usize;
        let raw_needed = raw_needed.max(1);

        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock().ok()?;
        loop {
            if queue.len() >= raw_needed {
                let raw: Vec<i16> = queue.drain(..raw_needed).collect();
                drop(queue);
                let frame = if self.device_rate == self.target_rate {
                    raw
                } else {
                    let mut resampled = codec::resample(&raw, self.device_rate, self.target_rate);
                    resampled.resize(self.frame_len, 0);
                    resampled
                };
                return Some(frame);
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(queue, deadline - now)
                .ok()?;
            queue = guard;
        }
    }
}

fn capture_worker(shared: Arc<CaptureShared>, requested_rate: u32) {
    let stream = match open_input_stream(&shared, requested_rate) {
        Ok((stream, rate)) => {
            let mut status = shared.status.lock().unwrap();
            *status = Some(Ok(rate));
            shared.status_cond.notify_all();
            stream
        }
        Err(e) => {
            let mut status = shared.status.lock().unwrap();
            *status = Some(Err(e.to_string()));
            shared.status_cond.notify_all();
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!("Audio input failed to start: {}", e);
        shared.running.store(false, Ordering::SeqCst);
        shared.cond.notify_all();
        return;
    }

    while shared.running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
    shared.cond.notify_all();
    debug!("Audio capture stopped");
}

fn open_input_stream(
    shared: &Arc<CaptureShared>,
    requested_rate: u32,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("microphone not found")?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using input device: {}", device_name);

    let default_config = device
        .default_input_config()
        .context("Failed to get input config")?;
    let channels = default_config.channels();
    let sample_rate = {
        let mut supported = device
            .supported_input_configs()
            .context("Failed to enumerate input configs")?;
        supported
            .find(|c| {
                c.min_sample_rate().0 <= requested_rate && requested_rate <= c.max_sample_rate().0
            })
            .map(|_| requested_rate)
            .unwrap_or(default_config.sample_rate().0)
    };

    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| warn!("Audio input error: {}", err);

    let push = {
        let shared = shared.clone();
        move |mono: Vec<i16>| {
            if let Ok(mut queue) = shared.queue.lock() {
                queue.extend(mono);
            }
            shared.cond.notify_all();
        }
    };

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => {
            let push = push.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let samples = codec::f32_to_i16(data);
                    push(codec::downmix_to_mono(&samples, channels));
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push(codec::downmix_to_mono(data, channels));
            },
            err_fn,
            None,
        )?,
        format => bail!("Unsupported input sample format: {:?}", format),
    };

    Ok((stream, sample_rate))
}

/// Bounds and thresholds for one silence-terminated recording
#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// RMS energy below which a frame counts as silence
    pub silence_threshold: f64,
    /// Trailing silence that ends the recording
    pub silence_duration: Duration,
    pub disable_silence_detection: bool,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_secs(1),
            max_duration: Duration::from_secs(120),
            silence_threshold: 0.015,
            silence_duration: Duration::from_millis(1000),
            disable_silence_detection: false,
        }
    }
}

/// RMS energy of a frame, normalized to [0, 1]
pub fn frame_energy(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame
        .iter()
        .map(|&s| {
            let f = s as f64 / 32768.0;
            f * f
        })
        .sum();
    (sum / frame.len() as f64).sqrt()
}

/// Record from a frame source until trailing silence or the max duration.
///
/// Silence only terminates the recording after speech has been heard and
/// `min_duration` has elapsed.
pub fn record_until_silence(source: &mut dyn FrameSource, opts: &RecordingOptions) -> PcmBuffer {
    let sample_rate = source.sample_rate();
    let frame_secs = source.frame_len() as f64 / sample_rate as f64;
    let mut buffer = PcmBuffer::new(sample_rate);
    let mut elapsed = 0.0f64;
    let mut heard_speech = false;
    let mut trailing_silence = 0.0f64;

    loop {
        let frame = match source.next_frame(Duration::from_millis(500)) {
            Some(f) => f,
            None => break,
        };

        buffer.push(&frame);
        elapsed += frame_secs;

        if elapsed >= opts.max_duration.as_secs_f64() {
            debug!("Recording reached max duration");
            break;
        }

        if opts.disable_silence_detection {
            continue;
        }

        if frame_energy(&frame) >= opts.silence_threshold {
            heard_speech = true;
            trailing_silence = 0.0;
        } else {
            trailing_silence += frame_secs;
        }

        if heard_speech
            && elapsed >= opts.min_duration.as_secs_f64()
            && trailing_silence >= opts.silence_duration.as_secs_f64()
        {
            break;
        }
    }

    buffer
}

/// Save a PCM buffer as a 16-bit WAV file
pub fn save_wav(buffer: &PcmBuffer, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    for &sample in buffer.samples() {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    debug!("Saved {} samples to {}", buffer.len(), path.display());
    Ok(())
}

/// Load a WAV file as mono PCM
pub fn load_wav(path: &Path) -> Result<PcmBuffer> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    let samples: Vec<i16> = reader.samples::<i16>().filter_map(|s| s.ok()).collect();
    let mono = codec::downmix_to_mono(&samples, spec.channels);
    Ok(PcmBuffer::from_samples(mono, spec.sample_rate))
}

/// Play a short audio file (chime) through the default output, blocking
/// until it finishes. Errors are returned for the caller to swallow.
pub fn play_sound_file(path: &Path) -> Result<()> {
    let (_stream, handle) =
        rodio::OutputStream::try_default().context("Failed to open audio output")?;
    let sink = rodio::Sink::try_new(&handle).context("Failed to create audio sink")?;

    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open sound file: {}", path.display()))?;
    let source = rodio::Decoder::new(std::io::BufReader::new(file))
        .context("Failed to decode sound file")?;

    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Frame source fed from a fixed sample vector, for tests
    pub struct VecFrameSource {
        samples: VecDeque<i16>,
        sample_rate: u32,
        frame_len: usize,
    }

    impl VecFrameSource {
        pub fn new(samples: Vec<i16>, sample_rate: u32, frame_ms: u32) -> Self {
            Self {
                samples: samples.into(),
                sample_rate,
                frame_len: (sample_rate as u64 * frame_ms as u64 / 1000) as usize,
            }
        }
    }

    impl FrameSource for VecFrameSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn frame_len(&self) -> usize {
            self.frame_len
        }

        fn next_frame(&mut self, _timeout: Duration) -> Option<Vec<i16>> {
            if self.samples.len() < self.frame_len {
                return None;
            }
            Some(self.samples.drain(..self.frame_len).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::VecFrameSource;
    use super::*;

    fn voiced(samples: usize) -> Vec<i16> {
        // Loud square-ish wave, well above the silence threshold
        (0..samples)
            .map(|i| if i % 8 < 4 { 8000 } else { -8000 })
            .collect()
    }

    #[test]
    fn test_frame_energy() {
        assert_eq!(frame_energy(&[]), 0.0);
        assert!(frame_energy(&[0; 160]) < 1e-9);
        assert!(frame_energy(&voiced(160)) > 0.1);
    }

    #[test]
    fn test_record_stops_on_trailing_silence() {
        let sample_rate = 16_000;
        // 600 ms voice then 2 s silence
        let mut samples = voiced(9_600);
        samples.extend(vec![0i16; 32_000]);
        let mut source = VecFrameSource::new(samples, sample_rate, 20);

        let opts = RecordingOptions {
            min_duration: Duration::from_millis(100),
            max_duration: Duration::from_secs(10),
            silence_duration: Duration::from_millis(500),
            ..RecordingOptions::default()
        };

        let buffer = record_until_silence(&mut source, &opts);
        // Stopped well before consuming all 2.6 s of input
        assert!(buffer.duration_secs() >= 1.0);
        assert!(buffer.duration_secs() < 2.0);
    }

    #[test]
    fn test_record_honors_max_duration() {
        let sample_rate = 16_000;
        let mut source = VecFrameSource::new(voiced(sample_rate as usize * 5), sample_rate, 20);

        let opts = RecordingOptions {
            min_duration: Duration::from_millis(100),
            max_duration: Duration::from_secs(1),
            ..RecordingOptions::default()
        };

        let buffer = record_until_silence(&mut source, &opts);
        assert!(buffer.duration_secs() <= 1.1);
    }

    #[test]
    fn test_record_without_silence_detection_runs_to_source_end() {
        let sample_rate = 16_000;
        let mut samples = voiced(1_600);
        samples.extend(vec![0i16; 48_000]);
        let total = samples.len();
        let mut source = VecFrameSource::new(samples, sample_rate, 20);

        let opts = RecordingOptions {
            min_duration: Duration::from_millis(100),
            max_duration: Duration::from_secs(60),
            disable_silence_detection: true,
            ..RecordingOptions::default()
        };

        let buffer = record_until_silence(&mut source, &opts);
        // Frame-aligned: everything the source had
        assert!(buffer.len() >= total - source.frame_len());
    }

    #[test]
    fn test_wav_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clip.wav");
        let buffer = PcmBuffer::from_samples(voiced(320), 16_000);

        save_wav(&buffer, &path).unwrap();
        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.samples(), buffer.samples());
        assert_eq!(loaded.sample_rate(), 16_000);
    }
}
