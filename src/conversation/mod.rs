//! Conversation orchestration
//!
//! The end-to-end loop behind `converse()`: speak a message, optionally
//! listen for a reply (with barge-in when enabled), transcribe it, and
//! post-process the transcript. Every stage emits structured events; any
//! uncaught failure is reported to the event log and returned as an error
//! string rather than propagated.
//!
//! ```text
//! converse(message)
//!   ├─ chime ─ SynthesizePipeline ──► NonBlockingPlayer
//!   │                 │  barge-in?   ▲
//!   │                 └─ BargeInMonitor ─ interrupt
//!   ├─ record (captured buffer, or silence-terminated mic recording)
//!   ├─ TranscribePipeline
//!   └─ post-process (pronunciation rules, wait/repeat phrases)
//! ```

pub mod phrases;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::barge_in::{BargeInConfig, BargeInMonitor};
use crate::audio::io::{self, RecordingOptions};
use crate::audio::player::NonBlockingPlayer;
use crate::audio::vad::VadConfig;
use crate::conch::Conch;
use crate::config::Config;
use crate::error::VoiceModeError;
use crate::events::{self, EventLog};
use crate::exchanges::{ExchangeKind, ExchangeLog, ExchangeRecord};
use crate::providers::registry::ProviderRegistry;
use crate::providers::stt::{SttOutcome, TranscribePipeline};
use crate::providers::tts::{PlaybackMode, SynthesizePipeline, TtsRequest};
use crate::types::PcmBuffer;
use phrases::{apply_rules, PronunciationRule, RuleDirection};

/// Upper bound on wait/repeat listen cycles within one converse call
const MAX_LISTEN_CYCLES: usize = 5;

/// Options for one converse call
#[derive(Debug, Clone)]
pub struct ConverseOptions {
    pub wait_for_response: bool,
    pub chime_enabled: bool,
    pub min_listen_duration: Duration,
    pub max_listen_duration: Duration,
    pub disable_silence_detection: bool,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

impl Default for ConverseOptions {
    fn default() -> Self {
        Self {
            wait_for_response: true,
            chime_enabled: true,
            min_listen_duration: Duration::from_secs(1),
            max_listen_duration: Duration::from_secs(120),
            disable_silence_detection: false,
            voice: None,
            model: None,
            language: None,
        }
    }
}

/// Drives speak → listen → transcribe conversations
pub struct Conversation {
    config: Config,
    events: Arc<EventLog>,
    exchanges: Option<ExchangeLog>,
    tts: SynthesizePipeline,
    stt: TranscribePipeline,
    rules: Vec<PronunciationRule>,
    last_spoken: Mutex<Option<String>>,
    cancel: Arc<AtomicBool>,
}

impl Conversation {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ProviderRegistry::new(
            &config.stt_base_urls,
            &config.tts_base_urls,
        ));
        let events = Arc::new(EventLog::new(config.logs_dir()));
        Self::with_parts(config, registry, events)
    }

    /// Build around an existing registry and event log
    pub fn with_parts(
        config: Config,
        registry: Arc<ProviderRegistry>,
        events: Arc<EventLog>,
    ) -> Self {
        let tts = SynthesizePipeline::new(&config, registry.clone(), events.clone());
        let stt = TranscribePipeline::new(&config, registry, events.clone());
        let exchanges = match ExchangeLog::new(config.logs_dir()) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("Exchange log unavailable: {:#}", e);
                None
            }
        };
        let rules = load_pronunciation_rules();
        Self {
            config,
            events,
            exchanges,
            tts,
            stt,
            rules,
            last_spoken: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation of the in-flight converse call
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Speak `message` and (optionally) return the user's transcribed
    /// reply. Never panics outward: failures come back as error strings.
    pub async fn converse(&self, message: &str, opts: &ConverseOptions) -> String {
        self.cancel.store(false, Ordering::SeqCst);
        let conversation_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        self.events.log_event(
            Some(conversation_id.as_str()),
            events::TOOL_REQUEST_START,
            serde_json::json!({ "wait_for_response": opts.wait_for_response }),
        );

        let result = self.converse_inner(message, opts, &conversation_id).await;

        match result {
            Ok(response) => {
                self.events.log_event(
                    Some(conversation_id.as_str()),
                    events::TOOL_REQUEST_END,
                    serde_json::Value::Null,
                );
                response
            }
            Err(e) => {
                warn!("Conversation failed: {:#}", e);
                self.events.log_event(
                    Some(conversation_id.as_str()),
                    events::TOOL_REQUEST_END,
                    serde_json::json!({
                        "error": e.to_string(),
                        "cancelled": self.cancel.load(Ordering::SeqCst),
                    }),
                );
                if self.cancel.load(Ordering::SeqCst) {
                    "Conversation cancelled".to_string()
                } else {
                    format!("Error: {}", e)
                }
            }
        }
    }

    async fn converse_inner(
        &self,
        message: &str,
        opts: &ConverseOptions,
        conversation_id: &str,
    ) -> anyhow::Result<String> {
        // Hold the conch for the duration of the conversation; released
        // on every exit path when `_conch` drops
        let _conch = if self.config.conch_enabled {
            let mut conch = Conch::new(
                self.config.conch_path(),
                "voicemode",
                self.config.conch_lock_expiry,
            );
            match conch.try_acquire() {
                Ok(true) => Some(conch),
                Ok(false) => {
                    return Ok("Another voice conversation is active".to_string());
                }
                Err(e) => {
                    debug!("Conch unavailable (continuing without): {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        if opts.chime_enabled {
            self.play_chime("chime-start").await;
        }

        // Streaming with barge-in is allowed but noisy failure modes are
        // possible when the producer is mid-send; surface that up front.
        let streaming = self.config.streaming_enabled;
        if streaming && self.config.barge_in_enabled {
            warn!("Barge-in with streaming TTS: interrupt lands between chunks");
        }

        let monitor = if self.config.barge_in_enabled && opts.wait_for_response {
            let monitor = BargeInMonitor::new(BargeInConfig {
                vad: VadConfig {
                    aggressiveness: self.config.barge_in_vad_aggressiveness,
                    sample_rate: crate::types::STT_SAMPLE_RATE,
                    frame_ms: 20,
                },
                min_speech_ms: self.config.barge_in_min_speech_ms,
                buffer_window_ms: 1_000,
            });
            if monitor.is_available() {
                Some(monitor)
            } else {
                debug!("Barge-in requested but unavailable; using silence detection");
                None
            }
        } else {
            None
        };

        let speak_text = apply_rules(message, RuleDirection::Tts, &self.rules);
        let tts_status = self
            .speak(&speak_text, opts, monitor.as_ref(), conversation_id)
            .await?;

        if let Ok(mut last) = self.last_spoken.lock() {
            *last = Some(speak_text.clone());
        }

        let tts_status = match tts_status {
            SpeakStatus::Error(message) => return Ok(message),
            SpeakStatus::Spoken(status) => status,
        };

        if let Some(exchanges) = &self.exchanges {
            let mut record =
                ExchangeRecord::new(conversation_id, ExchangeKind::Tts, &speak_text, &tts_status.endpoint);
            record.voice = Some(tts_status.voice.clone());
            record.timing.ttfa = tts_status.ttfa;
            record.timing.total = tts_status.generation_time;
            if let Err(e) = exchanges.append(&record) {
                debug!("Exchange log append failed: {:#}", e);
            }
        }

        if !opts.wait_for_response {
            return Ok(tts_status.summary);
        }

        self.check_cancelled()?;

        // Seed the first listen from barge-in capture, when usable
        let mut captured = if tts_status.interrupted {
            if let Some(audio) = tts_status.captured_audio {
                self.events.log_event(
                    Some(conversation_id),
                    events::BARGE_IN_DETECTED,
                    serde_json::json!({ "captured_samples": audio.len() }),
                );
                Some(audio)
            } else {
                self.events.log_event(
                    Some(conversation_id),
                    events::BARGE_IN_FALSE_POSITIVE,
                    serde_json::Value::Null,
                );
                None
            }
        } else {
            None
        };

        for cycle in 0..MAX_LISTEN_CYCLES {
            self.check_cancelled()?;

            let recording = match captured.take() {
                Some(audio) => audio,
                None => {
                    if opts.chime_enabled {
                        self.play_chime("chime-listening").await;
                    }
                    self.record(opts, conversation_id).await?
                }
            };

            self.check_cancelled()?;

            let outcome = self
                .stt
                .transcribe(
                    &recording,
                    conversation_id,
                    opts.language.as_deref(),
                    Some(&self.cancel),
                )
                .await;

            let transcript = match outcome {
                SttOutcome::Text { text, provider, endpoint } => {
                    let transcript = apply_rules(&text, RuleDirection::Stt, &self.rules);
                    if let Some(exchanges) = &self.exchanges {
                        let mut record = ExchangeRecord::new(
                            conversation_id,
                            ExchangeKind::Stt,
                            &transcript,
                            &endpoint,
                        );
                        record.model = Some(provider);
                        record.duration = Some(recording.duration_secs());
                        if let Err(e) = exchanges.append(&record) {
                            debug!("Exchange log append failed: {:#}", e);
                        }
                    }
                    transcript
                }
                SttOutcome::NoSpeech { provider } => {
                    return Ok(format!("No speech detected (provider: {})", provider));
                }
                SttOutcome::ConnectionFailed { attempted_endpoints } => {
                    let attempts: Vec<String> = attempted_endpoints
                        .iter()
                        .map(|(endpoint, error)| format!("{} ({})", endpoint, error))
                        .collect();
                    return Ok(format!(
                        "All STT providers failed: {}",
                        attempts.join(", ")
                    ));
                }
            };

            if phrases::should_wait(&transcript) && cycle + 1 < MAX_LISTEN_CYCLES {
                info!("Wait command heard; re-opening listening window");
                self.play_chime("standby").await;
                continue;
            }

            if phrases::should_repeat(&transcript) && cycle + 1 < MAX_LISTEN_CYCLES {
                info!("Repeat command heard; replaying last utterance");
                let last = self.last_spoken.lock().ok().and_then(|l| l.clone());
                if let Some(last) = last {
                    let replay = self
                        .speak_plain(&last, opts, conversation_id)
                        .await;
                    if let Err(e) = replay {
                        warn!("Replay failed: {:#}", e);
                    }
                }
                continue;
            }

            if opts.chime_enabled {
                self.play_chime("chime-finish").await;
            }
            return Ok(transcript);
        }

        Ok("No response captured after repeated listen windows".to_string())
    }

    /// Speak with optional streaming and barge-in wiring
    async fn speak(
        &self,
        text: &str,
        opts: &ConverseOptions,
        monitor: Option<&BargeInMonitor>,
        conversation_id: &str,
    ) -> anyhow::Result<SpeakStatus> {
        let player = Arc::new(NonBlockingPlayer::new());
        let mut request = TtsRequest::new(text);
        request.voice = opts
            .voice
            .clone()
            .or_else(|| self.config.voices.first().cloned());
        request.model = opts.model.clone();

        let mode = if self.config.streaming_enabled {
            PlaybackMode::Streaming
        } else {
            PlaybackMode::Blocking
        };

        if monitor.is_some() {
            self.events.log_event(
                Some(conversation_id),
                events::BARGE_IN_START,
                serde_json::Value::Null,
            );
        }

        let result = self
            .tts
            .synthesize(
                &request,
                mode,
                &player,
                monitor,
                conversation_id,
                Some(&self.cancel),
            )
            .await;

        if monitor.is_some() {
            self.events.log_event(
                Some(conversation_id),
                events::BARGE_IN_STOP,
                serde_json::Value::Null,
            );
        }

        match result {
            Ok(outcome) => {
                let interrupted = outcome.metrics.interrupted;
                let usable = outcome.metrics.has_usable_capture();
                Ok(SpeakStatus::Spoken(SpokenStatus {
                    summary: format!(
                        "Spoke {} chars via {} (voice: {})",
                        text.len(),
                        outcome.endpoint,
                        outcome.voice
                    ),
                    endpoint: outcome.endpoint,
                    voice: outcome.voice,
                    ttfa: outcome.metrics.ttfa,
                    generation_time: outcome.metrics.generation_time,
                    interrupted,
                    captured_audio: if usable {
                        outcome.metrics.captured_audio
                    } else {
                        None
                    },
                }))
            }
            Err(VoiceModeError::AllProvidersFailed { attempted }) => {
                let attempts: Vec<String> = attempted
                    .iter()
                    .map(|f| format!("{} ({})", f.endpoint_id, f.message))
                    .collect();
                Ok(SpeakStatus::Error(format!(
                    "All TTS providers failed: {}",
                    attempts.join(", ")
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Plain blocking replay with no monitor (for the repeat command)
    async fn speak_plain(
        &self,
        text: &str,
        opts: &ConverseOptions,
        conversation_id: &str,
    ) -> anyhow::Result<()> {
        let player = Arc::new(NonBlockingPlayer::new());
        let mut request = TtsRequest::new(text);
        request.voice = opts
            .voice
            .clone()
            .or_else(|| self.config.voices.first().cloned());
        self.tts
            .synthesize(
                &request,
                PlaybackMode::Blocking,
                &player,
                None,
                conversation_id,
                Some(&self.cancel),
            )
            .await?;
        Ok(())
    }

    /// One silence-terminated microphone recording
    async fn record(
        &self,
        opts: &ConverseOptions,
        conversation_id: &str,
    ) -> anyhow::Result<PcmBuffer> {
        self.events.log_event(
            Some(conversation_id),
            events::RECORDING_START,
            serde_json::Value::Null,
        );

        let recording_opts = RecordingOptions {
            min_duration: opts.min_listen_duration,
            max_duration: opts.max_listen_duration,
            disable_silence_detection: opts.disable_silence_detection,
            ..RecordingOptions::default()
        };

        let buffer = tokio::task::spawn_blocking(move || -> anyhow::Result<PcmBuffer> {
            let input = io::AudioInput::open(crate::types::STT_SAMPLE_RATE)?;
            let mut source = input.frame_source(20)?;
            Ok(io::record_until_silence(&mut source, &recording_opts))
        })
        .await??;

        self.events.log_event(
            Some(conversation_id),
            events::RECORDING_END,
            serde_json::json!({ "duration_secs": buffer.duration_secs() }),
        );

        Ok(buffer)
    }

    /// Chime playback failures are logged, never fatal
    async fn play_chime(&self, name: &str) {
        let path = self.sound_path(name);
        if !path.exists() {
            debug!("Chime missing: {}", path.display());
            return;
        }
        let result = tokio::task::spawn_blocking(move || io::play_sound_file(&path)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Chime playback failed (ignored): {:#}", e),
            Err(e) => debug!("Chime task failed (ignored): {}", e),
        }
    }

    fn sound_path(&self, name: &str) -> PathBuf {
        self.config.base_dir.join("sounds").join(format!("{}.wav", name))
    }

    fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            anyhow::bail!("cancelled");
        }
        Ok(())
    }
}

enum SpeakStatus {
    Spoken(SpokenStatus),
    /// TTS failed in a way reported to the caller as a string
    Error(String),
}

struct SpokenStatus {
    summary: String,
    endpoint: String,
    voice: String,
    ttfa: Option<f64>,
    generation_time: Option<f64>,
    interrupted: bool,
    captured_audio: Option<PcmBuffer>,
}

/// Rules come from `VOICEMODE_PRONOUNCE*` environment variables, one
/// compact-format block per variable
fn load_pronunciation_rules() -> Vec<PronunciationRule> {
    let mut rules = Vec::new();
    for (key, value) in std::env::vars() {
        if !key.starts_with("VOICEMODE_PRONOUNCE") {
            continue;
        }
        match phrases::parse_compact_rules(&value) {
            Ok(parsed) => rules.extend(parsed),
            Err(e) => warn!("Ignoring bad pronunciation rules in {}: {:#}", key, e),
        }
    }
    rules
}
