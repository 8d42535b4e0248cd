//! Synthesize pipeline
//!
//! Requests audio from the TTS endpoints via failover and plays it
//! through the non-blocking player. Three playback paths: blocking,
//! non-blocking (fully buffered response), and streaming (PCM chunks fed
//! into the player's queue as they arrive, with optional barge-in).
//!
//! Providers speak the OpenAI-compatible `/audio/speech` JSON API. Local
//! non-OpenAI endpoints get the requested voice untouched; OpenAI
//! endpoints get non-native voices remapped onto native ones.

use futures_util::TryStreamExt;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::barge_in::BargeInMonitor;
use crate::audio::codec;
use crate::audio::player::NonBlockingPlayer;
use crate::config::Config;
use crate::error::{ProviderErrorKind, VoiceModeError};
use crate::events::{self, EventLog};
use crate::providers::failover::{classify_reqwest_error, run_failover, ProviderCallOutcome};
use crate::providers::registry::{EndpointDescriptor, ProviderRegistry, ProviderRole};
use crate::types::{AudioBytes, AudioFormat, StreamMetrics, TTS_SAMPLE_RATE};

/// Voices the OpenAI API accepts natively
const OPENAI_NATIVE_VOICES: [&str; 9] = [
    "alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer",
];

/// Model used when remapping a request onto the OpenAI API
const OPENAI_NATIVE_MODEL: &str = "tts-1";

/// Fixed remap from local voice names onto OpenAI native voices
fn remap_voice_for_openai(voice: &str) -> &str {
    if OPENAI_NATIVE_VOICES.contains(&voice) {
        return voice;
    }
    match voice {
        "af_sky" | "af_sarah" | "af_nicole" | "af_heart" => "nova",
        "am_adam" | "am_michael" | "bm_george" => "onyx",
        "bf_emma" | "bf_isabella" => "shimmer",
        _ => "alloy",
    }
}

fn is_openai_endpoint(endpoint: &EndpointDescriptor) -> bool {
    endpoint.url.contains("api.openai.com")
}

/// How the synthesized audio should be played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    Blocking,
    NonBlocking,
    Streaming,
}

/// One TTS request
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub response_format: AudioFormat,
    pub speed: f32,
    pub instructions: Option<String>,
}

impl TtsRequest {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            voice: None,
            model: None,
            response_format: AudioFormat::Pcm,
            speed: 1.0,
            instructions: None,
        }
    }

    /// Reject requests no provider call should be made for
    pub fn validate(&self) -> Result<(), VoiceModeError> {
        if self.text.trim().is_empty() {
            return Err(VoiceModeError::Config(
                "TTS text is empty after trimming".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&self.speed) {
            return Err(VoiceModeError::Config(format!(
                "TTS speed {} outside [0.25, 4.0]",
                self.speed
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// Successful synthesis with its playback metrics
#[derive(Debug)]
pub struct TtsOutcome {
    pub endpoint: String,
    pub voice: String,
    pub metrics: StreamMetrics,
}

/// Synthesizes speech through the registered TTS providers
pub struct SynthesizePipeline {
    registry: Arc<ProviderRegistry>,
    client: reqwest::Client,
    events: Arc<EventLog>,
    voices: Vec<String>,
    save_audio: bool,
    audio_dir: std::path::PathBuf,
}

impl SynthesizePipeline {
    pub fn new(config: &Config, registry: Arc<ProviderRegistry>, events: Arc<EventLog>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            client,
            events,
            voices: config.voices.clone(),
            save_audio: config.save_audio,
            audio_dir: config.audio_dir(),
        }
    }

    /// Synthesize and play. Returns the playback metrics; an interrupted
    /// stream is a success with `metrics.interrupted == true`.
    pub async fn synthesize(
        &self,
        request: &TtsRequest,
        mode: PlaybackMode,
        player: &Arc<NonBlockingPlayer>,
        monitor: Option<&BargeInMonitor>,
        conversation_id: &str,
        cancel: Option<&AtomicBool>,
    ) -> Result<TtsOutcome, VoiceModeError> {
        request.validate()?;

        let voice = request
            .voice
            .clone()
            .or_else(|| self.voices.first().cloned())
            .unwrap_or_else(|| "alloy".to_string());

        self.events.log_event(
            Some(conversation_id),
            events::TTS_START,
            serde_json::json!({
                "voice": voice,
                "mode": format!("{:?}", mode),
                "chars": request.text.len(),
            }),
        );

        match mode {
            PlaybackMode::Streaming => {
                self.synthesize_streaming(request, &voice, player, monitor, conversation_id, cancel)
                    .await
            }
            _ => {
                self.synthesize_buffered(request, &voice, mode, player, conversation_id, cancel)
                    .await
            }
        }
    }

    /// Download the whole response, decode, and play
    async fn synthesize_buffered(
        &self,
        request: &TtsRequest,
        voice: &str,
        mode: PlaybackMode,
        player: &Arc<NonBlockingPlayer>,
        conversation_id: &str,
        cancel: Option<&AtomicBool>,
    ) -> Result<TtsOutcome, VoiceModeError> {
        let started = Instant::now();

        let success = run_failover(&self.registry, ProviderRole::Tts, cancel, |endpoint| {
            let request = request.clone();
            let voice = voice.to_string();
            let client = self.client.clone();
            async move {
                let attempt_started = Instant::now();
                let response =
                    match send_speech_request(&client, &endpoint, &request, &voice).await {
                        Ok(response) => response,
                        Err(failure) => return failure,
                    };

                let format = response_audio_format(&response, request.response_format);
                match response.bytes().await {
                    Ok(bytes) => ProviderCallOutcome::Success {
                        payload: (bytes.to_vec(), format),
                        elapsed: attempt_started.elapsed(),
                    },
                    Err(e) => ProviderCallOutcome::Failure {
                        kind: classify_reqwest_error(&e),
                        message: e.to_string(),
                        elapsed: attempt_started.elapsed(),
                    },
                }
            }
        })
        .await?;

        let (data, format) = success.payload;
        let total_bytes = data.len();
        let audio = AudioBytes::new(format, TTS_SAMPLE_RATE, 1, data);
        let samples = codec::decode_to_pcm(&audio).map_err(|e| VoiceModeError::Provider {
            kind: ProviderErrorKind::Decode,
            message: e.to_string(),
        })?;

        self.events.log_event(
            Some(conversation_id),
            events::TTS_FIRST_AUDIO,
            serde_json::json!({ "ttfa": started.elapsed().as_secs_f64() }),
        );

        if self.save_audio {
            let path =
                crate::providers::stt::saved_audio_path(&self.audio_dir, conversation_id, "tts");
            if let Err(e) = crate::audio::io::save_wav(&samples, &path) {
                warn!("Failed to save TTS audio: {}", e);
            }
        }

        let blocking = mode == PlaybackMode::Blocking;
        player
            .play(&samples, blocking, None)
            .map_err(|e| VoiceModeError::Playback(e.to_string()))?;

        let mut metrics = StreamMetrics::default();
        metrics.ttfa = Some(started.elapsed().as_secs_f64());
        metrics.generation_time = Some(success.elapsed.as_secs_f64());
        metrics.total_bytes = total_bytes;
        metrics.chunks_received = 1;
        metrics.chunks_played = 1;
        metrics.interrupted = player.was_interrupted();

        info!(
            "TTS buffered playback via {} ({} bytes, {:?})",
            success.endpoint.id, total_bytes, success.elapsed
        );

        Ok(TtsOutcome {
            endpoint: success.endpoint.url.clone(),
            voice: voice.to_string(),
            metrics,
        })
    }

    /// Open a streamed response and feed chunks into the player. If a
    /// barge-in monitor is attached, it starts (with `player.interrupt`
    /// as its callback) before the first chunk is queued and is always
    /// stopped before returning.
    async fn synthesize_streaming(
        &self,
        request: &TtsRequest,
        voice: &str,
        player: &Arc<NonBlockingPlayer>,
        monitor: Option<&BargeInMonitor>,
        conversation_id: &str,
        cancel: Option<&AtomicBool>,
    ) -> Result<TtsOutcome, VoiceModeError> {
        // Streaming is raw PCM so chunks are playable as they arrive
        let mut request = request.clone();
        request.response_format = AudioFormat::Pcm;

        let success = run_failover(&self.registry, ProviderRole::Tts, cancel, |endpoint| {
            let request = request.clone();
            let voice = voice.to_string();
            let client = self.client.clone();
            async move {
                let attempt_started = Instant::now();
                match send_speech_request(&client, &endpoint, &request, &voice).await {
                    Ok(response) => ProviderCallOutcome::Success {
                        payload: response,
                        elapsed: attempt_started.elapsed(),
                    },
                    Err(failure) => failure,
                }
            }
        })
        .await?;

        if let Some(monitor) = monitor {
            let player = player.clone();
            if let Err(e) = monitor.start_monitoring(move || player.interrupt()) {
                warn!("Barge-in unavailable for this stream: {}", e);
            }
        }

        let byte_stream = success
            .payload
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(anyhow::Error::from);

        let play_result = player
            .play_stream(Box::pin(byte_stream), TTS_SAMPLE_RATE, monitor)
            .await;

        if let Some(monitor) = monitor {
            monitor.stop_monitoring();
        }

        let metrics = play_result.map_err(|e| VoiceModeError::Playback(e.to_string()))?;

        if let Some(ttfa) = metrics.ttfa {
            self.events.log_event(
                Some(conversation_id),
                events::TTS_FIRST_AUDIO,
                serde_json::json!({ "ttfa": ttfa }),
            );
        }
        debug!(
            "TTS stream via {}: {} chunks, {} bytes, interrupted={}",
            success.endpoint.id, metrics.chunks_received, metrics.total_bytes, metrics.interrupted
        );

        Ok(TtsOutcome {
            endpoint: success.endpoint.url.clone(),
            voice: voice.to_string(),
            metrics,
        })
    }
}

/// POST the speech request, remapping voice/model for OpenAI endpoints.
/// Returns the response on HTTP success, a classified failure otherwise.
async fn send_speech_request<T>(
    client: &reqwest::Client,
    endpoint: &EndpointDescriptor,
    request: &TtsRequest,
    voice: &str,
) -> Result<reqwest::Response, ProviderCallOutcome<T>> {
    let attempt_started = Instant::now();

    let (voice, model) = if is_openai_endpoint(endpoint) {
        (remap_voice_for_openai(voice), OPENAI_NATIVE_MODEL)
    } else {
        (voice, request.model.as_deref().unwrap_or("kokoro"))
    };

    let format = request.response_format.extension();
    let body = SpeechBody {
        model,
        input: &request.text,
        voice,
        response_format: format,
        speed: request.speed,
        instructions: request.instructions.as_deref(),
    };

    let url = format!("{}/audio/speech", endpoint.url.trim_end_matches('/'));
    let response = match client.post(&url).json(&body).send().await {
        Ok(response) => response,
        Err(e) => {
            return Err(ProviderCallOutcome::Failure {
                kind: classify_reqwest_error(&e),
                message: e.to_string(),
                elapsed: attempt_started.elapsed(),
            })
        }
    };

    if !response.status().is_success() {
        return Err(ProviderCallOutcome::Failure {
            kind: ProviderErrorKind::HttpStatus,
            message: format!("HTTP {}", response.status()),
            elapsed: attempt_started.elapsed(),
        });
    }

    Ok(response)
}

/// Infer the decoded format from the response content type, falling back
/// to what was requested
fn response_audio_format(response: &reqwest::Response, requested: AudioFormat) -> AudioFormat {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("mpeg") || content_type.contains("mp3") {
        AudioFormat::Mp3
    } else if content_type.contains("wav") {
        AudioFormat::Wav
    } else if content_type.contains("pcm") {
        AudioFormat::Pcm
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_remap_table() {
        assert_eq!(remap_voice_for_openai("af_sky"), "nova");
        assert_eq!(remap_voice_for_openai("af_sarah"), "nova");
        assert_eq!(remap_voice_for_openai("am_adam"), "onyx");
        assert_eq!(remap_voice_for_openai("bf_emma"), "shimmer");
        // Native voices pass through
        assert_eq!(remap_voice_for_openai("nova"), "nova");
        assert_eq!(remap_voice_for_openai("onyx"), "onyx");
        // Unknown voices get a stable default
        assert_eq!(remap_voice_for_openai("xx_unknown"), "alloy");
    }

    #[test]
    fn test_request_validation() {
        assert!(TtsRequest::new("Hello.").validate().is_ok());

        let empty = TtsRequest::new("   \n\t ");
        assert!(matches!(
            empty.validate(),
            Err(VoiceModeError::Config(_))
        ));

        let mut too_fast = TtsRequest::new("Hello.");
        too_fast.speed = 4.5;
        assert!(too_fast.validate().is_err());

        let mut slow = TtsRequest::new("Hello.");
        slow.speed = 0.25;
        assert!(slow.validate().is_ok());
    }

    #[test]
    fn test_speech_body_serialization() {
        let body = SpeechBody {
            model: "kokoro",
            input: "Hello.",
            voice: "af_sky",
            response_format: "pcm",
            speed: 1.0,
            instructions: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "kokoro");
        assert_eq!(json["voice"], "af_sky");
        assert_eq!(json["response_format"], "pcm");
        assert!(json.get("instructions").is_none());
    }

    #[tokio::test]
    async fn test_empty_text_makes_no_provider_call() {
        let config = Config {
            tts_base_urls: vec!["http://127.0.0.1:49153/v1".to_string()],
            ..Config::default()
        };
        let registry = Arc::new(ProviderRegistry::new(
            &config.stt_base_urls,
            &config.tts_base_urls,
        ));
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::new(dir.path().to_path_buf()));
        let pipeline = SynthesizePipeline::new(&config, registry.clone(), events);

        let player = Arc::new(NonBlockingPlayer::new());
        let request = TtsRequest::new("   ");
        let result = pipeline
            .synthesize(
                &request,
                PlaybackMode::NonBlocking,
                &player,
                None,
                "conv-test",
                None,
            )
            .await;

        assert!(matches!(result, Err(VoiceModeError::Config(_))));
        // No health mutation happened on the endpoint
        let endpoint = &registry.endpoints(ProviderRole::Tts)[0];
        assert!(endpoint.last_error().is_none());
        assert!(endpoint.last_seen_healthy_ms().is_none());
    }
}
