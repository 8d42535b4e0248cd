//! Transcribe pipeline
//!
//! Prepares captured audio (normalize to 16 kHz mono, compress per
//! policy, optionally persist a full-quality WAV) and walks the STT
//! endpoints via failover. Providers speak the OpenAI-compatible
//! `/audio/transcriptions` multipart API.

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::codec;
use crate::config::{Config, SttCompress};
use crate::error::{ProviderErrorKind, VoiceModeError};
use crate::events::{self, EventLog};
use crate::providers::failover::{classify_reqwest_error, run_failover, ProviderCallOutcome};
use crate::providers::registry::{ProviderRegistry, ProviderRole};
use crate::types::{AudioBytes, AudioFormat, PcmBuffer};

/// Default STT model requested from providers
const DEFAULT_STT_MODEL: &str = "whisper-1";

/// Outcome of one transcription request
#[derive(Debug, Clone)]
pub enum SttOutcome {
    /// A transcript came back
    Text {
        text: String,
        provider: String,
        endpoint: String,
    },
    /// A provider answered but heard nothing
    NoSpeech { provider: String },
    /// Every endpoint failed
    ConnectionFailed {
        attempted_endpoints: Vec<(String, String)>,
    },
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    language: Option<String>,
}

/// Pick the on-wire format for the current compression policy.
///
/// `auto` skips compression when the preferred endpoint is local.
pub fn decide_wire_format(mode: SttCompress, first_endpoint_local: bool) -> AudioFormat {
    match mode {
        SttCompress::Always => AudioFormat::Mp3,
        SttCompress::Never => AudioFormat::Wav,
        SttCompress::Auto => {
            if first_endpoint_local {
                AudioFormat::Wav
            } else {
                AudioFormat::Mp3
            }
        }
    }
}

/// Path for a saved recording:
/// `audio_dir/<YYYY>/<MM>/<YYYYMMDD>_<HHMMSS>_<ms>_<convid>_<suffix>.wav`
pub fn saved_audio_path(
    audio_dir: &std::path::Path,
    conversation_id: &str,
    suffix: &str,
) -> PathBuf {
    let now = Utc::now();
    audio_dir
        .join(now.format("%Y").to_string())
        .join(now.format("%m").to_string())
        .join(format!(
            "{}_{}_{:03}_{}_{}.wav",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            now.timestamp_subsec_millis(),
            conversation_id,
            suffix,
        ))
}

/// Transcribes audio through the registered STT providers
pub struct TranscribePipeline {
    registry: Arc<ProviderRegistry>,
    client: reqwest::Client,
    events: Arc<EventLog>,
    compress: SttCompress,
    save_audio: bool,
    audio_dir: PathBuf,
    model: String,
}

impl TranscribePipeline {
    pub fn new(config: &Config, registry: Arc<ProviderRegistry>, events: Arc<EventLog>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            client,
            events,
            compress: config.stt_compress,
            save_audio: config.save_audio,
            audio_dir: config.audio_dir(),
            model: DEFAULT_STT_MODEL.to_string(),
        }
    }

    /// Transcribe a recording. The buffer is normalized to 16 kHz mono
    /// before encoding; the on-wire representation may be compressed even
    /// when a full-quality copy is saved.
    pub async fn transcribe(
        &self,
        audio: &PcmBuffer,
        conversation_id: &str,
        language: Option<&str>,
        cancel: Option<&AtomicBool>,
    ) -> SttOutcome {
        let started = Instant::now();
        self.events.log_event(
            Some(conversation_id),
            events::STT_START,
            serde_json::json!({ "samples": audio.len() }),
        );

        let normalized = codec::normalize_for_stt(audio);

        if self.save_audio {
            let path = saved_audio_path(&self.audio_dir, conversation_id, "stt");
            if let Err(e) = crate::audio::io::save_wav(&normalized, &path) {
                warn!("Failed to save STT audio: {}", e);
            } else {
                debug!("Saved STT audio to {}", path.display());
            }
        }

        let wire_format = decide_wire_format(
            self.compress,
            self.registry.first_is_local(ProviderRole::Stt),
        );
        let encoded = match self.encode(&normalized, wire_format) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("STT encoding failed: {}", e);
                self.log_complete(conversation_id, started, Some("encode_failed"));
                return SttOutcome::ConnectionFailed {
                    attempted_endpoints: vec![("local".to_string(), e.to_string())],
                };
            }
        };
        debug!(
            "STT upload: {} bytes as {} ({:.2}s of audio)",
            encoded.len(),
            encoded.format,
            normalized.duration_secs()
        );

        let language = language.map(String::from);
        let result = run_failover(&self.registry, ProviderRole::Stt, cancel, |endpoint| {
            let encoded = encoded.clone();
            let language = language.clone();
            let client = self.client.clone();
            let model = self.model.clone();
            async move {
                let attempt_started = Instant::now();
                let file_name = format!("audio.{}", encoded.format.extension());
                let part = reqwest::multipart::Part::bytes(encoded.data)
                    .file_name(file_name)
                    .mime_str(encoded.format.mime_type())
                    .unwrap_or_else(|_| reqwest::multipart::Part::bytes(Vec::new()));

                let mut form = reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("model", model)
                    .text("response_format", "json");
                if let Some(lang) = language {
                    form = form.text("language", lang);
                }

                let url = format!("{}/audio/transcriptions", endpoint.url.trim_end_matches('/'));
                let response = match client.post(&url).multipart(form).send().await {
                    Ok(response) => response,
                    Err(e) => {
                        return ProviderCallOutcome::Failure {
                            kind: classify_reqwest_error(&e),
                            message: e.to_string(),
                            elapsed: attempt_started.elapsed(),
                        }
                    }
                };

                if !response.status().is_success() {
                    return ProviderCallOutcome::Failure {
                        kind: ProviderErrorKind::HttpStatus,
                        message: format!("HTTP {}", response.status()),
                        elapsed: attempt_started.elapsed(),
                    };
                }

                let parsed: TranscriptionResponse = match response.json().await {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        return ProviderCallOutcome::Failure {
                            kind: ProviderErrorKind::Decode,
                            message: e.to_string(),
                            elapsed: attempt_started.elapsed(),
                        }
                    }
                };

                let text = parsed.text.trim().to_string();
                if text.is_empty() {
                    return ProviderCallOutcome::Failure {
                        kind: ProviderErrorKind::NoSpeech,
                        message: "empty transcription".to_string(),
                        elapsed: attempt_started.elapsed(),
                    };
                }

                ProviderCallOutcome::Success {
                    payload: text,
                    elapsed: attempt_started.elapsed(),
                }
            }
        })
        .await;

        match result {
            Ok(success) => {
                info!(
                    "STT complete via {} in {:?}",
                    success.endpoint.id, success.elapsed
                );
                self.log_complete(conversation_id, started, None);
                SttOutcome::Text {
                    text: success.payload,
                    provider: self.model.clone(),
                    endpoint: success.endpoint.url.clone(),
                }
            }
            Err(VoiceModeError::Provider {
                kind: ProviderErrorKind::NoSpeech,
                ..
            }) => {
                self.log_complete(conversation_id, started, Some("no_speech"));
                SttOutcome::NoSpeech {
                    provider: self.model.clone(),
                }
            }
            Err(VoiceModeError::AllProvidersFailed { attempted }) => {
                self.log_complete(conversation_id, started, Some("connection_failed"));
                SttOutcome::ConnectionFailed {
                    attempted_endpoints: attempted
                        .into_iter()
                        .map(|f| (f.endpoint_id, f.message))
                        .collect(),
                }
            }
            Err(e) => {
                self.log_complete(conversation_id, started, Some("connection_failed"));
                SttOutcome::ConnectionFailed {
                    attempted_endpoints: vec![("-".to_string(), e.to_string())],
                }
            }
        }
    }

    fn encode(&self, buffer: &PcmBuffer, format: AudioFormat) -> Result<AudioBytes> {
        match format {
            AudioFormat::Mp3 => codec::encode_mp3(buffer),
            _ => codec::encode_wav(buffer),
        }
    }

    fn log_complete(&self, conversation_id: &str, started: Instant, error_type: Option<&str>) {
        let mut data = serde_json::json!({
            "elapsed": started.elapsed().as_secs_f64(),
        });
        if let Some(error_type) = error_type {
            data["error_type"] = serde_json::Value::String(error_type.to_string());
        }
        self.events
            .log_event(Some(conversation_id), events::STT_COMPLETE, data);
    }
}
