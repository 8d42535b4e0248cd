//! Configuration management
//!
//! All runtime configuration comes from `VOICEMODE_*` environment
//! variables; there is no config file. `Config::from_env()` is read once
//! at startup and passed by handle.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTP timeout for provider requests
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default conch lock expiry
const DEFAULT_CONCH_LOCK_EXPIRY_SECS: u64 = 120;

/// Compression policy for audio sent to STT providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttCompress {
    /// WAV for a local-first endpoint list, MP3 otherwise
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for SttCompress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SttCompress::Auto),
            "always" => Ok(SttCompress::Always),
            "never" => Ok(SttCompress::Never),
            other => Err(format!("invalid STT compress mode: {}", other)),
        }
    }
}

/// Telemetry consent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Telemetry {
    #[default]
    Ask,
    On,
    Off,
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for logs, audio, credentials, connect state
    pub base_dir: PathBuf,
    /// Ordered TTS base URLs, first is preferred
    pub tts_base_urls: Vec<String>,
    /// Ordered STT base URLs, first is preferred
    pub stt_base_urls: Vec<String>,
    /// Ordered voice preferences
    pub voices: Vec<String>,
    /// Persist full-quality WAV copies of STT/TTS audio
    pub save_audio: bool,
    /// Compression policy for STT uploads
    pub stt_compress: SttCompress,
    /// Stream TTS audio instead of buffering the whole response
    pub streaming_enabled: bool,
    /// Barge-in (interrupt TTS when the user starts speaking)
    pub barge_in_enabled: bool,
    /// webrtc-vad aggressiveness, 0..=3
    pub barge_in_vad_aggressiveness: u8,
    /// Accumulated speech required before the barge-in callback fires
    pub barge_in_min_speech_ms: u64,
    /// Connect gateway
    pub connect_enabled: bool,
    pub connect_host: String,
    pub connect_ws_url: String,
    /// Conch lock
    pub conch_enabled: bool,
    pub conch_lock_expiry: Duration,
    /// Telemetry consent
    pub telemetry: Telemetry,
    /// Per-request HTTP timeout
    pub http_timeout: Duration,
}

fn default_tts_urls() -> Vec<String> {
    vec![
        "http://127.0.0.1:8880/v1".to_string(),
        "https://api.openai.com/v1".to_string(),
    ]
}

fn default_stt_urls() -> Vec<String> {
    vec![
        "http://127.0.0.1:2022/v1".to_string(),
        "https://api.openai.com/v1".to_string(),
    ]
}

fn default_voices() -> Vec<String> {
    vec!["af_sky".to_string(), "alloy".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            tts_base_urls: default_tts_urls(),
            stt_base_urls: default_stt_urls(),
            voices: default_voices(),
            save_audio: false,
            stt_compress: SttCompress::Auto,
            streaming_enabled: true,
            barge_in_enabled: false,
            barge_in_vad_aggressiveness: 2,
            barge_in_min_speech_ms: 150,
            connect_enabled: false,
            connect_host: "voicemode.dev".to_string(),
            connect_ws_url: "wss://voicemode.dev/ws".to_string(),
            conch_enabled: true,
            conch_lock_expiry: Duration::from_secs(DEFAULT_CONCH_LOCK_EXPIRY_SECS),
            telemetry: Telemetry::Ask,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VOICEMODE_BASE_DIR") {
            if !dir.trim().is_empty() {
                config.base_dir = PathBuf::from(dir);
            }
        }

        if let Some(urls) = env_list("VOICEMODE_TTS_BASE_URLS") {
            config.tts_base_urls = urls;
        }
        if let Some(urls) = env_list("VOICEMODE_STT_BASE_URLS") {
            config.stt_base_urls = urls;
        }
        if let Some(voices) = env_list("VOICEMODE_VOICES") {
            config.voices = voices;
        }

        if let Some(v) = env_bool("VOICEMODE_SAVE_AUDIO") {
            config.save_audio = v;
        }
        if let Ok(mode) = std::env::var("VOICEMODE_STT_COMPRESS") {
            config.stt_compress = mode.parse().unwrap_or_default();
        }
        if let Some(v) = env_bool("VOICEMODE_STREAMING") {
            config.streaming_enabled = v;
        }

        if let Some(v) = env_bool("VOICEMODE_BARGE_IN") {
            config.barge_in_enabled = v;
        }
        if let Ok(v) = std::env::var("VOICEMODE_BARGE_IN_VAD_AGGRESSIVENESS") {
            if let Ok(n) = v.parse::<u8>() {
                config.barge_in_vad_aggressiveness = n.min(3);
            }
        }
        if let Ok(v) = std::env::var("VOICEMODE_BARGE_IN_MIN_SPEECH_MS") {
            if let Ok(n) = v.parse::<u64>() {
                config.barge_in_min_speech_ms = n;
            }
        }

        if let Some(v) = env_bool("VOICEMODE_CONNECT_ENABLED") {
            config.connect_enabled = v;
        }
        if let Ok(host) = std::env::var("VOICEMODE_CONNECT_HOST") {
            if !host.trim().is_empty() {
                config.connect_host = host;
            }
        }
        if let Ok(url) = std::env::var("VOICEMODE_CONNECT_WS_URL") {
            if !url.trim().is_empty() {
                config.connect_ws_url = url;
            }
        }

        if let Some(v) = env_bool("VOICEMODE_CONCH_ENABLED") {
            config.conch_enabled = v;
        }
        if let Ok(v) = std::env::var("VOICEMODE_CONCH_LOCK_EXPIRY") {
            if let Ok(secs) = v.parse::<u64>() {
                config.conch_lock_expiry = Duration::from_secs(secs);
            }
        }

        // DO_NOT_TRACK (any value) forces telemetry off
        if std::env::var("DO_NOT_TRACK").is_ok() {
            config.telemetry = Telemetry::Off;
        } else if let Ok(v) = std::env::var("VOICEMODE_TELEMETRY") {
            config.telemetry = match v.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Telemetry::On,
                "false" | "0" | "no" | "off" => Telemetry::Off,
                _ => Telemetry::Ask,
            };
        }

        if let Ok(v) = std::env::var("VOICEMODE_HTTP_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                config.http_timeout = Duration::from_secs(secs);
            }
        }

        config
    }

    /// Directory for exchange and event logs
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Directory for saved audio files
    pub fn audio_dir(&self) -> PathBuf {
        self.base_dir.join("audio")
    }

    /// Directory holding Connect user mailboxes
    pub fn users_dir(&self) -> PathBuf {
        self.base_dir.join("connect").join("users")
    }

    /// Path of the credentials file
    pub fn credentials_path(&self) -> PathBuf {
        self.base_dir.join("credentials")
    }

    /// Path of the conch lock file
    pub fn conch_path(&self) -> PathBuf {
        self.base_dir.join("conch")
    }

    /// Ensure the base directory tree exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.logs_dir()).context("Failed to create logs directory")?;
        std::fs::create_dir_all(self.audio_dir()).context("Failed to create audio directory")?;
        std::fs::create_dir_all(self.users_dir()).context("Failed to create users directory")?;
        Ok(())
    }
}

/// Base directory defaults to `~/.voicemode`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".voicemode"))
        .unwrap_or_else(|| PathBuf::from(".voicemode"))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stt_compress, SttCompress::Auto);
        assert!(!config.barge_in_enabled);
        assert_eq!(config.barge_in_vad_aggressiveness, 2);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_host, "voicemode.dev");
    }

    #[test]
    fn test_stt_compress_parse() {
        assert_eq!("auto".parse::<SttCompress>().unwrap(), SttCompress::Auto);
        assert_eq!("ALWAYS".parse::<SttCompress>().unwrap(), SttCompress::Always);
        assert_eq!("never".parse::<SttCompress>().unwrap(), SttCompress::Never);
        assert!("sometimes".parse::<SttCompress>().is_err());
    }

    #[test]
    fn test_env_list_parsing() {
        std::env::set_var(
            "VOICEMODE_TEST_LIST",
            " http://127.0.0.1:8880/v1 , https://api.example/v1 ,",
        );
        let items = env_list("VOICEMODE_TEST_LIST").unwrap();
        assert_eq!(
            items,
            vec![
                "http://127.0.0.1:8880/v1".to_string(),
                "https://api.example/v1".to_string()
            ]
        );
        std::env::remove_var("VOICEMODE_TEST_LIST");
    }

    #[test]
    fn test_env_bool_parsing() {
        std::env::set_var("VOICEMODE_TEST_BOOL", "TRUE");
        assert_eq!(env_bool("VOICEMODE_TEST_BOOL"), Some(true));
        std::env::set_var("VOICEMODE_TEST_BOOL", "0");
        assert_eq!(env_bool("VOICEMODE_TEST_BOOL"), Some(false));
        std::env::set_var("VOICEMODE_TEST_BOOL", "maybe");
        assert_eq!(env_bool("VOICEMODE_TEST_BOOL"), None);
        std::env::remove_var("VOICEMODE_TEST_BOOL");
    }

    #[test]
    fn test_dir_layout() {
        let mut config = Config::default();
        config.base_dir = PathBuf::from("/tmp/vm-test");
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/vm-test/logs"));
        assert_eq!(
            config.users_dir(),
            PathBuf::from("/tmp/vm-test/connect/users")
        );
        assert_eq!(config.conch_path(), PathBuf::from("/tmp/vm-test/conch"));
    }
}
