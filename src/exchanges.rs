//! Exchange log - append-only JSONL records of STT/TTS exchanges
//!
//! Creates dated files (exchanges_YYYY-MM-DD.jsonl) under the logs
//! directory. One line per exchange; malformed lines are skipped on read.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Direction of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Stt,
    Tts,
}

/// Timing breakdown for one exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeTiming {
    /// Time to first audio, seconds (TTS only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfa: Option<f64>,
    /// Total provider time, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// One STT or TTS exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub conversation_id: String,
    pub timestamp: String,
    pub kind: ExchangeKind,
    pub text: String,
    /// Audio duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub timing: ExchangeTiming,
    /// Path to the saved audio file, when save-audio was enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

impl ExchangeRecord {
    pub fn new(conversation_id: &str, kind: ExchangeKind, text: &str, provider: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            text: text.to_string(),
            duration: None,
            provider: provider.to_string(),
            voice: None,
            model: None,
            timing: ExchangeTiming::default(),
            audio_path: None,
        }
    }
}

/// Manages per-day exchange log files
pub struct ExchangeLog {
    logs_dir: PathBuf,
}

impl ExchangeLog {
    pub fn new(logs_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&logs_dir).context("Failed to create logs directory")?;
        Ok(Self { logs_dir })
    }

    fn log_path(&self, date: NaiveDate) -> PathBuf {
        self.logs_dir
            .join(format!("exchanges_{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one record to today's log
    pub fn append(&self, record: &ExchangeRecord) -> Result<()> {
        let path = self.log_path(Utc::now().date_naive());
        let line = serde_json::to_string(record).context("Failed to serialize exchange")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{}", line)?;
        debug!("Logged {:?} exchange to {}", record.kind, path.display());
        Ok(())
    }

    /// Load all records for a date, skipping malformed lines
    pub fn load_date(&self, date: NaiveDate) -> Vec<ExchangeRecord> {
        let path = self.log_path(date);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(_) => {
                    warn!("Skipping malformed exchange line: {:.80}", line);
                    None
                }
            })
            .collect()
    }

    /// Load today's records
    pub fn load_today(&self) -> Vec<ExchangeRecord> {
        self.load_date(Utc::now().date_naive())
    }
}
