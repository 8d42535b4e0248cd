//! Mailbox message delivery
//!
//! Always appends to the persistent JSONL inbox; that write must succeed.
//! When a valid inbox-live symlink is present the message is also
//! mirrored into the external consumer's JSON-array mailbox with an
//! atomic temp-file-and-rename write; that delivery may fail, in which
//! case `delivered` is false. The symlink is never followed when writing
//! the persistent inbox.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Where a message came from
pub const SOURCE_GATEWAY: &str = "gateway";
pub const SOURCE_DASHBOARD: &str = "dashboard";
pub const SOURCE_API: &str = "api";
pub const SOURCE_AGENT: &str = "agent";

/// One persistent inbox message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub from: String,
    pub text: String,
    /// RFC 3339 UTC
    pub timestamp: String,
    pub source: String,
}

/// A delivered message plus its live-delivery status
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message: InboxMessage,
    /// True iff the live-inbox write succeeded
    pub delivered: bool,
}

/// `msg_` + 12 random hex characters
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes);
    format!("msg_{}", hex::encode(bytes))
}

/// Deliver a message to a user's inbox.
///
/// The persistent JSONL append always happens (and its failure is an
/// error); the live-inbox mirror is best-effort.
pub fn deliver_message(
    user_dir: &Path,
    text: &str,
    sender: &str,
    source: &str,
    message_id: Option<String>,
) -> Result<DeliveredMessage> {
    let now = Utc::now();
    let message = InboxMessage {
        id: message_id.unwrap_or_else(generate_message_id),
        from: sender.to_string(),
        text: text.to_string(),
        timestamp: now.to_rfc3339(),
        source: source.to_string(),
    };

    append_jsonl(&user_dir.join("inbox"), &serde_json::to_value(&message)?)
        .context("persistent inbox write failed")?;

    let mut delivered = false;
    let symlink = user_dir.join("inbox-live");
    if symlink.is_symlink() {
        match write_live_inbox(&symlink, &message, now) {
            Ok(wrote) => delivered = wrote,
            Err(e) => {
                warn!("Live inbox delivery failed: {:#}", e);
            }
        }
    }

    if delivered {
        // Record the confirmation alongside the message, best-effort
        let confirmation = json!({
            "type": "delivery_confirmation",
            "message_id": message.id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = append_jsonl(&user_dir.join("inbox"), &confirmation) {
            warn!("Failed to record delivery confirmation: {:#}", e);
        }
    }

    Ok(DeliveredMessage { message, delivered })
}

/// Read messages from the persistent inbox: malformed lines and
/// delivery-confirmation records are skipped; the last `limit` messages
/// come back in chronological order.
pub fn read_inbox(
    user_dir: &Path,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> Vec<InboxMessage> {
    let inbox = user_dir.join("inbox");
    let content = match std::fs::read_to_string(&inbox) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };

    let mut messages = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                warn!("Skipping malformed inbox line: {:.80}", line);
                continue;
            }
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("delivery_confirmation") {
            continue;
        }
        let message: InboxMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(_) => {
                warn!("Skipping malformed inbox line: {:.80}", line);
                continue;
            }
        };
        if let Some(since) = since {
            match DateTime::parse_from_rfc3339(&message.timestamp) {
                Ok(ts) if ts.with_timezone(&Utc) <= since => continue,
                Err(_) => continue,
                _ => {}
            }
        }
        messages.push(message);
    }

    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}

fn append_jsonl(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

/// Mirror the message into the live inbox behind the symlink.
///
/// The target is read as a JSON array (empty when missing or unparsable),
/// appended to, and written back atomically with pretty-printed indent.
fn write_live_inbox(symlink: &Path, message: &InboxMessage, timestamp: DateTime<Utc>) -> Result<bool> {
    let target = std::fs::read_link(symlink).context("unreadable symlink")?;
    let target = if target.is_relative() {
        symlink.parent().unwrap_or(Path::new(".")).join(target)
    } else {
        target
    };

    let parent = match target.parent() {
        Some(parent) if parent.exists() => parent,
        _ => {
            debug!("Live inbox target directory doesn't exist");
            return Ok(false);
        }
    };

    let mut existing: Vec<serde_json::Value> = match std::fs::read_to_string(&target) {
        Ok(content) => serde_json::from_str(content.trim()).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    let summary: String = message.text.chars().take(50).collect();
    existing.push(json!({
        "from": message.from,
        "text": message.text,
        "summary": summary,
        "timestamp": timestamp.to_rfc3339(),
        "read": false,
    }));

    let rendered = format!("{}\n", serde_json::to_string_pretty(&existing)?);
    let tmp = parent.join(format!(
        ".{}.tmp",
        target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "inbox".to_string())
    ));
    std::fs::write(&tmp, rendered).context("temp write failed")?;
    std::fs::rename(&tmp, &target).context("atomic rename failed")?;

    Ok(true)
}
