//! Structured event log
//!
//! Single append-only writer shared by every component. Writes happen on
//! a background thread so the audio path never blocks on disk; the buffer
//! is bounded and drops the oldest non-critical entries on overflow.
//!
//! Files are per-day JSONL: `logs/events_<YYYY-MM-DD>.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

pub const TTS_START: &str = "TTS_START";
pub const TTS_FIRST_AUDIO: &str = "TTS_FIRST_AUDIO";
pub const RECORDING_START: &str = "RECORDING_START";
pub const RECORDING_END: &str = "RECORDING_END";
pub const STT_START: &str = "STT_START";
pub const STT_COMPLETE: &str = "STT_COMPLETE";
pub const TOOL_REQUEST_START: &str = "TOOL_REQUEST_START";
pub const TOOL_REQUEST_END: &str = "TOOL_REQUEST_END";
pub const BARGE_IN_START: &str = "BARGE_IN_START";
pub const BARGE_IN_DETECTED: &str = "BARGE_IN_DETECTED";
pub const BARGE_IN_STOP: &str = "BARGE_IN_STOP";
pub const BARGE_IN_FALSE_POSITIVE: &str = "BARGE_IN_FALSE_POSITIVE";
pub const BARGE_IN_STT_ERROR: &str = "BARGE_IN_STT_ERROR";

/// Events that survive buffer overflow
fn is_critical(event_type: &str) -> bool {
    matches!(event_type, TOOL_REQUEST_START | TOOL_REQUEST_END)
}

/// Default bound on the in-memory event buffer
const DEFAULT_CAPACITY: usize = 1024;

/// One logged event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

struct EventLogInner {
    queue: Mutex<VecDeque<EventRecord>>,
    cond: Condvar,
    shutdown: AtomicBool,
    logs_dir: PathBuf,
    capacity: usize,
}

/// Handle to the shared event log
pub struct EventLog {
    inner: Arc<EventLogInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EventLog {
    /// Create an event log writing under `logs_dir` and start its writer
    pub fn new(logs_dir: PathBuf) -> Self {
        Self::with_capacity(logs_dir, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(logs_dir: PathBuf, capacity: usize) -> Self {
        let inner = Arc::new(EventLogInner {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            logs_dir,
            capacity,
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("event-log".to_string())
            .spawn(move || writer_loop(worker_inner))
            .ok();

        Self {
            inner,
            worker: Mutex::new(worker),
        }
    }

    /// Queue an event. Never blocks on disk.
    pub fn log_event(
        &self,
        conversation_id: Option<&str>,
        event_type: &str,
        data: serde_json::Value,
    ) {
        let record = EventRecord {
            timestamp: Utc::now().to_rfc3339(),
            conversation_id: conversation_id.map(String::from),
            event_type: event_type.to_string(),
            data,
        };

        let mut queue = match self.inner.queue.lock() {
            Ok(q) => q,
            Err(_) => return,
        };

        if queue.len() >= self.inner.capacity {
            // Drop the oldest non-critical entry to make room
            if let Some(pos) = queue.iter().position(|e| !is_critical(&e.event_type)) {
                let dropped = queue.remove(pos);
                debug!(
                    "Event buffer full, dropped {}",
                    dropped.map(|e| e.event_type).unwrap_or_default()
                );
            }
        }

        queue.push_back(record);
        drop(queue);
        self.inner.cond.notify_one();
    }

    /// Block until all queued events have been written
    pub fn flush(&self) {
        loop {
            {
                let queue = match self.inner.queue.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                if queue.is_empty() {
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    /// Path of today's event file
    pub fn current_path(&self) -> PathBuf {
        day_path(&self.inner.logs_dir)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn day_path(logs_dir: &std::path::Path) -> PathBuf {
    logs_dir.join(format!("events_{}.jsonl", Utc::now().format("%Y-%m-%d")))
}

fn writer_loop(inner: Arc<EventLogInner>) {
    loop {
        let batch: Vec<EventRecord> = {
            let mut queue = match inner.queue.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            while queue.is_empty() && !inner.shutdown.load(Ordering::SeqCst) {
                queue = match inner.cond.wait(queue) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
            let drained: Vec<EventRecord> = queue.drain(..).collect();
            if inner.shutdown.load(Ordering::SeqCst) && queue.is_empty() {
                drop(queue);
                write_batch(&inner.logs_dir, &drained);
                return;
            }
            drained
        };

        write_batch(&inner.logs_dir, &batch);
    }
}

fn write_batch(logs_dir: &std::path::Path, batch: &[EventRecord]) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        warn!("Event log: failed to create logs directory: {}", e);
        return;
    }
    let path = day_path(logs_dir);
    let file = std::fs::OpenOptions::new().create(true).append(true).open(&path);
    let mut file = match file {
        Ok(f) => f,
        Err(e) => {
            warn!("Event log: failed to open {}: {}", path.display(), e);
            return;
        }
    };
    for record in batch {
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!("Event log: write failed: {}", e);
                    return;
                }
            }
            Err(e) => warn!("Event log: serialize failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_written_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf());

        log.log_event(Some("conv-1"), TTS_START, serde_json::json!({"voice": "af_sky"}));
        log.log_event(Some("conv-1"), TTS_FIRST_AUDIO, serde_json::Value::Null);
        log.flush();

        let content = std::fs::read_to_string(log.current_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: EventRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, TTS_START);
        assert_eq!(first.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(first.data["voice"], "af_sky");
    }

    #[test]
    fn test_order_preserved_within_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf());

        for event in [
            TOOL_REQUEST_START,
            TTS_START,
            RECORDING_START,
            RECORDING_END,
            STT_START,
            STT_COMPLETE,
            TOOL_REQUEST_END,
        ] {
            log.log_event(Some("conv-2"), event, serde_json::Value::Null);
        }
        log.flush();

        let content = std::fs::read_to_string(log.current_path()).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<EventRecord>(l).unwrap().event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                TOOL_REQUEST_START,
                TTS_START,
                RECORDING_START,
                RECORDING_END,
                STT_START,
                STT_COMPLETE,
                TOOL_REQUEST_END,
            ]
        );
    }

    #[test]
    fn test_overflow_drops_oldest_non_critical() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(EventLogInner {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            logs_dir: dir.path().to_path_buf(),
            capacity: 3,
        });
        // No worker thread: inspect the queue directly
        let log = EventLog {
            inner: inner.clone(),
            worker: Mutex::new(None),
        };

        log.log_event(None, TOOL_REQUEST_START, serde_json::Value::Null);
        log.log_event(None, TTS_START, serde_json::Value::Null);
        log.log_event(None, RECORDING_START, serde_json::Value::Null);
        log.log_event(None, RECORDING_END, serde_json::Value::Null);

        let queue = inner.queue.lock().unwrap();
        let types: Vec<&str> = queue.iter().map(|e| e.event_type.as_str()).collect();
        // TTS_START (oldest non-critical) was evicted; the critical
        // TOOL_REQUEST_START stays at the front.
        assert_eq!(types, vec![TOOL_REQUEST_START, RECORDING_START, RECORDING_END]);
    }
}
