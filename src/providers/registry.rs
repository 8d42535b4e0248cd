//! Provider registry - ordered STT/TTS endpoints with health metadata
//!
//! Seeded from configuration at startup. Health updates go through the
//! registry; timestamps are atomics so the hot path reads without a lock.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use url::Url;

/// Which API an endpoint serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    Stt,
    Tts,
}

impl std::fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderRole::Stt => write!(f, "stt"),
            ProviderRole::Tts => write!(f, "tts"),
        }
    }
}

/// Whether an endpoint is on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote,
}

/// One STT or TTS service URL with its health metadata.
///
/// Uniquely identified by (role, url). Created at startup; health fields
/// mutated only by the registry when a call succeeds or fails.
#[derive(Debug)]
pub struct EndpointDescriptor {
    pub id: String,
    pub url: String,
    pub role: ProviderRole,
    pub locality: Locality,
    pub priority: u32,
    /// Epoch millis of the last successful call; 0 = never
    last_healthy_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl EndpointDescriptor {
    fn new(url: &str, role: ProviderRole, priority: u32) -> Self {
        Self {
            id: format!("{}:{}", role, url),
            url: url.to_string(),
            role,
            locality: classify_locality(url),
            priority,
            last_healthy_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn is_local(&self) -> bool {
        self.locality == Locality::Local
    }

    /// Epoch millis of the last successful call, if any
    pub fn last_seen_healthy_ms(&self) -> Option<i64> {
        match self.last_healthy_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

/// Hosts that count as local: 127.0.0.1, localhost, ::1
fn classify_locality(url: &str) -> Locality {
    let local = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host().map(|host| match host {
                url::Host::Domain(domain) => domain == "localhost",
                url::Host::Ipv4(ip) => ip.is_loopback(),
                url::Host::Ipv6(ip) => ip.is_loopback(),
            })
        })
        .unwrap_or(false);
    if local {
        Locality::Local
    } else {
        Locality::Remote
    }
}

/// Ordered STT/TTS endpoint lists behind a shared handle
pub struct ProviderRegistry {
    stt: Vec<Arc<EndpointDescriptor>>,
    tts: Vec<Arc<EndpointDescriptor>>,
}

impl ProviderRegistry {
    /// Build from ordered base-URL lists; list order is priority order
    pub fn new(stt_urls: &[String], tts_urls: &[String]) -> Self {
        let stt = stt_urls
            .iter()
            .enumerate()
            .map(|(i, url)| Arc::new(EndpointDescriptor::new(url, ProviderRole::Stt, i as u32)))
            .collect();
        let tts = tts_urls
            .iter()
            .enumerate()
            .map(|(i, url)| Arc::new(EndpointDescriptor::new(url, ProviderRole::Tts, i as u32)))
            .collect();
        Self { stt, tts }
    }

    /// Endpoints for a role, in priority order
    pub fn endpoints(&self, role: ProviderRole) -> &[Arc<EndpointDescriptor>] {
        match role {
            ProviderRole::Stt => &self.stt,
            ProviderRole::Tts => &self.tts,
        }
    }

    /// Whether the preferred endpoint for a role is local
    pub fn first_is_local(&self, role: ProviderRole) -> bool {
        self.endpoints(role)
            .first()
            .map(|e| e.is_local())
            .unwrap_or(false)
    }

    /// Record a successful call against an endpoint
    pub fn record_success(&self, endpoint: &EndpointDescriptor) {
        endpoint
            .last_healthy_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        if let Ok(mut err) = endpoint.last_error.lock() {
            *err = None;
        }
        debug!("Endpoint healthy: {}", endpoint.id);
    }

    /// Record a failed call against an endpoint
    pub fn record_failure(&self, endpoint: &EndpointDescriptor, message: &str) {
        if let Ok(mut err) = endpoint.last_error.lock() {
            *err = Some(message.to_string());
        }
        debug!("Endpoint failed: {} ({})", endpoint.id, message);
    }
}
