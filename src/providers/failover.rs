//! Ordered failover across provider endpoints
//!
//! Walks endpoints in priority order until one succeeds. `no_speech` and
//! `cancelled` outcomes end the walk immediately: a working endpoint that
//! heard nothing is not a failover condition. Local endpoints get no
//! retries; remote endpoints get up to two with exponential backoff.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{ProviderErrorKind, ProviderFailure, VoiceModeError};
use crate::providers::registry::{EndpointDescriptor, Locality, ProviderRegistry, ProviderRole};

/// Result of one attempt against one endpoint
#[derive(Debug)]
pub enum ProviderCallOutcome<T> {
    Success { payload: T, elapsed: Duration },
    Failure { kind: ProviderErrorKind, message: String, elapsed: Duration },
}

/// Terminal success of a failover walk
#[derive(Debug)]
pub struct FailoverSuccess<T> {
    pub payload: T,
    pub endpoint: Arc<EndpointDescriptor>,
    pub elapsed: Duration,
}

/// Retries an endpoint gets before its failure is reported
pub fn retry_budget(locality: Locality) -> u32 {
    match locality {
        Locality::Local => 0,
        Locality::Remote => 2,
    }
}

/// Kinds worth retrying on the same endpoint
fn is_retryable(kind: ProviderErrorKind) -> bool {
    matches!(
        kind,
        ProviderErrorKind::Connect | ProviderErrorKind::Timeout | ProviderErrorKind::HttpStatus
    )
}

/// Run one endpoint attempt with its locality-based retry budget
pub async fn attempt_with_retries<T, F, Fut>(
    endpoint: &Arc<EndpointDescriptor>,
    attempt: F,
) -> ProviderCallOutcome<T>
where
    F: Fn(Arc<EndpointDescriptor>) -> Fut,
    Fut: Future<Output = ProviderCallOutcome<T>>,
{
    let budget = retry_budget(endpoint.locality);
    let mut tries = 0u32;

    loop {
        let outcome = attempt(endpoint.clone()).await;
        match outcome {
            ProviderCallOutcome::Failure { kind, message, elapsed }
                if is_retryable(kind) && tries < budget =>
            {
                tries += 1;
                let backoff = Duration::from_millis(500 * 2u64.saturating_pow(tries - 1));
                warn!(
                    "Retrying {} after {} ({}), attempt {}/{}",
                    endpoint.id, kind, message, tries, budget
                );
                let _ = elapsed;
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

/// Walk endpoints for a role in priority order until one succeeds.
///
/// `cancel` is checked between endpoint attempts. Returns the first
/// success, or `AllProvidersFailed` listing one failure per endpoint.
pub async fn run_failover<T, F, Fut>(
    registry: &ProviderRegistry,
    role: ProviderRole,
    cancel: Option<&AtomicBool>,
    attempt: F,
) -> Result<FailoverSuccess<T>, VoiceModeError>
where
    F: Fn(Arc<EndpointDescriptor>) -> Fut,
    Fut: Future<Output = ProviderCallOutcome<T>>,
{
    let endpoints = registry.endpoints(role);
    if endpoints.is_empty() {
        return Err(VoiceModeError::Config(format!(
            "no {} endpoints configured",
            role
        )));
    }

    let started = Instant::now();
    let mut attempted: Vec<ProviderFailure> = Vec::new();

    for endpoint in endpoints {
        if cancel.map(|c| c.load(Ordering::SeqCst)).unwrap_or(false) {
            return Err(VoiceModeError::Provider {
                kind: ProviderErrorKind::Cancelled,
                message: "cancelled between endpoint attempts".to_string(),
            });
        }

        match attempt_with_retries(endpoint, &attempt).await {
            ProviderCallOutcome::Success { payload, elapsed } => {
                registry.record_success(endpoint);
                if !attempted.is_empty() {
                    info!(
                        "Failover succeeded on {} after {} failure(s)",
                        endpoint.id,
                        attempted.len()
                    );
                }
                return Ok(FailoverSuccess {
                    payload,
                    endpoint: endpoint.clone(),
                    elapsed,
                });
            }
            ProviderCallOutcome::Failure { kind, message, elapsed } => {
                if kind.is_terminal() {
                    // A real answer, not an outage; stop the walk here
                    return Err(VoiceModeError::Provider { kind, message });
                }
                registry.record_failure(endpoint, &message);
                attempted.push(ProviderFailure {
                    endpoint_id: endpoint.id.clone(),
                    kind,
                    message,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
    }

    warn!(
        "All {} {} endpoints failed in {:?}",
        attempted.len(),
        role,
        started.elapsed()
    );
    Err(VoiceModeError::AllProvidersFailed { attempted })
}

/// Classify a reqwest error for failover decisions
pub fn classify_reqwest_error(err: &reqwest::Error) -> ProviderErrorKind {
    if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_connect() {
        ProviderErrorKind::Connect
    } else if err.is_status() {
        ProviderErrorKind::HttpStatus
    } else if err.is_decode() || err.is_body() {
        ProviderErrorKind::Decode
    } else {
        ProviderErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry(urls: &[&str]) -> ProviderRegistry {
        let urls: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
        ProviderRegistry::new(&urls, &urls)
    }

    fn failure<T>(kind: ProviderErrorKind, message: &str) -> ProviderCallOutcome<T> {
        ProviderCallOutcome::Failure {
            kind,
            message: message.to_string(),
            elapsed: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let registry = registry(&["http://127.0.0.1:2022/v1", "https://api.example/v1"]);

        let result = run_failover(&registry, ProviderRole::Stt, None, |endpoint| async move {
            ProviderCallOutcome::Success {
                payload: endpoint.url.clone(),
                elapsed: Duration::from_millis(10),
            }
        })
        .await
        .unwrap();

        assert_eq!(result.payload, "http://127.0.0.1:2022/v1");
        assert!(result.endpoint.last_seen_healthy_ms().is_some());
    }

    #[tokio::test]
    async fn test_falls_through_to_second_endpoint() {
        let registry = registry(&["http://127.0.0.1:2022/v1", "http://127.0.0.1:2023/v1"]);

        let result = run_failover(&registry, ProviderRole::Tts, None, |endpoint| async move {
            if endpoint.priority == 0 {
                failure(ProviderErrorKind::Connect, "connection refused")
            } else {
                ProviderCallOutcome::Success {
                    payload: "ok",
                    elapsed: Duration::from_millis(10),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.endpoint.priority, 1);
        let first = &registry.endpoints(ProviderRole::Tts)[0];
        assert_eq!(first.last_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_all_failed_reports_one_failure_per_endpoint() {
        let registry = registry(&["http://127.0.0.1:2022/v1", "http://127.0.0.1:2023/v1"]);

        let err = run_failover::<(), _, _>(&registry, ProviderRole::Stt, None, |_| async {
            failure(ProviderErrorKind::Connect, "connection refused")
        })
        .await
        .unwrap_err();

        match err {
            VoiceModeError::AllProvidersFailed { attempted } => {
                assert_eq!(attempted.len(), 2);
                assert!(attempted[0].endpoint_id.starts_with("stt:"));
            }
            other => panic!("expected AllProvidersFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_speech_is_terminal() {
        let registry = registry(&["http://127.0.0.1:2022/v1", "http://127.0.0.1:2023/v1"]);
        let calls = AtomicUsize::new(0);

        let err = run_failover::<(), _, _>(&registry, ProviderRole::Stt, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { failure(ProviderErrorKind::NoSpeech, "empty transcription") }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            VoiceModeError::Provider { kind, .. } => assert_eq!(kind, ProviderErrorKind::NoSpeech),
            other => panic!("expected Provider error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_endpoint_gets_retries() {
        // Remote endpoint: two 503s then success, within a single failover walk
        let registry = registry(&["https://bad.example/v1"]);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let result = run_failover(&registry, ProviderRole::Tts, None, move |_| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    failure(ProviderErrorKind::HttpStatus, "503 Service Unavailable")
                } else {
                    ProviderCallOutcome::Success {
                        payload: "mp3-bytes",
                        elapsed: Duration::from_millis(10),
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.payload, "mp3-bytes");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_local_endpoint_gets_no_retries() {
        let registry = registry(&["http://127.0.0.1:8880/v1"]);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let err = run_failover::<(), _, _>(&registry, ProviderRole::Tts, None, move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                failure(ProviderErrorKind::Connect, "connection refused")
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, VoiceModeError::AllProvidersFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let registry = registry(&["http://127.0.0.1:2022/v1"]);
        let cancel = AtomicBool::new(true);

        let err = run_failover::<(), _, _>(&registry, ProviderRole::Stt, Some(&cancel), |_| async {
            panic!("attempt should not run after cancellation")
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            VoiceModeError::Provider {
                kind: ProviderErrorKind::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_endpoint_list_is_config_error() {
        let registry = ProviderRegistry::new(&[], &[]);
        let err = run_failover::<(), _, _>(&registry, ProviderRole::Stt, None, |_| async {
            unreachable!()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VoiceModeError::Config(_)));
    }

    #[test]
    fn test_retry_budget() {
        assert_eq!(retry_budget(Locality::Local), 0);
        assert_eq!(retry_budget(Locality::Remote), 2);
    }
}
