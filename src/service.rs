//! Local service status surface
//!
//! Human-readable status for the local STT/TTS services (whisper and
//! kokoro). Probes the service port, asks the health endpoint when
//! reachable, and tails the service log. Install/start/stop live with
//! the OS service manager; this module only reports and delegates.

use anyhow::{bail, Result};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

/// Services this surface knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    Whisper,
    Kokoro,
}

impl ServiceName {
    pub fn port(&self) -> u16 {
        match self {
            ServiceName::Whisper => 2022,
            ServiceName::Kokoro => 8880,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Whisper => "whisper",
            ServiceName::Kokoro => "kokoro",
        }
    }
}

impl std::str::FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whisper" => Ok(ServiceName::Whisper),
            "kokoro" => Ok(ServiceName::Kokoro),
            other => Err(format!("unknown service: {}", other)),
        }
    }
}

/// Actions the surface accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Status,
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
    Logs,
}

impl std::str::FromStr for ServiceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "status" => Ok(ServiceAction::Status),
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            "enable" => Ok(ServiceAction::Enable),
            "disable" => Ok(ServiceAction::Disable),
            "logs" => Ok(ServiceAction::Logs),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Whether something accepts connections on the service port
pub fn is_port_accessible(port: u16, timeout: Duration) -> bool {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// Last `lines` lines of a log file
pub fn tail_log(path: &PathBuf, lines: usize) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

/// Run one service action and return a human-readable report
pub async fn service(config: &Config, name: ServiceName, action: ServiceAction, lines: Option<usize>) -> Result<String> {
    match action {
        ServiceAction::Status => Ok(status_report(config, name).await),
        ServiceAction::Logs => {
            let path = config.logs_dir().join(format!("{}.log", name.as_str()));
            match tail_log(&path, lines.unwrap_or(50)) {
                Ok(tail) if !tail.is_empty() => Ok(tail),
                _ => Ok(format!("No logs found at {}", path.display())),
            }
        }
        ServiceAction::Start
        | ServiceAction::Stop
        | ServiceAction::Restart
        | ServiceAction::Enable
        | ServiceAction::Disable => {
            bail!(
                "{:?} for {} is managed by the OS service manager",
                action,
                name.as_str()
            )
        }
    }
}

async fn status_report(config: &Config, name: ServiceName) -> String {
    let port = name.port();
    let reachable = is_port_accessible(port, Duration::from_secs(1));

    let mut lines = vec![format!(
        "{}: {} (port {})",
        name.as_str(),
        if reachable { "running" } else { "not running" },
        port
    )];

    if reachable {
        match health_check(config, port).await {
            Ok(body) => lines.push(format!("  Health: {}", body)),
            Err(e) => {
                debug!("Health check failed: {:#}", e);
                lines.push("  Health: port open, no health endpoint".to_string());
            }
        }
    }

    lines.join("\n")
}

async fn health_check(config: &Config, port: u16) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout.min(Duration::from_secs(2)))
        .build()?;
    let response = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("HTTP {}", response.status());
    }
    let body = response.text().await?;
    Ok(body.chars().take(120).collect())
}
