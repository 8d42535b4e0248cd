//! Error taxonomy shared across modules
//!
//! Provider-level errors carry a kind so failover can decide whether to
//! try the next endpoint; `no_speech` and `cancelled` are terminal.

use thiserror::Error;

/// Classification of a single provider call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Could not reach the endpoint
    Connect,
    /// Request timed out
    Timeout,
    /// Endpoint answered with a non-success HTTP status
    HttpStatus,
    /// Response body could not be decoded
    Decode,
    /// Endpoint worked but heard nothing
    NoSpeech,
    /// Caller cancelled the request
    Cancelled,
    /// Anything else
    Other,
}

impl ProviderErrorKind {
    /// Kinds that end failover immediately instead of moving to the next endpoint
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderErrorKind::NoSpeech | ProviderErrorKind::Cancelled)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderErrorKind::Connect => "connect",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::HttpStatus => "http_status",
            ProviderErrorKind::Decode => "decode",
            ProviderErrorKind::NoSpeech => "no_speech",
            ProviderErrorKind::Cancelled => "cancelled",
            ProviderErrorKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Classification of a mailbox failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxErrorKind {
    Io,
    Parse,
    Symlink,
}

impl std::fmt::Display for MailboxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxErrorKind::Io => write!(f, "io"),
            MailboxErrorKind::Parse => write!(f, "parse"),
            MailboxErrorKind::Symlink => write!(f, "symlink"),
        }
    }
}

/// Classification of a Connect failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Auth,
    Transport,
    Protocol,
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectErrorKind::Auth => write!(f, "auth"),
            ConnectErrorKind::Transport => write!(f, "transport"),
            ConnectErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// One failed endpoint attempt, kept for the aggregate report
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderFailure {
    pub endpoint_id: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Top-level error type for the crate
#[derive(Debug, Error)]
pub enum VoiceModeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("all providers failed ({} endpoint(s) attempted)", .attempted.len())]
    AllProvidersFailed { attempted: Vec<ProviderFailure> },

    #[error("playback error: {0}")]
    Playback(String),

    #[error("barge-in unavailable: {0}")]
    BargeInUnavailable(String),

    #[error("mailbox error ({kind}): {message}")]
    Mailbox {
        kind: MailboxErrorKind,
        message: String,
    },

    #[error("connect error ({kind}): {message}")]
    Connect {
        kind: ConnectErrorKind,
        message: String,
    },
}
