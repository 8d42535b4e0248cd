//! Connect wire protocol
//!
//! JSON frames over the gateway WebSocket, modeled as tagged enums.
//! Unknown inbound frame types decode to `Unknown` so new server frames
//! never break the receive loop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Derived presence of a registered user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// Reachable and will respond
    Available,
    /// Connected but not accepting messages
    Online,
    /// Not connected
    Offline,
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Presence::Available => write!(f, "available"),
            Presence::Online => write!(f, "online"),
            Presence::Offline => write!(f, "offline"),
        }
    }
}

/// A remote device connected to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub session_id: String,
    pub device_id: Option<String>,
    pub platform: Option<String>,
    pub name: Option<String>,
    pub capabilities: HashMap<String, bool>,
    pub ready: bool,
    /// JS epoch millis
    pub connected_at: i64,
    pub last_activity: i64,
}

impl DeviceInfo {
    /// Human-readable device name
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(platform) = &self.platform {
            let mut chars = platform.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => platform.clone(),
            };
        }
        format!("Device {:.8}", self.session_id)
    }

    /// Short capability summary like "TTS+STT"
    pub fn capabilities_str(&self) -> String {
        let mut caps = Vec::new();
        for (key, label) in [
            ("tts", "TTS"),
            ("stt", "STT"),
            ("mic", "Mic"),
            ("speaker", "Speaker"),
        ] {
            if self.capabilities.get(key).copied().unwrap_or(false) {
                caps.push(label);
            }
        }
        if caps.is_empty() {
            "none".to_string()
        } else {
            caps.join("+")
        }
    }

    /// How long ago the device was last active, relative to `now_ms`
    pub fn activity_ago(&self, now_ms: i64) -> String {
        if self.last_activity == 0 {
            return "unknown".to_string();
        }
        let seconds = (now_ms - self.last_activity) / 1000;
        if seconds < 60 {
            return "just now".to_string();
        }
        let minutes = seconds / 60;
        if minutes < 60 {
            return format!("{}m ago", minutes);
        }
        let hours = minutes / 60;
        if hours < 24 {
            return format!("{}h ago", hours);
        }
        format!("{}d ago", hours / 24)
    }
}

/// One user entry in a `capabilities_update`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub host: String,
    pub display_name: String,
    pub presence: Presence,
}

/// Identity advertised in the `ready` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub platform: String,
    pub app_version: String,
    pub device_id: String,
    pub name: String,
}

/// Capabilities advertised in the `ready` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub tts: bool,
    pub stt: bool,
}

/// Frames this client sends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ready {
        device: DeviceIdentity,
        capabilities: Capabilities,
    },
    CapabilitiesUpdate {
        users: Vec<UserEntry>,
        platform: String,
    },
    Heartbeat {
        /// Epoch millis
        timestamp: i64,
    },
    DeliveryConfirmation {
        message_id: String,
        target_user: String,
        delivered: bool,
    },
}

/// Frames the gateway sends
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Connected {
        #[serde(rename = "sessionId", default)]
        session_id: String,
    },
    Devices {
        #[serde(default)]
        devices: Vec<DeviceInfo>,
    },
    UserMessageDelivery {
        #[serde(default)]
        text: String,
        #[serde(default)]
        from: String,
        #[serde(default)]
        target_user: String,
    },
    Heartbeat,
    HeartbeatAck,
    Ack,
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
