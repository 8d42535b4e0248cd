//! Connect gateway WebSocket client
//!
//! Maintains a persistent connection to the Connect gateway with
//! auto-reconnect (exponential backoff 1s→60s, reset on success),
//! a 25-second heartbeat, and routing of inbound messages to user
//! inboxes. Handler failures close the connection and trigger reconnect;
//! they never leak into other subsystems.

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, tungstenite::Utf8Bytes};
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::connect::messaging::{self, SOURCE_GATEWAY};
use crate::connect::protocol::{
    Capabilities, DeviceIdentity, DeviceInfo, InboundFrame, OutboundFrame, UserEntry,
};
use crate::connect::users::UserManager;

/// WebSocket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectState::Disconnected => write!(f, "Disconnected"),
            ConnectState::Connecting => write!(f, "Connecting"),
            ConnectState::Connected => write!(f, "Connected"),
            ConnectState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Heartbeat cadence
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// No traffic for this long counts as a dead transport
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

struct ClientInner {
    ws_url: String,
    enabled: bool,
    credentials_path: std::path::PathBuf,
    user_manager: UserManager,
    state: Mutex<ConnectState>,
    devices: Mutex<Vec<DeviceInfo>>,
    status_message: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
    /// User registered by THIS process; when set, the only user announced
    primary_user: Mutex<Option<String>>,
    reconnect_count: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
}

impl ClientInner {
    fn set_state(&self, state: ConnectState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn set_status(&self, status: &str) {
        if let Ok(mut guard) = self.status_message.lock() {
            *guard = Some(status.to_string());
        }
    }

    fn queue_frame(&self, frame: OutboundFrame) -> bool {
        match self.outbound.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(frame).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }
}

/// WebSocket client for the VoiceMode Connect gateway
pub struct ConnectClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectClient {
    pub fn new(config: &Config, user_manager: UserManager) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                ws_url: config.connect_ws_url.clone(),
                enabled: config.connect_enabled,
                credentials_path: config.credentials_path(),
                user_manager,
                state: Mutex::new(ConnectState::Disconnected),
                devices: Mutex::new(Vec::new()),
                status_message: Mutex::new(None),
                session_id: Mutex::new(None),
                primary_user: Mutex::new(None),
                reconnect_count: AtomicU32::new(0),
                outbound: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectState::Connected
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inner
            .devices
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn status_message(&self) -> String {
        self.inner
            .status_message
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .unwrap_or_else(|| {
                if self.is_connected() {
                    "Connected".to_string()
                } else {
                    "Not initialized".to_string()
                }
            })
    }

    pub fn user_manager(&self) -> &UserManager {
        &self.inner.user_manager
    }

    /// Start the background connection task. Idempotent; checks config
    /// and credentials before connecting.
    pub async fn connect(&self) -> Result<()> {
        {
            let task = self.task.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                return Ok(());
            }
        }

        if !self.inner.enabled {
            self.inner
                .set_status("Disabled (VOICEMODE_CONNECT_ENABLED=false)");
            debug!("Connect client disabled by config");
            return Ok(());
        }

        match auth::load_credentials(&self.inner.credentials_path) {
            Some(_) => {}
            None => {
                self.inner
                    .set_status("Not connected (no credentials - run: voicemode connect login)");
                debug!("Connect client: no credentials available");
                return Ok(());
            }
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            connection_loop(inner).await;
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Cancel the background task and close the connection
    pub async fn disconnect(&self) {
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.set_state(ConnectState::Disconnected);
        if let Ok(mut devices) = self.inner.devices.lock() {
            devices.clear();
        }
        if let Ok(mut outbound) = self.inner.outbound.lock() {
            *outbound = None;
        }
        self.inner.set_status("Disconnected");
    }

    /// Mark a user as registered by this process and announce it
    pub fn register_user(&self, name: &str) {
        if let Ok(mut primary) = self.inner.primary_user.lock() {
            *primary = Some(name.to_string());
        }
        if self.is_connected() {
            self.send_capabilities_update();
        } else {
            info!("Connect client: user registration queued (will send on connect)");
        }
    }

    /// Drop a user registration; announces the remaining users, or an
    /// empty list when none are left
    pub fn unregister_user(&self, name: &str) {
        if let Ok(mut primary) = self.inner.primary_user.lock() {
            if primary.as_deref() == Some(name) {
                *primary = None;
            }
        }
        if !self.is_connected() {
            return;
        }
        if self.inner.user_manager.list().is_empty() {
            self.inner.queue_frame(OutboundFrame::CapabilitiesUpdate {
                users: Vec::new(),
                platform: "claude-code".to_string(),
            });
            info!("Connect client: all users unregistered");
        } else {
            self.send_capabilities_update();
        }
    }

    /// Announce the registered users and their presence to the gateway.
    ///
    /// Scoped to this process's primary user when one is set; otherwise
    /// all registered users are announced.
    pub fn send_capabilities_update(&self) {
        let frame = build_capabilities_update(&self.inner, self.is_connected());
        if self.inner.queue_frame(frame) {
            debug!("Connect client: capabilities_update queued");
        } else {
            debug!("Connect client: capabilities_update dropped (not connected)");
        }
    }

    /// Formatted status text for the service surface
    pub fn get_status_text(&self) -> String {
        let mut lines = vec!["VoiceMode Connect:".to_string()];
        lines.push(format!("  Status: {}", self.status_message()));

        if self.is_connected() {
            let now_ms = Utc::now().timestamp_millis();
            let remote: Vec<DeviceInfo> = self
                .devices()
                .into_iter()
                .filter(|d| d.platform.as_deref() != Some("mcp-server"))
                .collect();
            if remote.is_empty() {
                lines.push("  Remote Devices: none".to_string());
            } else {
                lines.push("  Remote Devices:".to_string());
                for device in remote {
                    let ready = if device.ready { "ready" } else { "not ready" };
                    let platform = device
                        .platform
                        .as_deref()
                        .map(|p| format!(" ({})", p))
                        .unwrap_or_default();
                    lines.push(format!(
                        "    {}{} - {}, {} - {}",
                        device.display_name(),
                        platform,
                        ready,
                        device.capabilities_str(),
                        device.activity_ago(now_ms),
                    ));
                }
            }
        }

        for user in self.inner.user_manager.list() {
            let presence = self
                .inner
                .user_manager
                .presence(&user.name, self.is_connected());
            let label = if user.display_name.is_empty() {
                user.name.clone()
            } else {
                user.display_name.clone()
            };
            lines.push(format!("  User: {} ({})", label, presence));
        }

        lines.join("\n")
    }
}

/// Build the capabilities_update frame for the current registrations
fn build_capabilities_update(inner: &ClientInner, connected: bool) -> OutboundFrame {
    let primary = inner.primary_user.lock().ok().and_then(|p| p.clone());
    let users = match primary {
        Some(name) => inner.user_manager.get(&name).into_iter().collect(),
        None => inner.user_manager.list(),
    };

    let entries: Vec<UserEntry> = users
        .into_iter()
        .map(|user| {
            let presence = inner.user_manager.presence(&user.name, connected);
            UserEntry {
                name: user.name,
                host: user.host,
                display_name: user.display_name,
                presence,
            }
        })
        .collect();

    OutboundFrame::CapabilitiesUpdate {
        users: entries,
        platform: "claude-code".to_string(),
    }
}

/// Route an inbound user message to the right mailbox. Target selection:
/// exact name match, then display_name, then the first registered user.
/// Returns the delivery confirmation to send back, if delivery succeeded.
pub(crate) fn route_user_message(
    manager: &UserManager,
    text: &str,
    from: &str,
    target_user: &str,
) -> Option<OutboundFrame> {
    if text.trim().is_empty() {
        warn!("Connect client: received empty user_message_delivery, ignoring");
        return None;
    }

    let user = if target_user.is_empty() {
        manager.list().into_iter().next()
    } else {
        manager.get(target_user).or_else(|| {
            manager
                .list()
                .into_iter()
                .find(|u| u.display_name == target_user)
                .or_else(|| manager.list().into_iter().next())
        })
    };

    let user = match user {
        Some(user) => user,
        None => {
            warn!(
                "Connect client: no user found for message target: {}",
                target_user
            );
            return None;
        }
    };

    let user_dir = manager.user_dir(&user.name);
    match messaging::deliver_message(&user_dir, text, from, SOURCE_GATEWAY, None) {
        Ok(result) => {
            info!(
                "Connect client: delivered message to {} from {}",
                user.name, from
            );
            if result.delivered {
                Some(OutboundFrame::DeliveryConfirmation {
                    message_id: result.message.id,
                    target_user: from.to_string(),
                    delivered: true,
                })
            } else {
                None
            }
        }
        Err(e) => {
            warn!("Connect client: inbox delivery failed: {:#}", e);
            None
        }
    }
}

async fn connection_loop(inner: Arc<ClientInner>) {
    let mut retry_delay = Duration::from_secs(1);

    loop {
        // Fresh credentials for every connection attempt
        inner.set_state(ConnectState::Connecting);
        let creds = match auth::load_credentials(&inner.credentials_path) {
            Some(creds) if !creds.is_expired(60) => creds,
            _ => {
                inner.set_status("Not connected (credentials expired)");
                inner.set_state(ConnectState::Disconnected);
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                continue;
            }
        };

        let token: String =
            url::form_urlencoded::byte_serialize(creds.access_token.as_bytes()).collect();
        let separator = if inner.ws_url.contains('?') { "&" } else { "?" };
        let ws_url = format!("{}{}token={}", inner.ws_url, separator, token);

        inner.set_status("Connecting...");

        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                reconnect_pause(&inner, &mut retry_delay, &e.to_string()).await;
                continue;
            }
        };

        inner.set_state(ConnectState::Connected);
        retry_delay = Duration::from_secs(1);
        inner.reconnect_count.store(0, Ordering::SeqCst);

        match run_session(&inner, stream).await {
            Ok(()) => {
                // Clean shutdown of the socket; reconnect
                reconnect_pause(&inner, &mut retry_delay, "connection closed").await;
            }
            Err(e) => {
                reconnect_pause(&inner, &mut retry_delay, &e.to_string()).await;
            }
        }
    }
}

async fn reconnect_pause(inner: &Arc<ClientInner>, retry_delay: &mut Duration, reason: &str) {
    inner.set_state(ConnectState::Reconnecting);
    if let Ok(mut devices) = inner.devices.lock() {
        devices.clear();
    }
    if let Ok(mut outbound) = inner.outbound.lock() {
        *outbound = None;
    }
    let attempt = inner.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
    inner.set_status(&format!("Reconnecting (attempt {})", attempt));
    debug!(
        "Connect client: connection error: {}, retrying in {:?}",
        reason, retry_delay
    );
    tokio::time::sleep(*retry_delay).await;
    *retry_delay = (*retry_delay * 2).min(MAX_RETRY_DELAY);
}

async fn run_session(
    inner: &Arc<ClientInner>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<()> {
    let (mut write, mut read) = stream.split();

    // Expect the `connected` frame first
    let first = tokio::time::timeout(IDLE_TIMEOUT, read.next())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for connected frame"))?
        .ok_or_else(|| anyhow::anyhow!("socket closed before connected frame"))?
        .map_err(|e| anyhow::anyhow!("read failed: {}", e))?;

    match parse_ws_message(&first) {
        Some(InboundFrame::Connected { session_id }) => {
            let short: String = session_id.chars().take(12).collect();
            if let Ok(mut guard) = inner.session_id.lock() {
                *guard = Some(short.clone());
            }
            inner.set_status("Connected");
            info!("Connect client: connected (session: {})", short);
        }
        other => {
            warn!("Connect client: unexpected first message: {:?}", other);
        }
    }

    // Advertise identity and capabilities
    let ready = OutboundFrame::Ready {
        device: DeviceIdentity {
            platform: "mcp-server".to_string(),
            app_version: crate::VERSION.to_string(),
            device_id: auth::device_id(),
            name: auth::device_name(),
        },
        capabilities: Capabilities { tts: true, stt: true },
    };
    send_frame(&mut write, &ready).await?;

    // Re-register users if any exist
    if !inner.user_manager.list().is_empty() {
        let update = build_capabilities_update(inner, true);
        send_frame(&mut write, &update).await?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    if let Ok(mut outbound) = inner.outbound.lock() {
        *outbound = Some(tx);
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_traffic = tokio::time::Instant::now();

    loop {
        tokio::select! {
            message = read.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(anyhow::anyhow!("read failed: {}", e)),
                    None => return Ok(()),
                };
                last_traffic = tokio::time::Instant::now();

                if message.is_close() {
                    return Ok(());
                }
                if let Some(frame) = parse_ws_message(&message) {
                    if let Some(reply) = handle_frame(inner, frame) {
                        send_frame(&mut write, &reply).await?;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                send_frame(&mut write, &frame).await?;
            }
            _ = heartbeat.tick() => {
                if last_traffic.elapsed() >= IDLE_TIMEOUT {
                    return Err(anyhow::anyhow!("no traffic for {:?}", IDLE_TIMEOUT));
                }
                let frame = OutboundFrame::Heartbeat {
                    timestamp: Utc::now().timestamp_millis(),
                };
                send_frame(&mut write, &frame).await?;
            }
        }
    }
}

fn parse_ws_message(message: &WsMessage) -> Option<InboundFrame> {
    let text = match message {
        WsMessage::Text(text) => text.as_str(),
        _ => return None,
    };
    match InboundFrame::parse(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Connect client: invalid JSON: {} ({:.100})", e, text);
            None
        }
    }
}

/// Dispatch one inbound frame; may return a frame to send back
fn handle_frame(inner: &Arc<ClientInner>, frame: InboundFrame) -> Option<OutboundFrame> {
    match frame {
        InboundFrame::Devices { devices } => {
            debug!("Connect client: {} device(s) connected", devices.len());
            if let Ok(mut guard) = inner.devices.lock() {
                *guard = devices;
            }
            None
        }
        InboundFrame::Heartbeat | InboundFrame::HeartbeatAck | InboundFrame::Ack => None,
        InboundFrame::Error { message, code } => {
            warn!(
                "Connect client: server error: {} ({})",
                message,
                code.unwrap_or_default()
            );
            None
        }
        InboundFrame::UserMessageDelivery { text, from, target_user } => {
            route_user_message(&inner.user_manager, &text, &from, &target_user)
        }
        InboundFrame::Connected { .. } => None,
        InboundFrame::Unknown => {
            debug!("Connect client: unhandled message type");
            None
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &OutboundFrame) -> Result<()>
where
    S: SinkExt<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame)?;
    write
        .send(WsMessage::Text(Utf8Bytes::from(json)))
        .await
        .map_err(|e| anyhow::anyhow!("send failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::messaging::read_inbox;

    fn manager(dir: &std::path::Path) -> UserManager {
        UserManager::new("voicemode.dev", dir.join("users"))
            .with_teams_dir(dir.join("teams"))
    }

    #[test]
    fn test_route_exact_name_match() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "Cora 7", None).unwrap();
        manager.add("echo", "Echo", None).unwrap();

        let reply = route_user_message(&manager, "Hello Cora!", "dashboard-user", "cora");
        // No live inbox, so no confirmation frame
        assert!(reply.is_none());

        let messages = read_inbox(&manager.user_dir("cora"), None, 10);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello Cora!");
        assert_eq!(messages[0].from, "dashboard-user");
        assert!(read_inbox(&manager.user_dir("echo"), None, 10).is_empty());
    }

    #[test]
    fn test_route_by_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "Cora 7", None).unwrap();

        let _ = route_user_message(&manager, "Hi", "u", "Cora 7");
        assert_eq!(read_inbox(&manager.user_dir("cora"), None, 10).len(), 1);
    }

    #[test]
    fn test_route_falls_back_to_first_user() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", None).unwrap();
        manager.add("echo", "", None).unwrap();

        let _ = route_user_message(&manager, "Hi", "u", "nobody-here");
        assert_eq!(read_inbox(&manager.user_dir("cora"), None, 10).len(), 1);
    }

    #[test]
    fn test_route_drops_empty_text_and_no_users() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        assert!(route_user_message(&manager, "   ", "u", "cora").is_none());
        assert!(route_user_message(&manager, "Hi", "u", "cora").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_route_with_live_inbox_returns_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", Some("voice-team")).unwrap();

        let reply = route_user_message(&manager, "Hello Cora!", "dashboard-user", "cora");
        match reply {
            Some(OutboundFrame::DeliveryConfirmation {
                message_id,
                target_user,
                delivered,
            }) => {
                assert!(message_id.starts_with("msg_"));
                // Confirmation routes back to the sender
                assert_eq!(target_user, "dashboard-user");
                assert!(delivered);
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_without_credentials_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_dir: dir.path().to_path_buf(),
            connect_enabled: true,
            ..Config::default()
        };
        let client = ConnectClient::new(&config, manager(dir.path()));

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectState::Disconnected);
        assert!(client.status_message().contains("no credentials"));
    }

    #[tokio::test]
    async fn test_connect_disabled_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_dir: dir.path().to_path_buf(),
            connect_enabled: false,
            ..Config::default()
        };
        let client = ConnectClient::new(&config, manager(dir.path()));

        client.connect().await.unwrap();
        assert!(client.status_message().contains("Disabled"));
    }

    #[test]
    fn test_capabilities_update_scoped_to_primary_user() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let client = ConnectClient::new(&config, manager(dir.path()));
        client.inner.user_manager.add("cora", "", None).unwrap();
        client.inner.user_manager.add("echo", "", None).unwrap();

        // No primary: announce everyone
        let frame = build_capabilities_update(&client.inner, true);
        match frame {
            OutboundFrame::CapabilitiesUpdate { users, platform } => {
                assert_eq!(users.len(), 2);
                assert_eq!(platform, "claude-code");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Primary set: announce only that user
        *client.inner.primary_user.lock().unwrap() = Some("echo".to_string());
        let frame = build_capabilities_update(&client.inner, true);
        match frame {
            OutboundFrame::CapabilitiesUpdate { users, .. } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].name, "echo");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_status_text_lists_users() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let client = ConnectClient::new(&config, manager(dir.path()));
        client.inner.user_manager.add("cora", "Cora 7", None).unwrap();

        let text = client.get_status_text();
        assert!(text.contains("VoiceMode Connect"));
        assert!(text.contains("Cora 7"));
        assert!(text.contains("offline"));
    }
}
