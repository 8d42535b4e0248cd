//! VoiceMode Connect
//!
//! Persistent WebSocket client to the Connect gateway, plus the
//! filesystem mailboxes behind it: user registration, presence, remote
//! device listings, inbox delivery, and the watcher that re-announces
//! when the users directory changes.

pub mod client;
pub mod messaging;
pub mod protocol;
pub mod users;
pub mod watcher;

pub use client::{ConnectClient, ConnectState};
pub use messaging::{deliver_message, read_inbox, DeliveredMessage};
pub use protocol::{DeviceInfo, InboundFrame, OutboundFrame, Presence, UserEntry};
pub use users::{UserInfo, UserManager};
pub use watcher::{diff_user_state, watch_user_changes, UserChange};

use anyhow::Result;
use messaging::InboxMessage;

/// Register a mailbox and announce it to the gateway
pub fn connect_user_add(
    client: &ConnectClient,
    name: &str,
    display_name: Option<&str>,
    subscribe_team: Option<&str>,
) -> Result<UserInfo> {
    let user = client
        .user_manager()
        .add(name, display_name.unwrap_or(""), subscribe_team)?;
    client.register_user(name);
    Ok(user)
}

/// Remove a mailbox and announce the remaining users
pub fn connect_user_remove(client: &ConnectClient, name: &str) -> Result<bool> {
    let removed = client.user_manager().remove(name)?;
    if removed {
        client.unregister_user(name);
    }
    Ok(removed)
}

/// Human-readable connection, device, and user status
pub fn connect_status(client: &ConnectClient) -> String {
    client.get_status_text()
}

/// Read a user's inbox; defaults to the first registered user
pub fn connect_inbox(
    client: &ConnectClient,
    name: Option<&str>,
    limit: usize,
) -> Vec<InboxMessage> {
    let manager = client.user_manager();
    let user = match name {
        Some(name) => manager.get(name),
        None => manager.list().into_iter().next(),
    };
    match user {
        Some(user) => read_inbox(&manager.user_dir(&user.name), None, limit),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client(dir: &std::path::Path) -> ConnectClient {
        let config = Config {
            base_dir: dir.to_path_buf(),
            ..Config::default()
        };
        let manager = UserManager::new("voicemode.dev", dir.join("users"))
            .with_teams_dir(dir.join("teams"));
        ConnectClient::new(&config, manager)
    }

    #[test]
    fn test_user_add_and_inbox_surface() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());

        let user = connect_user_add(&client, "cora", Some("Cora 7"), None).unwrap();
        assert_eq!(user.display_name, "Cora 7");

        let user_dir = client.user_manager().user_dir("cora");
        deliver_message(&user_dir, "hi", "u", "api", None).unwrap();

        assert_eq!(connect_inbox(&client, Some("cora"), 10).len(), 1);
        assert_eq!(connect_inbox(&client, None, 10).len(), 1);
        assert!(connect_inbox(&client, Some("nobody"), 10).is_empty());

        assert!(connect_user_remove(&client, "cora").unwrap());
        assert!(!connect_user_remove(&client, "cora").unwrap());
    }

    #[test]
    fn test_status_surface() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        connect_user_add(&client, "cora", None, None).unwrap();
        assert!(connect_status(&client).contains("cora"));
    }
}

