//! User directory watcher
//!
//! Polls the users directory, diffs snapshots, and re-announces to the
//! gateway when anything changed. Transient errors never crash the
//! watcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connect::client::ConnectClient;
use crate::connect::users::UserSnapshot;

/// Default poll cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// One observed change between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Added(String),
    Removed(String),
    Subscribed(String),
    Unsubscribed(String),
    Changed(String),
}

impl std::fmt::Display for UserChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserChange::Added(name) => write!(f, "+ User added: {}", name),
            UserChange::Removed(name) => write!(f, "- User removed: {}", name),
            UserChange::Subscribed(name) => write!(f, "^ {} now available (subscribed)", name),
            UserChange::Unsubscribed(name) => {
                write!(f, "v {} no longer available (unsubscribed)", name)
            }
            UserChange::Changed(name) => write!(f, "~ {} changed", name),
        }
    }
}

/// Compare two snapshots. `diff(s, s)` is empty.
pub fn diff_user_state(
    prev: &BTreeMap<String, UserSnapshot>,
    curr: &BTreeMap<String, UserSnapshot>,
) -> Vec<UserChange> {
    let mut changes = Vec::new();

    for name in curr.keys() {
        if !prev.contains_key(name) {
            changes.push(UserChange::Added(name.clone()));
        }
    }
    for name in prev.keys() {
        if !curr.contains_key(name) {
            changes.push(UserChange::Removed(name.clone()));
        }
    }
    for (name, curr_state) in curr {
        if let Some(prev_state) = prev.get(name) {
            if prev_state != curr_state {
                if curr_state.subscribed && !prev_state.subscribed {
                    changes.push(UserChange::Subscribed(name.clone()));
                } else if prev_state.subscribed && !curr_state.subscribed {
                    changes.push(UserChange::Unsubscribed(name.clone()));
                } else {
                    changes.push(UserChange::Changed(name.clone()));
                }
            }
        }
    }

    changes
}

/// Poll for user/subscription changes until shutdown. Any change while
/// the client is connected triggers `send_capabilities_update`.
pub async fn watch_user_changes(
    client: Arc<ConnectClient>,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut prev = client.user_manager().snapshot();
    info!(
        "Connect watcher started (interval: {:?}, {} user(s))",
        poll_interval,
        prev.len()
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_rx.recv() => {
                info!("Connect watcher shutting down");
                return;
            }
        }

        let curr = client.user_manager().snapshot();
        if curr == prev {
            continue;
        }

        let changes = diff_user_state(&prev, &curr);
        for change in &changes {
            info!("  {}", change);
        }

        if client.is_connected() {
            client.send_capabilities_update();
            debug!("Announced {} user(s) to gateway", curr.len());
        }

        prev = curr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn snapshot(subscribed: bool) -> UserSnapshot {
        UserSnapshot {
            display_name: "Cora".to_string(),
            symlink_target: subscribed.then(|| PathBuf::from("/teams/a/inboxes/lead.json")),
            subscribed,
        }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let mut state = BTreeMap::new();
        state.insert("cora".to_string(), snapshot(false));
        assert!(diff_user_state(&state, &state).is_empty());
    }

    #[test]
    fn test_diff_added_and_removed() {
        let mut prev = BTreeMap::new();
        prev.insert("cora".to_string(), snapshot(false));
        let mut curr = BTreeMap::new();
        curr.insert("echo".to_string(), snapshot(false));

        let changes = diff_user_state(&prev, &curr);
        assert!(changes.contains(&UserChange::Added("echo".to_string())));
        assert!(changes.contains(&UserChange::Removed("cora".to_string())));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_diff_subscription_transitions() {
        let mut prev = BTreeMap::new();
        prev.insert("cora".to_string(), snapshot(false));
        let mut curr = BTreeMap::new();
        curr.insert("cora".to_string(), snapshot(true));

        assert_eq!(
            diff_user_state(&prev, &curr),
            vec![UserChange::Subscribed("cora".to_string())]
        );
        assert_eq!(
            diff_user_state(&curr, &prev),
            vec![UserChange::Unsubscribed("cora".to_string())]
        );
    }

    #[test]
    fn test_diff_other_change() {
        let mut prev = BTreeMap::new();
        prev.insert("cora".to_string(), snapshot(false));
        let mut curr = BTreeMap::new();
        let mut renamed = snapshot(false);
        renamed.display_name = "Cora 8".to_string();
        curr.insert("cora".to_string(), renamed);

        assert_eq!(
            diff_user_state(&prev, &curr),
            vec![UserChange::Changed("cora".to_string())]
        );
    }

    #[test]
    fn test_change_display() {
        assert_eq!(
            UserChange::Added("echo".to_string()).to_string(),
            "+ User added: echo"
        );
        assert_eq!(
            UserChange::Subscribed("cora".to_string()).to_string(),
            "^ cora now available (subscribed)"
        );
    }
}
