//! User (mailbox) management
//!
//! Each Connect user owns a directory `users/<name>/` holding `meta.json`,
//! an append-only `inbox` (JSONL), and optionally an `inbox-live` symlink
//! pointing at an external consumer's mailbox. The symlink is the
//! subscription mechanism: presence derives from connection state plus
//! symlink validity.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::connect::protocol::Presence;

/// A registered Connect user/mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub name: String,
    pub display_name: String,
    pub host: String,
    pub created: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Team name extracted from the inbox-live symlink target, if any
    pub subscribed_team: Option<String>,
}

impl UserInfo {
    /// Full mailbox@host address
    pub fn address(&self) -> String {
        if self.host.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.host)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserMeta {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

/// Watcher snapshot entry for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub display_name: String,
    pub symlink_target: Option<PathBuf>,
    pub subscribed: bool,
}

/// Mailbox names start with a lowercase letter, then lowercase
/// alphanumerics, underscores, or dashes
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        }
        _ => false,
    };
    if !valid {
        bail!(
            "invalid user name {:?}: must start with [a-z] and contain only [a-z0-9_-]",
            name
        );
    }
    Ok(())
}

/// Manages Connect users (mailboxes) on the local filesystem
pub struct UserManager {
    host: String,
    users_dir: PathBuf,
    teams_dir: PathBuf,
}

impl UserManager {
    pub fn new(host: &str, users_dir: PathBuf) -> Self {
        let teams_dir = dirs::home_dir()
            .map(|h| h.join(".claude").join("teams"))
            .unwrap_or_else(|| PathBuf::from(".claude/teams"));
        Self {
            host: host.to_string(),
            users_dir,
            teams_dir,
        }
    }

    /// Override where team inboxes live (used by tests)
    pub fn with_teams_dir(mut self, teams_dir: PathBuf) -> Self {
        self.teams_dir = teams_dir;
        self
    }

    pub fn user_dir(&self, name: &str) -> PathBuf {
        self.users_dir.join(name)
    }

    /// Add a user/mailbox: directory, metadata, empty inbox
    pub fn add(
        &self,
        name: &str,
        display_name: &str,
        subscribe_team: Option<&str>,
    ) -> Result<UserInfo> {
        validate_name(name)?;

        let user_dir = self.user_dir(name);
        std::fs::create_dir_all(&user_dir)
            .with_context(|| format!("Failed to create {}", user_dir.display()))?;

        let now = Utc::now();
        let meta = UserMeta {
            name: name.to_string(),
            display_name: display_name.to_string(),
            host: self.host.clone(),
            created: Some(now),
            last_seen: Some(now),
        };
        let meta_json = serde_json::to_string_pretty(&meta)?;
        std::fs::write(user_dir.join("meta.json"), format!("{}\n", meta_json))?;

        let inbox = user_dir.join("inbox");
        if !inbox.exists() {
            std::fs::write(&inbox, "")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&inbox, std::fs::Permissions::from_mode(0o644));
            }
        }

        let mut user = UserInfo {
            name: name.to_string(),
            display_name: display_name.to_string(),
            host: self.host.clone(),
            created: Some(now),
            last_seen: Some(now),
            subscribed_team: None,
        };

        if let Some(team) = subscribe_team {
            self.subscribe(name, team)?;
            user.subscribed_team = Some(team.to_string());
        }

        info!("Added Connect user: {}", user.address());
        Ok(user)
    }

    /// Remove a user/mailbox and all its contents
    pub fn remove(&self, name: &str) -> Result<bool> {
        let user_dir = self.user_dir(name);
        if !user_dir.exists() {
            return Ok(false);
        }
        let _ = self.unsubscribe(name);
        std::fs::remove_dir_all(&user_dir)
            .with_context(|| format!("Failed to remove {}", user_dir.display()))?;
        info!("Removed Connect user: {}", name);
        Ok(true)
    }

    /// All registered users, sorted by name
    pub fn list(&self) -> Vec<UserInfo> {
        let mut users = Vec::new();
        let entries = match std::fs::read_dir(&self.users_dir) {
            Ok(entries) => entries,
            Err(_) => return users,
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();

        for name in names {
            if let Some(user) = self.get(&name) {
                users.push(user);
            }
        }
        users
    }

    /// Load one user from its meta.json, or None if unregistered
    pub fn get(&self, name: &str) -> Option<UserInfo> {
        let user_dir = self.user_dir(name);
        let meta_path = user_dir.join("meta.json");
        let meta: UserMeta = serde_json::from_str(&std::fs::read_to_string(meta_path).ok()?).ok()?;

        Some(UserInfo {
            name: if meta.name.is_empty() {
                name.to_string()
            } else {
                meta.name
            },
            display_name: meta.display_name,
            host: if meta.host.is_empty() {
                self.host.clone()
            } else {
                meta.host
            },
            created: meta.created,
            last_seen: meta.last_seen,
            subscribed_team: self.subscribed_team(name),
        })
    }

    /// Team name extracted from the inbox-live symlink target path
    fn subscribed_team(&self, name: &str) -> Option<String> {
        let symlink = self.user_dir(name).join("inbox-live");
        let target = std::fs::read_link(&symlink).ok()?;
        let mut components = target.components();
        while let Some(component) = components.next() {
            if component.as_os_str() == "teams" {
                return components
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned());
            }
        }
        None
    }

    /// Create the inbox-live symlink for a user.
    ///
    /// A wrong symlink is replaced; anything unexpected at that path is
    /// renamed to `inbox-live.stale-<ts>` rather than deleted.
    pub fn subscribe(&self, name: &str, team: &str) -> Result<PathBuf> {
        let user_dir = self.user_dir(name);
        std::fs::create_dir_all(&user_dir)?;

        let symlink = user_dir.join("inbox-live");
        let target = self.teams_dir.join(team).join("inboxes").join("team-lead.json");

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if symlink.is_symlink() {
            if std::fs::read_link(&symlink).ok().as_deref() == Some(target.as_path()) {
                debug!("inbox-live for {} already points at the target", name);
                return Ok(symlink);
            }
            info!("Updating stale inbox-live symlink for {}", name);
            std::fs::remove_file(&symlink)?;
        } else if symlink.exists() {
            let stale_name = format!("inbox-live.stale-{}", Utc::now().timestamp());
            let stale_path = user_dir.join(&stale_name);
            warn!(
                "Unexpected file at inbox-live for {}, renaming to {}",
                name, stale_name
            );
            std::fs::rename(&symlink, &stale_path)?;
        }

        make_symlink(&target, &symlink)?;
        info!("Subscribed {} to team {}", name, team);
        Ok(symlink)
    }

    /// Remove the inbox-live symlink, if one exists
    pub fn unsubscribe(&self, name: &str) -> Result<bool> {
        let symlink = self.user_dir(name).join("inbox-live");
        if symlink.is_symlink() {
            std::fs::remove_file(&symlink)?;
            info!("Unsubscribed {}", name);
            return Ok(true);
        }
        Ok(false)
    }

    /// A subscription is active when the symlink resolves to a target
    /// whose parent directory exists
    pub fn is_subscribed(&self, name: &str) -> bool {
        let symlink = self.user_dir(name).join("inbox-live");
        if !symlink.is_symlink() {
            return false;
        }
        match std::fs::read_link(&symlink) {
            Ok(target) => target.parent().map(|p| p.exists()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Presence: Offline when the client is disconnected, Available when
    /// subscribed, Online otherwise
    pub fn presence(&self, name: &str, client_connected: bool) -> Presence {
        if !client_connected || !self.user_dir(name).exists() {
            return Presence::Offline;
        }
        if self.is_subscribed(name) {
            Presence::Available
        } else {
            Presence::Online
        }
    }

    /// Snapshot of every user's identity and subscription, for the watcher
    pub fn snapshot(&self) -> BTreeMap<String, UserSnapshot> {
        let mut state = BTreeMap::new();
        for user in self.list() {
            let symlink = self.user_dir(&user.name).join("inbox-live");
            let symlink_target = std::fs::read_link(&symlink).ok();
            state.insert(
                user.name.clone(),
                UserSnapshot {
                    display_name: user.display_name.clone(),
                    symlink_target,
                    subscribed: user.subscribed_team.is_some(),
                },
            );
        }
        state
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Failed to create symlink {}", link.display()))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    bail!(
        "inbox-live symlinks are not supported on this platform ({})",
        link.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> UserManager {
        UserManager::new("voicemode.dev", dir.join("users"))
            .with_teams_dir(dir.join("teams"))
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("cora").is_ok());
        assert!(validate_name("cora-7_x2").is_ok());
        assert!(validate_name("Cora").is_err());
        assert!(validate_name("7cora").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("cora!").is_err());
    }

    #[test]
    fn test_add_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let user = manager.add("cora", "Cora 7", None).unwrap();
        assert_eq!(user.address(), "cora@voicemode.dev");

        let user_dir = manager.user_dir("cora");
        assert!(user_dir.join("meta.json").exists());
        assert!(user_dir.join("inbox").exists());

        let loaded = manager.get("cora").unwrap();
        assert_eq!(loaded.display_name, "Cora 7");
        assert_eq!(loaded.host, "voicemode.dev");
        assert!(loaded.subscribed_team.is_none());
    }

    #[test]
    fn test_add_rejects_bad_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.add("Bad Name", "", None).is_err());
    }

    #[test]
    fn test_list_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("echo", "", None).unwrap();
        manager.add("cora", "", None).unwrap();

        let names: Vec<String> = manager.list().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["cora", "echo"]);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", None).unwrap();

        assert!(manager.remove("cora").unwrap());
        assert!(manager.get("cora").is_none());
        assert!(!manager.remove("cora").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_subscribe_and_presence() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", None).unwrap();

        assert_eq!(manager.presence("cora", false), Presence::Offline);
        assert_eq!(manager.presence("cora", true), Presence::Online);

        manager.subscribe("cora", "voice-team").unwrap();
        assert!(manager.is_subscribed("cora"));
        assert_eq!(manager.presence("cora", true), Presence::Available);
        assert_eq!(
            manager.get("cora").unwrap().subscribed_team.as_deref(),
            Some("voice-team")
        );

        manager.unsubscribe("cora").unwrap();
        assert!(!manager.is_subscribed("cora"));
        assert_eq!(manager.presence("cora", true), Presence::Online);
    }

    #[cfg(unix)]
    #[test]
    fn test_subscribe_is_idempotent_and_replaces_wrong_target() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", None).unwrap();

        let first = manager.subscribe("cora", "team-a").unwrap();
        let second = manager.subscribe("cora", "team-a").unwrap();
        assert_eq!(first, second);

        manager.subscribe("cora", "team-b").unwrap();
        let target = std::fs::read_link(manager.user_dir("cora").join("inbox-live")).unwrap();
        assert!(target.to_string_lossy().contains("team-b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_subscribe_renames_unexpected_file_to_stale() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "", None).unwrap();

        // A regular file where the symlink should be
        let symlink_path = manager.user_dir("cora").join("inbox-live");
        std::fs::write(&symlink_path, "not a symlink").unwrap();

        manager.subscribe("cora", "team-a").unwrap();
        assert!(symlink_path.is_symlink());

        // The old file was renamed, never deleted
        let stale_count = std::fs::read_dir(manager.user_dir("cora"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("inbox-live.stale-")
            })
            .count();
        assert_eq!(stale_count, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_diffable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add("cora", "Cora", None).unwrap();

        let s1 = manager.snapshot();
        let s2 = manager.snapshot();
        assert_eq!(s1, s2);

        manager.subscribe("cora", "team-a").unwrap();
        let s3 = manager.snapshot();
        assert_ne!(s1, s3);
        assert!(s3["cora"].subscribed);
    }
}
