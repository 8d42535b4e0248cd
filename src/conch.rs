//! Conch - advisory lock asserting "a voice conversation is active"
//!
//! Exclusive non-blocking flock on a single file carrying
//! `{pid, agent, acquired, expires}`. Stale locks older than the
//! configured expiry are cleared by unlinking: the stuck process keeps
//! its flock on the old inode while a fresh file (new inode) is created,
//! so a hung holder can never block new acquisitions forever.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConchHolder {
    pub pid: u32,
    pub agent: String,
    pub acquired: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

/// Advisory exclusive lock on the conch file
pub struct Conch {
    path: PathBuf,
    agent: String,
    lock_expiry: Duration,
    file: Option<File>,
    acquired_at: Option<DateTime<Utc>>,
}

impl Conch {
    pub fn new(path: PathBuf, agent: &str, lock_expiry: Duration) -> Self {
        Self {
            path,
            agent: agent.to_string(),
            lock_expiry,
            file: None,
            acquired_at: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Atomically try to acquire the conch. Clears stale locks first.
    /// Returns false when another live process holds it.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        self.clear_stale_lock();

        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        if !flock_exclusive(&file) {
            debug!("Conch held by another process");
            return Ok(false);
        }

        let now = Utc::now();
        let holder = ConchHolder {
            pid: std::process::id(),
            agent: self.agent.clone(),
            acquired: now,
            expires: None,
        };
        let json = serde_json::to_string_pretty(&holder)?;

        use std::io::{Seek, Write};
        let mut file = file;
        file.set_len(0)?;
        file.seek(std::io::SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        self.file = Some(file);
        self.acquired_at = Some(now);
        info!("Conch acquired by {}", self.agent);
        Ok(true)
    }

    /// Release the lock. Unlinks the file only when this instance holds
    /// the lock (removing a stranger's file would orphan their flock onto
    /// a dead inode). Returns seconds held.
    pub fn release(&mut self) -> f64 {
        let held_seconds = self
            .acquired_at
            .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        if let Some(file) = self.file.take() {
            flock_unlock(&file);
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!("Conch unlink failed: {}", e);
            }
            info!("Conch released after {:.1}s", held_seconds);
        }
        self.acquired_at = None;
        held_seconds
    }

    /// Whether a voice conversation is active: the lock file exists, its
    /// holder pid is alive, and the lock is not stale
    pub fn is_active(&self) -> bool {
        let holder = match self.read_holder() {
            Some(holder) => holder,
            None => return false,
        };

        if !process_alive(holder.pid) {
            return false;
        }

        if !self.lock_expiry.is_zero() {
            let age = Utc::now() - holder.acquired;
            if age.num_seconds() as u64 > self.lock_expiry.as_secs() {
                return false;
            }
        }

        true
    }

    /// Lock-file contents when a conversation is active
    pub fn get_holder(&self) -> Option<ConchHolder> {
        if self.is_active() {
            self.read_holder()
        } else {
            None
        }
    }

    fn read_holder(&self) -> Option<ConchHolder> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Unlink a lock older than the expiry so a fresh inode can be locked
    fn clear_stale_lock(&self) {
        if self.lock_expiry.is_zero() {
            return;
        }
        let holder = match self.read_holder() {
            Some(holder) => holder,
            None => return,
        };
        let age = Utc::now() - holder.acquired;
        if age.num_seconds() as u64 > self.lock_expiry.as_secs() {
            warn!(
                "Clearing stale conch held by {} (pid {})",
                holder.agent, holder.pid
            );
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for Conch {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.release();
        }
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn flock_unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> bool {
    true
}

#[cfg(not(unix))]
fn flock_unlock(_file: &File) {}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conch(dir: &std::path::Path, agent: &str) -> Conch {
        Conch::new(dir.join("conch"), agent, Duration::from_secs(120))
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut conch = conch(dir.path(), "cora");

        assert!(!conch.is_active());
        assert!(conch.try_acquire().unwrap());
        assert!(conch.is_held());
        assert!(conch.is_active());

        let holder = conch.get_holder().unwrap();
        assert_eq!(holder.agent, "cora");
        assert_eq!(holder.pid, std::process::id());

        conch.release();
        assert!(!conch.is_held());
        assert!(!conch.is_active());
        assert!(!dir.path().join("conch").exists());
    }

    #[test]
    fn test_acquire_is_idempotent_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let mut conch = conch(dir.path(), "cora");
        assert!(conch.try_acquire().unwrap());
        assert!(conch.try_acquire().unwrap());
        conch.release();
    }

    #[cfg(unix)]
    #[test]
    fn test_second_holder_in_same_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = conch(dir.path(), "cora");
        let mut second = conch(dir.path(), "echo");

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());
        assert!(!second.is_held());

        first.release();
        assert!(second.try_acquire().unwrap());
        second.release();
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conch");

        // A lock from a dead past: old timestamp, live pid
        let stale = ConchHolder {
            pid: std::process::id(),
            agent: "ghost".to_string(),
            acquired: Utc::now() - chrono::Duration::hours(1),
            expires: None,
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let mut conch = Conch::new(path, "cora", Duration::from_secs(120));
        // Stale: not active despite the live pid
        assert!(!conch.is_active());
        // And acquirable: the stale file is unlinked first
        assert!(conch.try_acquire().unwrap());
        assert_eq!(conch.get_holder().unwrap().agent, "cora");
        conch.release();
    }

    #[test]
    fn test_dead_pid_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conch");
        let holder = ConchHolder {
            // PIDs this large are not in use
            pid: 4_000_000,
            agent: "ghost".to_string(),
            acquired: Utc::now(),
            expires: None,
        };
        std::fs::write(&path, serde_json::to_string(&holder).unwrap()).unwrap();

        let conch = Conch::new(path, "cora", Duration::from_secs(120));
        assert!(!conch.is_active());
    }

    #[test]
    fn test_unparsable_lock_file_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conch");
        std::fs::write(&path, "{nope").unwrap();

        let conch = Conch::new(path, "cora", Duration::from_secs(120));
        assert!(!conch.is_active());
    }
}
