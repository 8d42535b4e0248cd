//! Credential storage and OAuth helpers
//!
//! Credentials live in a single JSON file (mode 0600). The PKCE helpers
//! and callback-port probing support the login flow run by an external
//! surface; this module only owns the pieces the runtime consumes.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::TcpListener;
use std::path::Path;
use tracing::debug;

/// Stored gateway credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds)
    pub expires_at: f64,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<serde_json::Value>,
}

impl Credentials {
    /// Expired (or about to expire within `buffer_seconds`)
    pub fn is_expired(&self, buffer_seconds: i64) -> bool {
        Utc::now().timestamp() as f64 >= self.expires_at - buffer_seconds as f64
    }
}

/// Persist credentials with owner-only permissions
pub fn save_credentials(path: &Path, credentials: &Credentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(credentials)?;
    std::fs::write(path, format!("{}\n", json))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    debug!("Saved credentials to {}", path.display());
    Ok(())
}

/// Load credentials; None when missing or unparsable
pub fn load_credentials(path: &Path) -> Option<Credentials> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Remove the credentials file. Returns whether a file was removed.
pub fn clear_credentials(path: &Path) -> bool {
    if path.exists() {
        std::fs::remove_file(path).is_ok()
    } else {
        false
    }
}

/// PKCE verifier + challenge pair
#[derive(Debug, Clone)]
pub struct PkceParams {
    pub verifier: String,
    pub challenge: String,
}

/// Characters RFC 7636 allows in a verifier
const VERIFIER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Generate a PKCE verifier (64 chars from the unreserved set) and its
/// S256 challenge (base64url, no padding)
pub fn generate_pkce_params() -> PkceParams {
    let mut rng = rand::rng();
    let verifier: String = (0..64)
        .map(|_| {
            let idx = rng.random_range(0..VERIFIER_CHARSET.len());
            VERIFIER_CHARSET[idx] as char
        })
        .collect();
    let challenge = pkce_challenge(&verifier);
    PkceParams { verifier, challenge }
}

/// S256 challenge for a verifier
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// First bindable port in [start, end], or None when every port in the
/// range is taken
pub fn find_available_port(start: u16, end: u16) -> Option<u16> {
    for port in start..=end {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Some(port);
        }
    }
    None
}

/// Stable per-host device id
pub fn device_id() -> String {
    let host = hostname();
    let digest = Sha256::digest(host.as_bytes());
    format!("vm-{}", hex::encode(&digest[..6]))
}

/// Human-readable device name
pub fn device_name() -> String {
    hostname()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "voicemode-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            access_token: "tok_abc".to_string(),
            refresh_token: Some("ref_xyz".to_string()),
            expires_at: 4_102_444_800.0,
            token_type: "Bearer".to_string(),
            user_info: Some(serde_json::json!({"email": "cora@example.com"})),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        let creds = credentials();

        save_credentials(&path, &creds).unwrap();
        let loaded = load_credentials(&path).unwrap();
        assert_eq!(loaded, creds);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_clear_credentials_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        save_credentials(&path, &credentials()).unwrap();

        assert!(clear_credentials(&path));
        assert!(load_credentials(&path).is_none());
        assert!(!clear_credentials(&path));
    }

    #[test]
    fn test_load_unparsable_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_credentials(&path).is_none());
    }

    #[test]
    fn test_expiry_buffer() {
        let mut creds = credentials();
        creds.expires_at = (Utc::now().timestamp() + 30) as f64;
        assert!(creds.is_expired(60));
        assert!(!creds.is_expired(0));
    }

    #[test]
    fn test_pkce_verifier_shape() {
        let params = generate_pkce_params();
        assert!(params.verifier.len() >= 43 && params.verifier.len() <= 128);
        assert!(params
            .verifier
            .bytes()
            .all(|b| VERIFIER_CHARSET.contains(&b)));
        // Challenge is base64url without padding
        assert!(!params.challenge.contains('='));
        assert!(!params.challenge.contains('+'));
        assert!(!params.challenge.contains('/'));
    }

    #[test]
    fn test_pkce_challenge_is_deterministic_sha256() {
        // RFC 7636 appendix B test vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_find_available_port() {
        // Hold one port, then ask for a range starting there
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        // A range of exactly the held port is exhausted
        assert_eq!(find_available_port(held, held), None);
    }

    #[test]
    fn test_device_id_is_stable() {
        assert_eq!(device_id(), device_id());
        assert!(device_id().starts_with("vm-"));
    }
}
