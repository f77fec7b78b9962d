//! In-memory credential storage with an optional persistent mirror.
//!
//! The store holds the access/refresh pair behind a synchronous lock so that
//! a `set` or `clear` is visible to the very next outgoing request - there is
//! no stale-read window across an `.await`. Under header transport the
//! refresh token is additionally mirrored to a single JSON file; under cookie
//! transport durability is delegated entirely to the server-set HttpOnly
//! cookie and nothing client-readable is written.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Config, TransportMode};

/// Mirror file name in the storage directory
const MIRROR_FILE: &str = "refresh_token.json";

/// The current access/refresh credential pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// Persisted shape of the refresh-token mirror file.
#[derive(Debug, Serialize, Deserialize)]
struct MirroredToken {
    refresh_token: String,
    saved_at: DateTime<Utc>,
}

pub struct TokenStore {
    tokens: RwLock<TokenPair>,
    /// Mirror file path; `None` under cookie transport or when no storage
    /// directory is configured.
    mirror: Option<PathBuf>,
    /// Bumped on every `clear`. A refresh exchange snapshots this before the
    /// network call and refuses to install tokens into a session that was
    /// logged out while it was in flight.
    generation: AtomicU64,
}

impl TokenStore {
    pub fn new(config: &Config) -> Self {
        let mirror = match config.transport {
            TransportMode::HeaderAndStorage => config
                .storage_dir
                .as_ref()
                .map(|dir| dir.join(MIRROR_FILE)),
            TransportMode::Cookie => None,
        };
        Self {
            tokens: RwLock::new(TokenPair::default()),
            mirror,
            generation: AtomicU64::new(0),
        }
    }

    /// Current credential pair.
    pub fn get(&self) -> TokenPair {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current access token, if any.
    pub fn access(&self) -> Option<String> {
        self.get().access
    }

    /// Current refresh token, if any.
    pub fn refresh_token(&self) -> Option<String> {
        self.get().refresh
    }

    /// Install a new credential pair. Synchronous: the pair is visible to
    /// the next outbound request before any async boundary. Mirror I/O
    /// failures are logged, never propagated.
    pub fn set(&self, access: impl Into<String>, refresh: impl Into<String>) {
        let pair = TokenPair {
            access: Some(access.into()),
            refresh: Some(refresh.into()),
        };
        {
            let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
            *tokens = pair.clone();
        }
        if let Some(refresh) = pair.refresh {
            if let Err(e) = self.write_mirror(&refresh) {
                warn!(err = %e, "failed to persist refresh token mirror");
            }
        }
    }

    /// Install a new credential pair only if no `clear` happened since the
    /// given generation snapshot. The check and the install share one write
    /// lock, so a logout can never be undone by a refresh that was already
    /// in flight. Returns whether the pair was installed.
    pub(crate) fn set_if_generation(
        &self,
        generation: u64,
        access: impl Into<String>,
        refresh: impl Into<String>,
    ) -> bool {
        let pair = TokenPair {
            access: Some(access.into()),
            refresh: Some(refresh.into()),
        };
        {
            let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *tokens = pair.clone();
        }
        if let Some(refresh) = pair.refresh {
            if let Err(e) = self.write_mirror(&refresh) {
                warn!(err = %e, "failed to persist refresh token mirror");
            }
        }
        true
    }

    /// Drop both credentials and the persistent mirror.
    pub fn clear(&self) {
        {
            let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
            *tokens = TokenPair::default();
            // Bumped under the same lock that guards installs, so
            // `set_if_generation` observes it consistently.
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = self.remove_mirror() {
            warn!(err = %e, "failed to remove refresh token mirror");
        }
    }

    /// Load the mirrored refresh token into the store, if one exists.
    /// Returns whether a token was found. Always `false` without a mirror
    /// (cookie transport).
    pub fn load_persisted(&self) -> Result<bool> {
        let Some(path) = &self.mirror else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let contents =
            std::fs::read_to_string(path).context("Failed to read refresh token mirror")?;
        let mirrored: MirroredToken =
            serde_json::from_str(&contents).context("Failed to parse refresh token mirror")?;
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.refresh = Some(mirrored.refresh_token);
        Ok(true)
    }

    /// Generation counter observed by the refresh coordinator.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn write_mirror(&self, refresh_token: &str) -> Result<()> {
        let Some(path) = &self.mirror else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mirrored = MirroredToken {
            refresh_token: refresh_token.to_string(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&mirrored)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn remove_mirror(&self) -> Result<()> {
        if let Some(path) = &self.mirror {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn header_config(dir: &std::path::Path) -> Config {
        Config::new("http://localhost:8000").with_storage_dir(dir)
    }

    #[test]
    fn test_set_get_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&header_config(dir.path()));

        assert_eq!(store.get(), TokenPair::default());

        store.set("a1", "r1");
        let pair = store.get();
        assert_eq!(pair.access.as_deref(), Some("a1"));
        assert_eq!(pair.refresh.as_deref(), Some("r1"));

        store.clear();
        assert_eq!(store.get(), TokenPair::default());
    }

    #[test]
    fn test_mirror_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = header_config(dir.path());

        let store = TokenStore::new(&config);
        store.set("a1", "r1");
        assert!(dir.path().join(MIRROR_FILE).exists());

        // A fresh store (new process) recovers only the refresh token.
        let reloaded = TokenStore::new(&config);
        assert!(reloaded.load_persisted().unwrap());
        let pair = reloaded.get();
        assert_eq!(pair.access, None);
        assert_eq!(pair.refresh.as_deref(), Some("r1"));
    }

    #[test]
    fn test_clear_removes_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&header_config(dir.path()));
        store.set("a1", "r1");
        store.clear();
        assert!(!dir.path().join(MIRROR_FILE).exists());
        assert!(!store.load_persisted().unwrap());
    }

    #[test]
    fn test_cookie_transport_never_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new("https://api.example.com").with_storage_dir(dir.path());
        let store = TokenStore::new(&config);
        store.set("a1", "r1");
        assert!(!dir.path().join(MIRROR_FILE).exists());
        assert!(!store.load_persisted().unwrap());
    }

    #[test]
    fn test_set_if_generation_rejects_stale_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&header_config(dir.path()));

        let snapshot = store.generation();
        assert!(store.set_if_generation(snapshot, "a1", "r1"));
        assert_eq!(store.get().access.as_deref(), Some("a1"));

        // A clear after the snapshot invalidates it: the install is refused
        // and the store stays empty.
        store.clear();
        assert!(!store.set_if_generation(snapshot, "a2", "r2"));
        assert_eq!(store.get(), TokenPair::default());
        assert!(!dir.path().join(MIRROR_FILE).exists());
    }

    #[test]
    fn test_clear_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&header_config(dir.path()));
        let before = store.generation();
        store.set("a1", "r1");
        assert_eq!(store.generation(), before);
        store.clear();
        assert_eq!(store.generation(), before + 1);
    }
}
