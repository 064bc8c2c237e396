//! Console configuration and persisted preferences.
//!
//! `ConsoleConfig` is built from defaults or the environment (`BAO_ADDR`).
//! Preferences (last auth method, last namespace) are stored at
//! `~/.config/bao-console/preferences.json`; the encrypted session lives in
//! `~/.cache/bao-console/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::transport::REQUEST_TIMEOUT_SECS;
use crate::cache::DEFAULT_STALE_TIME;
use crate::health::DEFAULT_POLL_INTERVAL;
use crate::routing::RouteTable;
use crate::session::DEFAULT_EXPIRY_BUFFER;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "bao-console";

/// Preferences file name
const PREFERENCES_FILE: &str = "preferences.json";

pub const DEFAULT_BAO_ADDR: &str = "http://localhost:8200/v1";

/// Environment variable naming the server address.
pub const ADDR_ENV: &str = "BAO_ADDR";

/// Append `/v1` unless the address already ends with it.
pub fn normalize_bao_addr(addr: &str) -> String {
    let trimmed = addr.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// API base including `/v1`.
    pub base_url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub expiry_buffer: Duration,
    pub stale_time: Duration,
    pub routes: RouteTable,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BAO_ADDR.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            stale_time: DEFAULT_STALE_TIME,
            routes: RouteTable::default(),
        }
    }
}

impl ConsoleConfig {
    /// Defaults overridden by `BAO_ADDR` when set and non-empty.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(ADDR_ENV) {
            if !addr.trim().is_empty() {
                config.base_url = normalize_bao_addr(&addr);
            }
        }
        config
    }

    pub fn with_base_url(mut self, addr: &str) -> Self {
        self.base_url = normalize_bao_addr(addr);
        self
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME))
    }

    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

// ============================================================================
// Preferences
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Preferences {
    /// `type:path` value of the last successful login method.
    pub last_auth_method: Option<String>,
    /// Absent for root.
    pub last_namespace: Option<String>,
}

impl Preferences {
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Shared handle to the preferences, written through to disk on update.
#[derive(Clone)]
pub struct PreferenceStore {
    prefs: Arc<Mutex<Preferences>>,
    path: Option<Arc<PathBuf>>,
}

impl PreferenceStore {
    /// Preferences at the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(ConsoleConfig::config_dir()?.join(PREFERENCES_FILE))
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let prefs = Preferences::load_from(&path)?;
        Ok(Self {
            prefs: Arc::new(Mutex::new(prefs)),
            path: Some(Arc::new(path)),
        })
    }

    /// Preferences that are never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            prefs: Arc::new(Mutex::new(Preferences::default())),
            path: None,
        }
    }

    pub fn get(&self) -> Preferences {
        self.prefs.lock().clone()
    }

    /// Apply `f` and persist. A failed write is logged; the in-memory value
    /// is updated regardless.
    pub fn update(&self, f: impl FnOnce(&mut Preferences)) {
        let snapshot = {
            let mut prefs = self.prefs.lock();
            f(&mut prefs);
            prefs.clone()
        };
        if let Some(path) = &self.path {
            if let Err(e) = snapshot.save_to(path) {
                error!(error = %e, path = %path.display(), "Failed to save preferences");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bao_addr() {
        assert_eq!(normalize_bao_addr("http://bao:8200"), "http://bao:8200/v1");
        assert_eq!(normalize_bao_addr("http://bao:8200/"), "http://bao:8200/v1");
        assert_eq!(normalize_bao_addr("https://bao/v1/"), "https://bao/v1");
    }

    #[test]
    fn test_defaults() {
        let config = ConsoleConfig::default();
        assert_eq!(config.base_url, DEFAULT_BAO_ADDR);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.expiry_buffer, Duration::from_secs(300));
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.routes.login, "/login");
    }

    #[test]
    fn test_preferences_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(PREFERENCES_FILE);

        let store = PreferenceStore::open(path.clone()).unwrap();
        assert_eq!(store.get(), Preferences::default());
        store.update(|p| p.last_namespace = Some("team-a".to_string()));

        let reopened = PreferenceStore::open(path).unwrap();
        assert_eq!(reopened.get().last_namespace.as_deref(), Some("team-a"));
    }
}
