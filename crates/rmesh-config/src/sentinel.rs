// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sentinel file that signals daemon intent to an external supervisor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::ConfigError;

/// Contents of the daemon sentinel file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentinelInfo {
    /// Always `true` while the sentinel exists.
    pub enabled: bool,
    /// Epoch seconds at creation.
    pub ts: i64,
    /// Relay base directory.
    pub base_dir: String,
    /// Path of the config file in use.
    pub config: String,
    /// Path of the sentinel itself.
    pub path: String,
    /// Free-form note for operators.
    pub note: String,
}

/// Sentinel-based daemon tracker.
///
/// Creating the file signals intent to an external supervisor; removing it
/// signals stop. The relay never acts on the sentinel itself.
#[derive(Debug, Clone)]
pub struct DaemonSentinel {
    path: PathBuf,
}

impl DaemonSentinel {
    /// Track the sentinel at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The conventional location: `$HOME/.relay_mesh_daemon.json`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".relay_mesh_daemon.json")
    }

    /// The sentinel path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the sentinel, if present. Unreadable contents still count as an
    /// enabled daemon; the info then only carries the path.
    pub fn check(&self) -> Option<SentinelInfo> {
        if !self.path.exists() {
            return None;
        }
        let fallback = SentinelInfo {
            enabled: true,
            ts: 0,
            base_dir: String::new(),
            config: String::new(),
            path: self.path.display().to_string(),
            note: "unreadable sentinel".to_string(),
        };
        match std::fs::read_to_string(&self.path) {
            Ok(body) => serde_json::from_str(&body).unwrap_or(fallback).into(),
            Err(_) => Some(fallback),
        }
    }

    /// Create (or refresh) the sentinel.
    pub fn enable(&self, base_dir: &Path, config_path: &Path) -> Result<SentinelInfo, ConfigError> {
        let info = SentinelInfo {
            enabled: true,
            ts: chrono::Utc::now().timestamp(),
            base_dir: base_dir.display().to_string(),
            config: config_path.display().to_string(),
            path: self.path.display().to_string(),
            note: "Sentinel for external daemon integration.".to_string(),
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&info).map_err(ConfigError::Serialize)?;
        std::fs::write(&self.path, body)?;
        Ok(info)
    }

    /// Remove the sentinel if it exists.
    pub fn disable(&self) -> Result<(), ConfigError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_check_disable_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = DaemonSentinel::new(dir.path().join("daemon.json"));
        assert!(sentinel.check().is_none());

        let info = sentinel
            .enable(Path::new("/base"), Path::new("/base/cfg.json"))
            .unwrap();
        assert!(info.enabled);
        assert_eq!(info.base_dir, "/base");

        let read = sentinel.check().expect("sentinel should exist");
        assert_eq!(read, info);

        sentinel.disable().unwrap();
        assert!(sentinel.check().is_none());
        // Disabling twice is fine.
        sentinel.disable().unwrap();
    }

    #[test]
    fn unreadable_sentinel_still_reports_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, "garbage").unwrap();
        let sentinel = DaemonSentinel::new(&path);
        let info = sentinel.check().expect("should report enabled");
        assert!(info.enabled);
        assert_eq!(info.note, "unreadable sentinel");
    }
}
