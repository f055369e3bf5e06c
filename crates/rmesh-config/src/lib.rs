// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmesh-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Persistent JSON configuration for the relay: overlay identities, service
//! targets, HTTP tuning, bridge tuning, and the service-assignment map. The
//! file is created with generated defaults on first run and atomically
//! rewritten whenever assignments change.

mod sentinel;

pub use sentinel::{DaemonSentinel, SentinelInfo};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and persistence.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Filesystem failure while reading or writing the config.
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not valid config JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),

    /// Serialization failure while persisting.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level persistent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Config schema version.
    #[serde(default = "default_schema")]
    pub schema: u32,
    /// Logical service name → base URL.
    #[serde(default = "default_targets")]
    pub targets: BTreeMap<String, String>,
    /// HTTP worker-pool tuning.
    #[serde(default)]
    pub http: HttpSettings,
    /// Overlay-bridge tuning shared by all identities.
    #[serde(default)]
    pub bridge: BridgeSettings,
    /// Relay identities.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Service name → identity name.
    #[serde(default)]
    pub service_assignments: BTreeMap<String, String>,
}

/// HTTP worker-pool tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSettings {
    /// Workers per identity.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum inline response body in bytes.
    #[serde(default = "default_max_body_b")]
    pub max_body_b: usize,
    /// Default TLS verification.
    #[serde(default = "default_true")]
    pub verify_default: bool,
    /// Raw read size for streaming bodies, in bytes.
    #[serde(default = "default_chunk_raw_b")]
    pub chunk_raw_b: usize,
    /// Heartbeat interval for quiet streams, in seconds.
    #[serde(default = "default_heartbeat_s")]
    pub heartbeat_s: f64,
    /// Maximum lines per streaming batch.
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,
    /// Maximum batch age before flush, in seconds.
    #[serde(default = "default_batch_latency")]
    pub batch_latency: f64,
    /// Transport-error retry attempts.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Initial retry backoff, in seconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    /// Retry backoff cap, in seconds.
    #[serde(default = "default_retry_cap")]
    pub retry_cap: f64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_body_b: default_max_body_b(),
            verify_default: true,
            chunk_raw_b: default_chunk_raw_b(),
            heartbeat_s: default_heartbeat_s(),
            batch_lines: default_batch_lines(),
            batch_latency: default_batch_latency(),
            retries: default_retries(),
            retry_backoff: default_retry_backoff(),
            retry_cap: default_retry_cap(),
        }
    }
}

/// Overlay-bridge tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    /// Sub-clients per identity.
    #[serde(default = "default_subclients")]
    pub num_subclients: u32,
    /// Comma-separated bootstrap websocket endpoints; empty for defaults.
    #[serde(default)]
    pub seed_ws: String,
    /// Self-probe interval in milliseconds.
    #[serde(default = "default_self_probe_ms")]
    pub self_probe_ms: u64,
    /// Consecutive probe failures before the bridge exits.
    #[serde(default = "default_self_probe_fails")]
    pub self_probe_fails: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            num_subclients: default_subclients(),
            seed_ws: String::new(),
            self_probe_ms: default_self_probe_ms(),
            self_probe_fails: default_self_probe_fails(),
        }
    }
}

/// One relay identity, plus optional per-identity overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeConfig {
    /// Stable identity name; filled with `relay-<n>` when absent.
    #[serde(default)]
    pub name: String,
    /// 64-hex private seed.
    pub seed_hex: String,
    /// Override for [`HttpSettings::workers`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Override for [`HttpSettings::max_body_b`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_b: Option<usize>,
    /// Override for [`HttpSettings::verify_default`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_default: Option<bool>,
    /// Extra targets merged over the global map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, String>,
    /// Override for [`BridgeSettings::num_subclients`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_subclients: Option<u32>,
    /// Override for [`BridgeSettings::seed_ws`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_ws: Option<String>,
    /// Override for [`BridgeSettings::self_probe_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_probe_ms: Option<u64>,
    /// Override for [`BridgeSettings::self_probe_fails`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_probe_fails: Option<u32>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_schema() -> u32 {
    1
}

fn default_targets() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ollama".to_string(), "http://127.0.0.1:11434".to_string()),
        ("asr".to_string(), "http://127.0.0.1:8126".to_string()),
        ("tts".to_string(), "http://127.0.0.1:8123".to_string()),
    ])
}

fn default_workers() -> usize {
    4
}

fn default_max_body_b() -> usize {
    2 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_chunk_raw_b() -> usize {
    12 * 1024
}

fn default_heartbeat_s() -> f64 {
    10.0
}

fn default_batch_lines() -> usize {
    24
}

fn default_batch_latency() -> f64 {
    0.08
}

fn default_retries() -> u32 {
    4
}

fn default_retry_backoff() -> f64 {
    0.5
}

fn default_retry_cap() -> f64 {
    4.0
}

fn default_subclients() -> u32 {
    2
}

fn default_self_probe_ms() -> u64 {
    12_000
}

fn default_self_probe_fails() -> u32 {
    3
}

impl Default for RelayConfig {
    /// Defaults for a fresh install: three identities with generated seeds
    /// and the stock service assignment.
    fn default() -> Self {
        let nodes: Vec<NodeConfig> = (0..3)
            .map(|i| NodeConfig {
                name: format!("relay-{}", (b'A' + i) as char),
                seed_hex: generate_seed(),
                ..NodeConfig::default()
            })
            .collect();
        let service_assignments = BTreeMap::from([
            ("piper_tts".to_string(), "relay-A".to_string()),
            ("whisper_asr".to_string(), "relay-B".to_string()),
            ("ollama_farm".to_string(), "relay-C".to_string()),
        ]);
        Self {
            schema: default_schema(),
            targets: default_targets(),
            http: HttpSettings::default(),
            bridge: BridgeSettings::default(),
            nodes,
            service_assignments,
        }
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// Generate a fresh 64-hex identity seed.
pub fn generate_seed() -> String {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    hex::encode(bytes)
}

/// Normalize a seed: lowercase, `0x` prefix stripped.
pub fn normalize_seed(seed: &str) -> String {
    seed.trim()
        .to_ascii_lowercase()
        .trim_start_matches("0x")
        .to_string()
}

/// Whether a (normalized) seed is 64 hex characters.
pub fn seed_is_valid(seed: &str) -> bool {
    let s = normalize_seed(seed);
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Loading and persistence
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Load the config from `path`, creating it with defaults when missing.
    ///
    /// Absent sections fall back to their defaults on parse, and unnamed
    /// nodes are assigned `relay-<index+1>` names so the assignment map
    /// always has something to refer to.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let cfg = RelayConfig::default();
            cfg.save_atomic(path)?;
            return Ok(cfg);
        }
        let content = std::fs::read_to_string(path)?;
        let mut cfg: RelayConfig =
            serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        cfg.fill_node_names();
        Ok(cfg)
    }

    /// Write the config atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Give every unnamed node a `relay-<index+1>` name.
    pub fn fill_node_names(&mut self) {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if node.name.trim().is_empty() {
                node.name = format!("relay-{}", idx + 1);
            }
        }
    }

    /// Names of all configured identities, in declaration order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// The effective target map for one identity: node overrides merged over
    /// the global table.
    pub fn targets_for(&self, node: &NodeConfig) -> BTreeMap<String, String> {
        let mut targets = self.targets.clone();
        targets.extend(node.targets.clone());
        targets
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
