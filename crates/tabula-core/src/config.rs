//! Configuration resolution for Tabula.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tabula/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial: they are merged key-by-key over the layer below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Tabula configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            log_level: "info".to_string(),
        }
    }
}

/// Inference service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    pub options: GenerationOptions,
    /// Time allowed for the upstream to answer with a response status.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "deepseek-r1:1.5b".to_string(),
            options: GenerationOptions::default(),
            connect_timeout_secs: 45,
        }
    }
}

impl UpstreamConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Sampling options forwarded verbatim in the generate request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub num_thread: u32,
    pub repeat_penalty: f32,
    pub top_k: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            num_thread: 4,
            repeat_penalty: 1.2,
            top_k: 40,
        }
    }
}

/// Per-connection relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Silence window before the watchdog fires (seconds).
    pub watchdog_secs: u64,
    /// Hard cap on the partial-record buffer (bytes).
    pub max_buffer_bytes: usize,
    /// How long queued frames may take to flush after termination (milliseconds).
    pub flush_grace_ms: u64,
    /// Frames the transport holds before it counts as saturated.
    pub transport_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            watchdog_secs: 45,
            max_buffer_bytes: 1024 * 1024, // 1 MiB
            flush_grace_ms: 1000,
            transport_capacity: 32,
        }
    }
}

impl RelayConfig {
    pub const fn watchdog_window(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub const fn flush_grace(&self) -> Duration {
        Duration::from_millis(self.flush_grace_ms)
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of an unattached session (seconds).
    pub ttl_secs: u64,
    /// Refuse new sessions while the upstream health check fails.
    pub require_upstream: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600, // 10 minutes
            require_upstream: true,
        }
    }
}

impl SessionConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tabula").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tabula/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tabula").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`. Objects merge per key, any
/// other value replaces what was there.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `TABULA_*` overrides. Values that fail to parse are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("TABULA_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
        config.server.listen_addr = addr;
    }
    if let Some(val) = lookup("TABULA_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("TABULA_UPSTREAM_URL") {
        config.upstream.base_url = val;
    }
    if let Some(val) = lookup("TABULA_MODEL") {
        config.upstream.model = val;
    }
    if let Some(n) = lookup("TABULA_WATCHDOG_SECS").and_then(|v| v.parse().ok()) {
        config.relay.watchdog_secs = n;
    }
    if let Some(n) = lookup("TABULA_SESSION_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.sessions.ttl_secs = n;
    }
}
