//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.ohtab/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Remote conversation service settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Realtime channel settings (socket path, reconnection budget, timeouts).
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Controller settings.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where the agent service lives and what new conversations are created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Base URL for HTTP calls and the realtime channel (default "http://127.0.0.1:3000"). Overridden by OHTAB_BASE_URL env.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Optional repository sent with every conversation creation request.
    #[serde(default)]
    pub repository: Option<String>,
}

/// Realtime channel tuning. Both the attempt count and the timeout are finite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Socket.IO endpoint path (default "/socket.io").
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Connection attempts the transport makes on its own before reporting a connect failure (default 5).
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,

    /// Timeout for one connection attempt, handshake included (default 20000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First delay between attempts; doubles per attempt (default 1000 ms).
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,

    /// Upper bound for the delay between attempts (default 5000 ms).
    #[serde(default = "default_reconnection_delay_max_ms")]
    pub reconnection_delay_max_ms: u64,
}

/// Controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// How many prompts may wait for the channel to connect (default 8, at least 1).
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_socket_path() -> String {
    "/socket.io".to_string()
}

fn default_reconnection_attempts() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_reconnection_delay_ms() -> u64 {
    1_000
}

fn default_reconnection_delay_max_ms() -> u64 {
    5_000
}

fn default_pending_capacity() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            repository: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            reconnection_attempts: default_reconnection_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            reconnection_delay_max_ms: default_reconnection_delay_max_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pending_capacity: default_pending_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Delay before attempt number `attempt` (1-based): exponential, capped at the configured maximum.
    pub fn reconnection_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .reconnection_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnection_delay_max_ms.max(self.reconnection_delay_ms));
        Duration::from_millis(ms)
    }
}

impl ClientConfig {
    /// Pending capacity clamped to at least one slot.
    pub fn pending_capacity(&self) -> usize {
        self.pending_capacity.max(1)
    }
}

/// Resolve the service base URL: env OHTAB_BASE_URL overrides config. Trailing slashes are trimmed.
pub fn resolve_base_url(config: &Config) -> String {
    std::env::var("OHTAB_BASE_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .unwrap_or_else(|| config.server.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("OHTAB_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".ohtab").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, OHTAB_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
