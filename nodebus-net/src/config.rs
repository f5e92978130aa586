//! Daemon configuration: TOML file plus environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nodebus_core::{EntryRecord, Timing};
use serde::Deserialize;

/// File: `--config`, then $NODEBUS_CONFIG, then ~/.config/nodebus/config.toml or /etc/nodebus/config.toml.
/// Env overrides: NODEBUS_NODE_ID, NODEBUS_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's identity (default 1).
    #[serde(default = "default_node_id")]
    pub node_id: u32,
    /// Poll period in milliseconds (default 100).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Log a peer status summary every this many seconds; 0 disables it (default 30).
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
    #[serde(default)]
    pub timing: TimingConfig,
    /// One record per (network, node); see `[[entries]]` in the sample config.
    #[serde(default)]
    pub entries: Vec<EntryRecord>,
}

fn default_node_id() -> u32 {
    1
}
fn default_tick_ms() -> u64 {
    100
}
fn default_status_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            tick_ms: default_tick_ms(),
            status_secs: default_status_secs(),
            timing: TimingConfig::default(),
            entries: Vec::new(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// `[timing]` table. Every field is optional.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimingConfig {
    pub reconnect_cooldown_secs: u64,
    pub connect_timeout_ms: u64,
    pub peer_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub announce_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let t = Timing::default();
        Self {
            reconnect_cooldown_secs: t.reconnect_cooldown.as_secs(),
            connect_timeout_ms: u64::try_from(t.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            peer_timeout_secs: t.peer_timeout.as_secs(),
            heartbeat_secs: t.heartbeat_interval.as_secs(),
            announce_secs: t.announce_interval.as_secs(),
        }
    }
}

impl From<TimingConfig> for Timing {
    fn from(c: TimingConfig) -> Self {
        Timing {
            reconnect_cooldown: Duration::from_secs(c.reconnect_cooldown_secs),
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            peer_timeout: Duration::from_secs(c.peer_timeout_secs),
            heartbeat_interval: Duration::from_secs(c.heartbeat_secs),
            announce_interval: Duration::from_secs(c.announce_secs),
        }
    }
}

/// Load config: default, then config file (if one is found), then env vars.
/// An explicitly named file must exist and parse; a discovered one must parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match find_file(explicit) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_overrides(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse(text: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(text)?)
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn find_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os("NODEBUS_CONFIG") {
        return Some(PathBuf::from(p));
    }
    config_paths().into_iter().find(|p| p.exists())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nodebus/config.toml"));
    }
    out.push(PathBuf::from("/etc/nodebus/config.toml"));
    out
}

// Unparseable values are ignored and the file/default value stands.
fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(id) = var("NODEBUS_NODE_ID").and_then(|s| s.parse().ok()) {
        c.node_id = id;
    }
    if let Some(ms) = var("NODEBUS_TICK_MS").and_then(|s| s.parse().ok()) {
        c.tick_ms = ms;
    }
}
