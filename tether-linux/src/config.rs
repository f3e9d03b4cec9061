//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tether_core::{CoreConfig, DeviceType};

/// Daemon configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_DISCOVERY_PORT, TETHER_TRANSPORT_PORT, TETHER_DEVICE_NAME, TETHER_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced to peers (default: host name).
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// One of desktop, laptop, smartphone, tablet, tv (default desktop).
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Discovery UDP port (default 1716).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// LAN transport TCP port (default 1716).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Seconds an unanswered pairing request stays open (default 30).
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
    /// Tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Identity key and trusted devices live here (default ~/.local/state/tether).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_device_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "tether".into())
}
fn default_device_type() -> String {
    "desktop".into()
}
fn default_discovery_port() -> u16 {
    1716
}
fn default_transport_port() -> u16 {
    1716
}
fn default_pairing_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
fn default_state_dir() -> PathBuf {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(state).join("tether");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/state/tether"),
        None => PathBuf::from("/var/lib/tether"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_type: default_device_type(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            log_level: default_log_level(),
            state_dir: default_state_dir(),
        }
    }
}

impl Config {
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            device_name: self.device_name.clone(),
            device_type: DeviceType::from(self.device_type.as_str()),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            ..CoreConfig::default()
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("identity.key")
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.state_dir.join("trusted_devices.toml")
    }
}

/// Load config: merge default, then the first config file found, then env vars. A config
/// file that cannot be read or parsed is an error, not a fallback to defaults.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_first(&config_paths())?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("TETHER_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("TETHER_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(name) = var("TETHER_DEVICE_NAME").filter(|s| !s.trim().is_empty()) {
        c.device_name = name;
    }
    if let Some(level) = var("TETHER_LOG").filter(|s| !s.is_empty()) {
        c.log_level = level;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_first(paths: &[PathBuf]) -> anyhow::Result<Option<Config>> {
    match paths.iter().find(|p| p.exists()) {
        Some(p) => read_config(p).map(Some),
        None => Ok(None),
    }
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
