//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.smsgw/config.json`) and environment.
//! Channels are declared per kind (modems, email providers, API providers); every
//! channel name must be unique across kinds since rules address channels by name.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level gateway config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when RUST_LOG is not set (e.g. "info", "debug").
    #[serde(default)]
    pub log_level: Option<String>,

    /// Status HTTP server settings.
    #[serde(default)]
    pub status: StatusConfig,

    /// Outbound retry policy shared by every channel.
    #[serde(default)]
    pub retry_settings: RetrySettings,

    /// How long completed inbound messages are kept in memory.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Concatenated SMS reassembly settings.
    #[serde(default)]
    pub multipart: MultipartConfig,

    #[serde(default)]
    pub modems: Vec<ModemConfig>,

    #[serde(default)]
    pub email_providers: Vec<EmailProviderConfig>,

    #[serde(default)]
    pub api_providers: Vec<ApiProviderConfig>,

    /// Ordered rule list; every rule is evaluated for every complete message.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Status server bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_status_bind")]
    pub bind: String,

    /// Port (default 15152).
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_status_bind(),
            port: default_status_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    15152
}

/// Retry settings: attempt N (0-indexed) waits `initial_delay_seconds * 2^N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay", alias = "initial_delay")]
    pub initial_delay_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_seconds: default_initial_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub sms_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sms_retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    7
}

/// Multipart reassembly: `timeout_minutes = 0` selects immediate mode
/// (every fragment is delivered on its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartConfig {
    #[serde(default = "default_multipart_timeout")]
    pub timeout_minutes: u64,

    /// How often stalled assemblies are checked (default 60s).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_multipart_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_multipart_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

/// One cellular modem: both an inbound source and an outbound SMS channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    pub name: String,
    /// Serial device (e.g. "/dev/ttyUSB0").
    pub port: String,
    pub baudrate: u32,
    /// SIM PIN, sent only when the SIM asks for it.
    #[serde(default)]
    pub pin: Option<String>,
    /// Attempts to find network coverage before a send is reported as failed.
    #[serde(default = "default_network_retries")]
    pub network_retries: u32,
    #[serde(default = "default_coverage_timeout")]
    pub coverage_timeout_seconds: u64,
}

fn default_network_retries() -> u32 {
    3
}

fn default_coverage_timeout() -> u64 {
    30
}

/// SMTP account used as an outbound email channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailProviderConfig {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Name of an environment variable holding the password. Overrides `password` when set.
    #[serde(default)]
    pub password_env: Option<String>,
    /// From address.
    pub sender: String,
    #[serde(default)]
    pub subject: Option<String>,
    /// When false, the SMTP connection is dropped after every job.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// HTTP endpoint used as an outbound API channel. `endpoint`, string header values and
/// string payload values may contain `{sender}`, `{timestamp}` and `{message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProviderConfig {
    pub name: String,
    #[serde(default = "default_api_method")]
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Request timeout in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
}

fn default_api_method() -> String {
    "POST".to_string()
}

fn default_api_timeout() -> u64 {
    10
}

/// One routing rule. `queue` and `destination` distinguish "absent" (defaults apply)
/// from an explicit empty list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_rule_name")]
    pub name: String,
    /// Allowed senders; empty matches any sender.
    #[serde(default)]
    pub sender: Vec<String>,
    /// Substrings, matched case-insensitively; empty matches any text.
    #[serde(default)]
    pub content: Vec<String>,
    /// Message template. Accepts a string or a list (first element is used).
    #[serde(default, deserialize_with = "one_or_first")]
    pub message: Option<String>,
    /// "reply" or "forward". Accepts a string or a list (first element is used).
    #[serde(default, deserialize_with = "one_or_first")]
    pub action: Option<String>,
    /// Target channel names.
    #[serde(default)]
    pub queue: Option<Vec<String>>,
    /// Explicit destinations for forward rules.
    #[serde(default)]
    pub destination: Option<Vec<String>>,
}

fn default_rule_name() -> String {
    "unnamed_rule".to_string()
}

/// Accept `"x"`, `["x", ...]` or null for a single optional string.
fn one_or_first<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    let value: Option<OneOrMany> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(OneOrMany::One(s)) => Some(s),
        Some(OneOrMany::Many(v)) => v.into_iter().next(),
        None => None,
    })
}

/// Config validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate channel name: {0}")]
    DuplicateChannel(String),
    #[error("channel {channel}: {reason}")]
    Invalid { channel: String, reason: String },
}

impl ConfigError {
    fn invalid(channel: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

impl Config {
    /// Check config-wide invariants. Per-channel problems are reported by each
    /// channel's `check` at start so one bad channel does not stop the others.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in self.channel_names() {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(name, "channel name is empty"));
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateChannel(name.to_string()));
            }
        }
        Ok(())
    }

    /// All configured channel names, modems first.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.modems
            .iter()
            .map(|m| m.name.as_str())
            .chain(self.email_providers.iter().map(|e| e.name.as_str()))
            .chain(self.api_providers.iter().map(|a| a.name.as_str()))
    }
}

impl ModemConfig {
    pub fn check(&self) -> std::result::Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "port is empty"));
        }
        if self.baudrate == 0 {
            return Err(ConfigError::invalid(&self.name, "baudrate must be positive"));
        }
        Ok(())
    }
}

impl EmailProviderConfig {
    pub fn check(&self) -> std::result::Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "server is empty"));
        }
        if self.sender.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "sender is empty"));
        }
        Ok(())
    }
}

impl ApiProviderConfig {
    pub fn check(&self) -> std::result::Result<(), ConfigError> {
        let method = self.method.trim().to_ascii_uppercase();
        if !matches!(method.as_str(), "GET" | "POST" | "PUT") {
            return Err(ConfigError::invalid(
                &self.name,
                format!("unsupported method {}", self.method),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "endpoint is empty"));
        }
        Ok(())
    }
}

/// Resolve an email provider's password: the `password_env` variable overrides config.
pub fn resolve_email_password(provider: &EmailProviderConfig) -> Option<String> {
    provider
        .password_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| provider.password.clone().filter(|s| !s.is_empty()))
}

/// Log filter from config when RUST_LOG is not set (default "info").
pub fn resolve_log_filter(config: &Config) -> String {
    config
        .log_level
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SMSGW_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".smsgw").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    log::debug!(
        "loaded config: {} modem(s), {} email provider(s), {} api provider(s), {} rule(s)",
        config.modems.len(),
        config.email_providers.len(),
        config.api_providers.len(),
        config.rules.len()
    );
    Ok((config, path))
}

/// Parse and validate a config document.
pub fn parse_config(s: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(s)?;
    config.validate()?;
    Ok(config)
}
