//! Server configuration loading from file and environment variables.

use relay_types::{Agent, AudioEncoding, AudioFormat};
use relay_voice::{DeepgramConfig, OpenAiConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Audio format spoken with callers and the aggregation frame size.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Per-session behavior.
    #[serde(default)]
    pub session: SessionConfig,

    /// External provider credentials and endpoints.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Agents upserted into the database at start-up.
    #[serde(default)]
    pub agents: Vec<Agent>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "relay_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub encoding: AudioEncoding,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Duration of audio aggregated into one frame before it is sent for
    /// transcription.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,

    /// Cap on audio queued while the transcription handshake is pending.
    #[serde(default = "default_max_backlog_bytes")]
    pub max_backlog_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Prior messages included in each generation prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Bound on each reply generation and each speech synthesis call.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Inactivity after which a connection is closed. Zero disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Spoken when reply generation fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    /// Mirror provider diagnostics to the client as `log` events.
    #[serde(default)]
    pub client_diagnostics: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub deepgram: DeepgramConfig,

    #[serde(default)]
    pub openai: OpenAiConfig,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "relay.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> u32 {
    8_000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_ms() -> u64 {
    100
}

fn default_max_backlog_bytes() -> usize {
    480_000
}

fn default_history_limit() -> usize {
    10
}

fn default_response_timeout_secs() -> u64 {
    20
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_fallback_reply() -> String {
    "I'm having trouble processing your request. Could you please repeat that?".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::default(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_ms: default_frame_ms(),
            max_backlog_bytes: default_max_backlog_bytes(),
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            encoding: self.encoding,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            response_timeout_secs: default_response_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            fallback_reply: default_fallback_reply(),
            client_diagnostics: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `RELAY_HOST` overrides `server.host`
/// - `RELAY_PORT` overrides `server.port`
/// - `RELAY_DB_PATH` overrides `database.path`
/// - `RELAY_LOG_LEVEL` overrides `logging.level`
/// - `RELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `DEEPGRAM_API_KEY` overrides `providers.deepgram.api_key`
/// - `OPENAI_API_KEY` overrides `providers.openai.api_key`
/// - `RELAY_OPENAI_MODEL` overrides `providers.openai.model`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("RELAY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("RELAY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("RELAY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("RELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("RELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(key) = var("DEEPGRAM_API_KEY").filter(|k| !k.trim().is_empty()) {
        config.providers.deepgram.api_key = key;
    }
    if let Some(key) = var("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
        config.providers.openai.api_key = key;
    }
    if let Some(model) = var("RELAY_OPENAI_MODEL").filter(|m| !m.trim().is_empty()) {
        config.providers.openai.model = model;
    }
}
