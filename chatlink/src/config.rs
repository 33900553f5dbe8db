//! Configuration system for the `ChatLink` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::store::{DEFAULT_MAX_RECONNECT_ATTEMPTS, StoreConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A configured URL does not parse.
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        /// The offending value.
        url: String,
        /// Underlying parse error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    api_base_url: Option<String>,
    ws_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    event_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Command-line arguments for the `chatlink` binary.
#[derive(Debug, Default, clap::Parser)]
#[command(name = "chatlink", about = "Live-conversation chat client")]
pub struct CliArgs {
    /// Remote participant to open a conversation with.
    pub peer: Option<String>,

    /// Path to a TOML config file (default: ~/.config/chatlink/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the HTTP API.
    #[arg(long, env = "CHATLINK_API_URL")]
    pub api_url: Option<String>,

    /// Base URL of the WebSocket endpoint.
    #[arg(long, env = "CHATLINK_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer access token (owned by the auth collaborator).
    #[arg(long, env = "CHATLINK_TOKEN")]
    pub token: Option<String>,

    /// Ceiling on consecutive reconnect attempts.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Log level filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Default HTTP API base.
const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

/// Default WebSocket base.
const DEFAULT_WS_BASE: &str = "ws://127.0.0.1:8000";

/// Default history request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for request/response calls (history endpoint).
    pub api_base_url: Url,
    /// Base URL the live-channel connect URL is composed from.
    pub ws_base_url: Url,
    /// Timeout for one history request.
    pub request_timeout: Duration,
    /// Timeout for establishing the live channel.
    pub connect_timeout: Duration,
    /// Ceiling on consecutive reconnect attempts.
    pub max_reconnect_attempts: u32,
    /// Capacity of the store event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    // Compiled-in defaults are known-good literals.
    #[allow(clippy::unwrap_used)]
    fn default() -> Self {
        Self {
            api_base_url: Url::parse(DEFAULT_API_BASE).unwrap(),
            ws_base_url: Url::parse(DEFAULT_WS_BASE).unwrap(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: crate::transport::CONNECT_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Loads and resolves configuration: CLI > config file > defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an explicitly given config file is
    /// unreadable, the TOML does not parse, or a URL is malformed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => Some(read_config_file(path)?),
            None => default_config_path()
                .filter(|p| p.exists())
                .map(|p| read_config_file(&p))
                .transpose()?,
        };
        Self::resolve(cli, file.unwrap_or_default())
    }

    fn resolve(cli: &CliArgs, file: ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = match cli.api_url.clone().or(file.api.api_base_url) {
            Some(raw) => parse_url(&raw)?,
            None => defaults.api_base_url,
        };
        let ws_base_url = match cli.ws_url.clone().or(file.api.ws_base_url) {
            Some(raw) => parse_url(&raw)?,
            None => defaults.ws_base_url,
        };

        Ok(Self {
            api_base_url,
            ws_base_url,
            request_timeout: file
                .api
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            connect_timeout: file
                .api
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            max_reconnect_attempts: cli
                .max_reconnect_attempts
                .or(file.reconnect.max_attempts)
                .unwrap_or(defaults.max_reconnect_attempts),
            event_capacity: file
                .api
                .event_capacity
                .unwrap_or(defaults.event_capacity),
        })
    }

    /// Derives the store configuration from the resolved settings.
    #[must_use]
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            ws_base_url: self.ws_base_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            event_capacity: self.event_capacity,
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

/// Default config file location: `~/.config/chatlink/config.toml`.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatlink").join("config.toml"))
}
