//! Configuration system for the `DevConnect` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/devconnect/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use devconnect_proto::message::UserId;

use crate::chat::SessionConfig;
use crate::chat::message::Participant;
use crate::chat::socket::ReconnectConfig;

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

    /// A value required to open a chat is missing.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    reconnect: ReconnectFileConfig,
    ui: UiFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    api_url: Option<String>,
    socket_url: Option<String>,
    ws_path: Option<String>,
    poll_path: Option<String>,
    auth_token: Option<String>,
    user_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    peer: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    poll_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    echo_tolerance_ms: Option<u64>,
    ack_timeout_secs: Option<u64>,
    confirm_on_transmit: Option<bool>,
    max_message_len: Option<usize>,
    event_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Base URL of the REST API (history, chat list, long-polling).
    pub api_url: String,
    /// Base URL of the socket server; derived from `api_url` when unset.
    pub socket_url: Option<String>,
    /// WebSocket endpoint path.
    pub ws_path: String,
    /// Long-polling endpoint path.
    pub poll_path: String,
    /// Session token sent as the `token` cookie.
    pub auth_token: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Local user's first name.
    pub first_name: Option<String>,
    /// Local user's last name.
    pub last_name: Option<String>,
    /// User id of the peer to chat with.
    pub peer: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for one REST request.
    pub request_timeout: Duration,
    /// How long the server may hold a long-poll open.
    pub poll_timeout: Duration,

    // -- Chat --
    /// Window for matching echoes to local messages by content.
    pub echo_tolerance: Duration,
    /// Time a sent message may stay pending before it is marked failed.
    pub ack_timeout: Duration,
    /// Treat a successful transmit as delivery confirmation.
    pub confirm_on_transmit: bool,
    /// Maximum message length in characters.
    pub max_message_len: Option<usize>,
    /// Buffer size for the session event channel.
    pub event_buffer: usize,

    // -- Reconnect --
    /// Reconnect backoff policy.
    pub reconnect: ReconnectConfig,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:7000".to_string(),
            socket_url: None,
            ws_path: "/socket/ws".to_string(),
            poll_path: "/socket/poll".to_string(),
            auth_token: None,
            user_id: None,
            first_name: None,
            last_name: None,
            peer: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            poll_timeout: Duration::from_secs(25),
            echo_tolerance: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            confirm_on_transmit: false,
            max_message_len: Some(500),
            event_buffer: 256,
            reconnect: ReconnectConfig::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/devconnect/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;

        Self {
            api_url: cli
                .api_url
                .clone()
                .or_else(|| net.api_url.clone())
                .unwrap_or(defaults.api_url),
            socket_url: cli.socket_url.clone().or_else(|| net.socket_url.clone()),
            ws_path: net.ws_path.clone().unwrap_or(defaults.ws_path),
            poll_path: net.poll_path.clone().unwrap_or(defaults.poll_path),
            auth_token: cli.token.clone().or_else(|| net.auth_token.clone()),
            user_id: cli.user_id.clone().or_else(|| net.user_id.clone()),
            first_name: cli.first_name.clone().or_else(|| net.first_name.clone()),
            last_name: cli.last_name.clone().or_else(|| net.last_name.clone()),
            peer: cli.peer.clone().or_else(|| net.peer.clone()),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: net
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            poll_timeout: net
                .poll_timeout_secs
                .map_or(defaults.poll_timeout, Duration::from_secs),
            echo_tolerance: file
                .chat
                .echo_tolerance_ms
                .map_or(defaults.echo_tolerance, Duration::from_millis),
            ack_timeout: file
                .chat
                .ack_timeout_secs
                .map_or(defaults.ack_timeout, Duration::from_secs),
            confirm_on_transmit: file
                .chat
                .confirm_on_transmit
                .unwrap_or(defaults.confirm_on_transmit),
            max_message_len: file.chat.max_message_len.or(defaults.max_message_len),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .or(defaults.reconnect.max_attempts),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Full WebSocket endpoint URL.
    ///
    /// Uses `socket_url` when set, otherwise `api_url` with its scheme
    /// switched to `ws`/`wss`.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        let base = self.socket_url.clone().unwrap_or_else(|| {
            if let Some(rest) = self.api_url.strip_prefix("https://") {
                format!("wss://{rest}")
            } else if let Some(rest) = self.api_url.strip_prefix("http://") {
                format!("ws://{rest}")
            } else {
                self.api_url.clone()
            }
        });
        format!("{}{}", base.trim_end_matches('/'), self.ws_path)
    }

    /// The local participant, if a user id is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no user id is set.
    pub fn local_participant(&self) -> Result<Participant, ConfigError> {
        let id = self
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::Missing("user_id"))?;
        Ok(Participant::new(id).with_name(self.first_name.clone(), self.last_name.clone()))
    }

    /// The peer to chat with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no peer is set.
    pub fn peer_id(&self) -> Result<UserId, ConfigError> {
        self.peer
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(UserId::from)
            .ok_or(ConfigError::Missing("peer"))
    }

    /// Build the [`SessionConfig`] for a chat session.
    #[must_use]
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            echo_tolerance: self.echo_tolerance,
            ack_timeout: self.ack_timeout,
            confirm_on_transmit: self.confirm_on_transmit,
            max_message_len: self.max_message_len,
            event_buffer: self.event_buffer,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal client for DevConnect chat")]
pub struct CliArgs {
    /// Base URL of the DevConnect API.
    #[arg(long, env = "DEVCONNECT_API_URL")]
    pub api_url: Option<String>,

    /// Base URL of the socket server (default: derived from the API URL).
    #[arg(long, env = "DEVCONNECT_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Session token.
    #[arg(long, env = "DEVCONNECT_TOKEN")]
    pub token: Option<String>,

    /// Your user id.
    #[arg(long, env = "DEVCONNECT_USER_ID")]
    pub user_id: Option<String>,

    /// Your first name, shown to the peer.
    #[arg(long)]
    pub first_name: Option<String>,

    /// Your last name, shown to the peer.
    #[arg(long)]
    pub last_name: Option<String>,

    /// User id of the peer to chat with.
    #[arg(long, env = "DEVCONNECT_PEER")]
    pub peer: Option<String>,

    /// List conversations and exit.
    #[arg(long)]
    pub list: bool,

    /// Path to config file (default: `~/.config/devconnect/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DEVCONNECT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/devconnect.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("devconnect").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
