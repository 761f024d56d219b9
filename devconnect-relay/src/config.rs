//! Configuration system for the `DevConnect` relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/devconnect-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading relay configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_history: Option<usize>,
    max_text_len: Option<usize>,
    poll_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "DevConnect development relay")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "DEVCONNECT_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/devconnect-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Messages kept per conversation.
    #[arg(long)]
    pub max_history: Option<usize>,

    /// Maximum message length in characters.
    #[arg(long)]
    pub max_text_len: Option<usize>,

    /// Seconds a long-poll request is held open.
    #[arg(long)]
    pub poll_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DEVCONNECT_RELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:7000`).
    pub bind_addr: String,
    /// Messages kept per conversation; older ones are evicted.
    pub max_history: usize,
    /// Maximum message length in characters.
    pub max_text_len: usize,
    /// How long a long-poll request is held open.
    pub poll_timeout: Duration,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".to_string(),
            max_history: 1000,
            max_text_len: 500,
            poll_timeout: Duration::from_secs(25),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_history: cli
                .max_history
                .or(file.server.max_history)
                .unwrap_or(defaults.max_history),
            max_text_len: cli
                .max_text_len
                .or(file.server.max_text_len)
                .unwrap_or(defaults.max_text_len),
            poll_timeout: cli
                .poll_timeout_secs
                .or(file.server.poll_timeout_secs)
                .map_or(defaults.poll_timeout, Duration::from_secs),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(RelayConfigFile::default());
    };
    let path = config_dir.join("devconnect-relay").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_history, 1000);
        assert_eq!(config.max_text_len, 500);
        assert_eq!(config.poll_timeout, Duration::from_secs(25));
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
max_history = 50
max_text_len = 140
poll_timeout_secs = 5
"#;
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);

        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_history, 50);
        assert_eq!(config.max_text_len, 140);
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[server]
max_history = 2000
"#;
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_text_len, 500);
        assert_eq!(config.max_history, 2000);
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
max_text_len = 140
"#;
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        let cli = RelayCliArgs {
            bind: Some("0.0.0.0:3000".to_string()),
            max_text_len: None,
            ..Default::default()
        };
        let config = RelayConfig::resolve(&cli, &file);

        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.max_text_len, 140);
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
