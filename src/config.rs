//! Configuration module for wire-pair.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::framing::{Framing, DEFAULT_MAX_FRAME_SIZE};
use crate::reply::{ReplyKind, DEFAULT_ACK_TEXT};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "wire-pair")]
#[command(author = "wire-pair authors")]
#[command(version = "0.1.0")]
#[command(about = "Length-framed TCP message exchange", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to or connect to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to or connect to
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Connect timeout in milliseconds
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u32>,

    /// Per-frame read/write timeout in milliseconds (0 = none)
    #[arg(long, global = true)]
    pub io_timeout_ms: Option<u64>,

    /// Frame boundary marking
    #[arg(long, value_enum, global = true)]
    pub framing: Option<Framing>,

    /// Largest accepted frame payload in bytes
    #[arg(long, global = true)]
    pub max_frame_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and answer each message
    Listen(ListenArgs),
    /// Send one message and print the reply
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Default)]
pub struct ListenArgs {
    /// Serve a single connection, then exit
    #[arg(long)]
    pub once: bool,

    /// Queued-but-unaccepted connection limit
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Connections handled at the same time
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// How to answer each message
    #[arg(long, value_enum)]
    pub reply: Option<ReplyKind>,

    /// Acknowledgement text for `--reply acknowledge`
    #[arg(long)]
    pub ack_text: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ConnectArgs {
    /// Message to send
    #[arg(short, long, conflicts_with = "greet")]
    pub message: Option<String>,

    /// Send "Hello from <hostname>" instead of a fixed message
    #[arg(long)]
    pub greet: bool,

    /// Read the server address from this file instead of --host/--port
    #[arg(long)]
    pub address_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to bind or connect
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.connect_timeout_ms))
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new(default_host(), default_port())
    }
}

/// Framing and per-connection I/O settings, shared by both roles
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Bound on reading or writing one whole frame; 0 disables it
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl ExchangeConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        match self.io_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            max_frame_size: default_max_frame_size(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Listener-only settings
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub reply: ReplyKind,
    #[serde(default = "default_ack_text")]
    pub ack_text: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            reply: ReplyKind::default(),
            ack_text: default_ack_text(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_connect_timeout_ms() -> u32 {
    5000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_backlog() -> i32 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_ack_text() -> String {
    DEFAULT_ACK_TEXT.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub exchange: ExchangeConfig,
    pub listener: ListenerConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            exchange: ExchangeConfig::default(),
            listener: ListenerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Resolve configuration from parsed CLI args and the optional TOML file
    /// they name. CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: &CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => TomlConfig::load(path)?,
            None => TomlConfig::default(),
        };

        let TomlConfig {
            mut endpoint,
            mut exchange,
            mut listener,
            logging,
        } = toml_config;

        if let Some(ref host) = cli.host {
            endpoint.host = host.clone();
        }
        if let Some(port) = cli.port {
            endpoint.port = port;
        }
        if let Some(ms) = cli.connect_timeout_ms {
            endpoint.connect_timeout_ms = ms;
        }
        if let Some(ms) = cli.io_timeout_ms {
            exchange.io_timeout_ms = ms;
        }
        if let Some(framing) = cli.framing {
            exchange.framing = framing;
        }
        if let Some(size) = cli.max_frame_size {
            exchange.max_frame_size = size;
        }

        if let Command::Listen(ref args) = cli.command {
            if let Some(backlog) = args.backlog {
                listener.backlog = backlog;
            }
            if let Some(max) = args.max_connections {
                listener.max_connections = max;
            }
            if let Some(reply) = args.reply {
                listener.reply = reply;
            }
            if let Some(ref text) = args.ack_text {
                listener.ack_text = text.clone();
            }
        }

        let config = Config {
            endpoint,
            exchange,
            listener,
            log_level: cli.log_level.clone().unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::invalid("endpoint.host", "must not be empty"));
        }
        if self.endpoint.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "endpoint.connect_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.exchange.max_frame_size == 0 || self.exchange.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::invalid(
                "exchange.max_frame_size",
                "must be between 1 and 4294967295",
            ));
        }
        if self.listener.backlog <= 0 {
            return Err(ConfigError::invalid(
                "listener.backlog",
                "must be greater than 0",
            ));
        }
        let max_connections = self.listener.max_connections;
        if max_connections == 0 || max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "listener.max_connections",
                format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(())
    }
}

impl TomlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .path.display(), .source)]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {}", .path.display(), .source)]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.endpoint.host, "127.0.0.1");
        assert_eq!(config.endpoint.port, 5001);
        assert_eq!(config.endpoint.connect_timeout_ms, 5000);
        assert_eq!(config.exchange.framing, Framing::LengthPrefixed);
        assert_eq!(config.exchange.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.listener.reply, ReplyKind::Echo);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [endpoint]
            host = "10.0.1.3"
            port = 6000
            connect_timeout_ms = 250

            [exchange]
            framing = "close-delimited"
            io_timeout_ms = 0

            [listener]
            backlog = 16
            reply = "acknowledge"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint.host, "10.0.1.3");
        assert_eq!(config.endpoint.port, 6000);
        assert_eq!(config.endpoint.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.exchange.framing, Framing::CloseDelimited);
        assert_eq!(config.exchange.io_timeout(), None);
        assert_eq!(config.listener.backlog, 16);
        assert_eq!(config.listener.reply, ReplyKind::Acknowledge);
        assert_eq!(config.listener.ack_text, "Connection successful");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[endpoint]\nhost = \"10.0.1.3\"\nport = 6000\n\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let cli = parse(&[
            "wire-pair",
            "--config",
            path,
            "--port",
            "7000",
            "listen",
            "--reply",
            "acknowledge",
            "--backlog",
            "8",
        ]);
        let config = Config::from_args(&cli).unwrap();

        assert_eq!(config.endpoint.host, "10.0.1.3");
        assert_eq!(config.endpoint.port, 7000);
        assert_eq!(config.listener.reply, ReplyKind::Acknowledge);
        assert_eq!(config.listener.backlog, 8);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_connect_args() {
        let cli = parse(&["wire-pair", "connect", "--message", "hi", "--host", "localhost"]);
        let config = Config::from_args(&cli).unwrap();
        assert_eq!(config.endpoint.host, "localhost");
        match cli.command {
            Command::Connect(args) => {
                assert_eq!(args.message.as_deref(), Some("hi"));
                assert!(!args.greet);
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(CliArgs::try_parse_from(["wire-pair", "connect", "-m", "x", "--greet"]).is_err());
    }

    #[test]
    fn test_validation() {
        let cli = parse(&["wire-pair", "--connect-timeout-ms", "0", "connect"]);
        assert!(matches!(
            Config::from_args(&cli),
            Err(ConfigError::Invalid {
                field: "endpoint.connect_timeout_ms",
                ..
            })
        ));

        let cli = parse(&["wire-pair", "--max-frame-size", "0", "listen"]);
        assert!(matches!(
            Config::from_args(&cli),
            Err(ConfigError::Invalid {
                field: "exchange.max_frame_size",
                ..
            })
        ));
    }

    #[test]
    fn test_max_connections_bounded_by_semaphore() {
        let too_many = (Semaphore::MAX_PERMITS + 1).to_string();
        let cli = parse(&["wire-pair", "listen", "--max-connections", too_many.as_str()]);
        assert!(matches!(
            Config::from_args(&cli),
            Err(ConfigError::Invalid {
                field: "listener.max_connections",
                ..
            })
        ));

        let at_limit = Semaphore::MAX_PERMITS.to_string();
        let cli = parse(&["wire-pair", "listen", "--max-connections", at_limit.as_str()]);
        let config = Config::from_args(&cli).unwrap();
        assert_eq!(config.listener.max_connections, Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_missing_file() {
        let cli = parse(&["wire-pair", "--config", "/nonexistent/wire-pair.toml", "listen"]);
        assert!(matches!(
            Config::from_args(&cli),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
