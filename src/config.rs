//! Configuration module for packet-gate.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! Keys from the classic flat `nginx.conf`-style layout are accepted as
//! aliases inside their section, so `Sock_MaxWaitTime = 20` under
//! `[socket]` means the same as `heartbeat_interval = 20`.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::runtime::wire::HEADER_SIZE;

/// Heartbeat intervals below this are clamped up.
const MIN_HEARTBEAT_INTERVAL: u64 = 5;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "packet-gate")]
#[command(author = "packet-gate authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server core for length-prefixed binary packets", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (repeat for several ports)
    #[arg(short = 'p', long = "port")]
    pub ports: Vec<u16>,

    /// Maximum number of concurrently online connections
    #[arg(short = 'n', long)]
    pub worker_connections: Option<usize>,

    /// Number of message-processing worker threads
    #[arg(short = 'w', long)]
    pub worker_threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening and admission configuration
#[derive(Debug, Deserialize)]
pub struct NetConfig {
    /// Address the listening sockets bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Ports to listen on, one listening socket each
    #[serde(default = "default_listen_ports", alias = "ListenPort")]
    pub listen_ports: Vec<u16>,
    /// Online connection ceiling used for admission control
    #[serde(default = "default_worker_connections")]
    pub worker_connections: usize,
    /// Exclusive upper bound on a packet's total length
    #[serde(default = "default_max_packet_length")]
    pub max_packet_length: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            listen_ports: default_listen_ports(),
            worker_connections: default_worker_connections(),
            max_packet_length: default_max_packet_length(),
        }
    }
}

/// Connection lifetime configuration
#[derive(Debug, Deserialize)]
pub struct SocketConfig {
    /// Seconds a closed connection waits before its slot is reused
    #[serde(default = "default_recycle_wait", alias = "Sock_RecyConnectionWaitTime")]
    pub recycle_wait: u64,
    /// Enable the heartbeat timer queue
    #[serde(default, alias = "Sock_WaitTimeEnable", deserialize_with = "flag")]
    pub heartbeat_enabled: bool,
    /// Heartbeat check interval in seconds
    #[serde(default = "default_heartbeat_interval", alias = "Sock_MaxWaitTime")]
    pub heartbeat_interval: u64,
    /// Kick a connection as soon as its timer expires instead of re-arming it
    #[serde(default, alias = "Sock_TimeOutKick", deserialize_with = "flag")]
    pub timeout_kick: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recycle_wait: default_recycle_wait(),
            heartbeat_enabled: false,
            heartbeat_interval: default_heartbeat_interval(),
            timeout_kick: false,
        }
    }
}

/// Flood guard configuration
#[derive(Debug, Deserialize)]
pub struct FloodConfig {
    #[serde(default, alias = "Sock_FloodAttackKickEnable", deserialize_with = "flag")]
    pub enabled: bool,
    /// Packets closer together than this many milliseconds count as fast
    #[serde(default = "default_flood_interval", alias = "Sock_FloodTimeInterval")]
    pub interval_ms: u64,
    /// Consecutive fast packets that get a connection kicked
    #[serde(default = "default_flood_kick_count", alias = "Sock_FloodKickCounter")]
    pub kick_count: u32,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_flood_interval(),
            kick_count: default_flood_kick_count(),
        }
    }
}

/// Thread pool configuration
#[derive(Debug, Deserialize)]
pub struct ThreadConfig {
    #[serde(default = "default_worker_threads", alias = "ProcMsgRecvWorkThreadCount")]
    pub worker_threads: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
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

/// Accepts both `true`/`false` and the classic `1`/`0` spelling.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_ports() -> Vec<u16> {
    vec![10000]
}

fn default_worker_connections() -> usize {
    1024
}

fn default_max_packet_length() -> usize {
    29_000
}

fn default_recycle_wait() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_flood_interval() -> u64 {
    100
}

fn default_flood_kick_count() -> u32 {
    10
}

fn default_worker_threads() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub listen_ports: Vec<u16>,
    pub worker_connections: usize,
    pub max_packet_length: usize,
    pub recycle_wait: Duration,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub timeout_kick: bool,
    pub flood_enabled: bool,
    pub flood_interval: Duration,
    pub flood_kick_count: u32,
    pub worker_threads: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::resolve(toml_config);

        // Merge CLI args (CLI takes precedence)
        if !cli.ports.is_empty() {
            config.listen_ports = cli.ports;
        }
        if let Some(n) = cli.worker_connections {
            config.worker_connections = n;
        }
        if let Some(n) = cli.worker_threads {
            config.worker_threads = n;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Flatten the sectioned file layout into runtime settings.
    pub fn resolve(toml: TomlConfig) -> Self {
        Config {
            host: toml.net.host,
            listen_ports: toml.net.listen_ports,
            worker_connections: toml.net.worker_connections,
            max_packet_length: toml.net.max_packet_length,
            recycle_wait: Duration::from_secs(toml.socket.recycle_wait),
            heartbeat_enabled: toml.socket.heartbeat_enabled,
            heartbeat_interval: Duration::from_secs(
                toml.socket.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            ),
            timeout_kick: toml.socket.timeout_kick,
            flood_enabled: toml.flood.enabled,
            flood_interval: Duration::from_millis(toml.flood.interval_ms),
            flood_kick_count: toml.flood.kick_count,
            worker_threads: toml.threads.worker_threads,
            log_level: toml.logging.level,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_ports.is_empty() {
            return Err(ConfigError::Invalid("at least one listen port is required".into()));
        }
        if self.worker_connections == 0 {
            return Err(ConfigError::Invalid("worker_connections must be positive".into()));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be positive".into()));
        }
        if self.max_packet_length <= HEADER_SIZE || self.max_packet_length > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_packet_length must be in ({}, {}]",
                HEADER_SIZE,
                u16::MAX
            )));
        }
        Ok(())
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
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.listen_ports, vec![10000]);
        assert_eq!(config.worker_connections, 1024);
        assert_eq!(config.recycle_wait, Duration::from_secs(60));
        assert!(!config.heartbeat_enabled);
        assert!(!config.flood_enabled);
        assert_eq!(config.worker_threads, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [net]
            host = "127.0.0.1"
            listen_ports = [80, 443]
            worker_connections = 2048

            [socket]
            recycle_wait = 10
            heartbeat_enabled = true
            heartbeat_interval = 30
            timeout_kick = false

            [flood]
            enabled = true
            interval_ms = 50
            kick_count = 3

            [threads]
            worker_threads = 8

            [logging]
            level = "debug"
        "#;

        let config = Config::resolve(toml::from_str(toml_str).unwrap());
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.listen_ports, vec![80, 443]);
        assert_eq!(config.worker_connections, 2048);
        assert_eq!(config.recycle_wait, Duration::from_secs(10));
        assert!(config.heartbeat_enabled);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.flood_enabled);
        assert_eq!(config.flood_interval, Duration::from_millis(50));
        assert_eq!(config.flood_kick_count, 3);
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_classic_key_aliases() {
        let toml_str = r#"
            [socket]
            Sock_RecyConnectionWaitTime = 80
            Sock_WaitTimeEnable = 1
            Sock_MaxWaitTime = 2
            Sock_TimeOutKick = 0

            [flood]
            Sock_FloodAttackKickEnable = 1
            Sock_FloodTimeInterval = 100
            Sock_FloodKickCounter = 10

            [threads]
            ProcMsgRecvWorkThreadCount = 120
        "#;

        let config = Config::resolve(toml::from_str(toml_str).unwrap());
        assert_eq!(config.recycle_wait, Duration::from_secs(80));
        assert!(config.heartbeat_enabled);
        // clamped to the minimum interval
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(!config.timeout_kick);
        assert!(config.flood_enabled);
        assert_eq!(config.flood_kick_count, 10);
        assert_eq!(config.worker_threads, 120);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.listen_ports.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.max_packet_length = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }
}
