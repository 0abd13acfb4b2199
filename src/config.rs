//! Configuration module for the shard-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// What `stop()` does to running shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    /// Return immediately; listeners and in-flight connections are left alone.
    #[default]
    Detach,
    /// Close every listener and wait for in-flight connections to finish.
    Drain,
}

/// What a shard does when its accept call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptErrorPolicy {
    /// Only the failing shard stops accepting; other shards keep serving.
    #[default]
    StopShard,
    /// Abort the whole process.
    Abort,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "shard-echo")]
#[command(version = "0.1.0")]
#[command(about = "A thread-per-core TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The TCP port which the echo server will listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of shards (defaults to number of CPU cores)
    #[arg(short, long)]
    pub shards: Option<usize>,

    /// Behavior of shutdown on Ctrl-C
    #[arg(long, value_enum)]
    pub shutdown: Option<ShutdownMode>,

    /// Behavior of a shard whose accept call fails
    #[arg(long, value_enum)]
    pub on_accept_error: Option<AcceptErrorPolicy>,

    /// Pin shard threads to CPU cores (Linux only)
    #[arg(long)]
    pub pin_shards: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub shards: Option<usize>,
    #[serde(default)]
    pub shutdown: ShutdownMode,
    #[serde(default)]
    pub on_accept_error: AcceptErrorPolicy,
    #[serde(default)]
    pub pin_shards: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shards: None,
            shutdown: ShutdownMode::default(),
            on_accept_error: AcceptErrorPolicy::default(),
            pin_shards: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_port() -> u16 {
    1883
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub shards: usize,
    pub shutdown: ShutdownMode,
    pub on_accept_error: AcceptErrorPolicy,
    pub pin_shards: bool,
    pub log_level: String,
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            port: server.port,
            shards: default_shards(),
            shutdown: server.shutdown,
            on_accept_error: server.on_accept_error,
            pin_shards: server.pin_shards,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let shards = cli
            .shards
            .or(toml_config.server.shards)
            .unwrap_or_else(default_shards);
        if shards == 0 {
            return Err(ConfigError::InvalidShards);
        }

        Ok(Config {
            port: cli.port.unwrap_or(toml_config.server.port),
            shards,
            shutdown: cli.shutdown.unwrap_or(toml_config.server.shutdown),
            on_accept_error: cli
                .on_accept_error
                .unwrap_or(toml_config.server.on_accept_error),
            pin_shards: cli.pin_shards || toml_config.server.pin_shards,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("shard count must be at least 1")]
    InvalidShards,
}
