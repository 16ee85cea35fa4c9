//! Configuration module for the splice forwarder.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the splice forwarder
#[derive(Parser, Debug)]
#[command(name = "loopsplice")]
#[command(author = "loopsplice authors")]
#[command(version = "0.1.0")]
#[command(about = "Zero-copy TCP splicing for loopback-local connections", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept spliced connections on (e.g., 127.0.0.1:2022)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of pre-opened pipe pairs to keep pooled
    #[arg(long)]
    pub pipe_pool_size: Option<usize>,

    /// Starting capacity (bytes) to probe pipes for, halved on failure
    #[arg(long)]
    pub starting_pipe_size: Option<usize>,

    /// Maximum concurrent spliced connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub splice: SpliceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to accept spliced connections on
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Splice-engine tunables
#[derive(Debug, Deserialize)]
pub struct SpliceConfig {
    /// Number of pre-opened pipe pairs to keep pooled
    #[serde(default = "default_pipe_pool_size")]
    pub pipe_pool_size: usize,
    /// Starting capacity (bytes) to probe pipes for, halved on failure
    #[serde(default = "default_starting_pipe_size")]
    pub starting_pipe_size: usize,
    /// Number of pre-opened sockets to keep pooled per address family
    #[serde(default = "default_sock_pool_size")]
    pub sock_pool_size: usize,
    /// Refill the socket pool once fewer than this many slots are filled
    #[serde(default = "default_sock_pool_low_watermark")]
    pub sock_pool_low_watermark: usize,
    /// Maximum concurrent spliced connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Period, in milliseconds, of the periodic maintenance sweep
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            pipe_pool_size: default_pipe_pool_size(),
            starting_pipe_size: default_starting_pipe_size(),
            sock_pool_size: default_sock_pool_size(),
            sock_pool_low_watermark: default_sock_pool_low_watermark(),
            max_connections: default_max_connections(),
            tick_interval_ms: default_tick_interval_ms(),
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

fn default_listen() -> String {
    "127.0.0.1:2022".to_string()
}

// Matches MAX_PIPE_SIZE in the reference implementation.
fn default_starting_pipe_size() -> usize {
    8 * 1024 * 1024
}

// Matches TCP_SPLICE_PIPE_POOL_SIZE.
fn default_pipe_pool_size() -> usize {
    32
}

fn default_sock_pool_size() -> usize {
    16
}

fn default_sock_pool_low_watermark() -> usize {
    default_sock_pool_size().saturating_sub(1)
}

fn default_max_connections() -> usize {
    1024
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub pipe_pool_size: usize,
    pub starting_pipe_size: usize,
    pub sock_pool_size: usize,
    pub sock_pool_low_watermark: usize,
    pub max_connections: usize,
    pub tick_interval_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_args(cli)
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            pipe_pool_size: cli
                .pipe_pool_size
                .unwrap_or(toml_config.splice.pipe_pool_size),
            starting_pipe_size: cli
                .starting_pipe_size
                .unwrap_or(toml_config.splice.starting_pipe_size),
            sock_pool_size: toml_config.splice.sock_pool_size,
            sock_pool_low_watermark: toml_config.splice.sock_pool_low_watermark,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.splice.max_connections),
            tick_interval_ms: toml_config.splice.tick_interval_ms,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
