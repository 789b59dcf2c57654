//! Configuration module for ack-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "ack-server")]
#[command(author = "ack-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP acknowledgment server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (defaults to all interfaces)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Size of each worker's read buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Capacity of the worker task queue (0 = unbounded)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and admission configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Reactor and worker pool tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub queue_capacity: usize,
    /// Maximum readiness events harvested per wake
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            queue_capacity: 0,
            events_capacity: default_events_capacity(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Worker thread count; 0 resolves to available parallelism.
    pub workers: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub buffer_size: usize,
    /// 0 means unbounded.
    pub queue_capacity: usize,
    pub events_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["ack-server"]), TomlConfig::default())
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
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            buffer_size: cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.runtime.queue_capacity),
            events_capacity: toml_config.runtime.events_capacity,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be greater than 0",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Worker count with `0` resolved to the number of available cores.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// The `host:port` pair to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
