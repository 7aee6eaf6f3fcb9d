//! Configuration management for the mining service
//!
//! Settings are layered: built-in defaults, then an optional config file
//! (YAML, TOML or JSON by extension), then `POWERPLANT__SECTION__KEY`
//! environment variables, then command line flags.

use crate::coordinator::PowLimits;
use crate::worker::cpu::{CpuWorker, CpuWorkerConfig, DEFAULT_BATCH_SIZE};
use crate::{Difficulty, Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "POWERPLANT";

/// Upper bound on search threads across all connections
pub const MAX_SEARCH_THREADS: usize = 16_384;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    Plain,
    /// One JSON object per line
    Json,
}

/// Command line arguments
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "powerplant",
    version = env!("CARGO_PKG_VERSION"),
    about = "WebSocket proof-of-work mining service for Nostr events"
)]
pub struct Args {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, value_name = "FILE", env = "POWERPLANT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "POWERPLANT_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "POWERPLANT_PORT")]
    pub port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long, env = "POWERPLANT_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Mining threads per job (0 = one per CPU)
    #[arg(short, long, env = "POWERPLANT_THREADS")]
    pub threads: Option<usize>,

    /// Log level
    #[arg(long, value_enum, env = "POWERPLANT_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Log output format
    #[arg(long, value_enum, env = "POWERPLANT_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub print_config: bool,
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port; `0` picks a free port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections beyond this are refused
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Mining settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowConfig {
    /// Target used for requests asking for `0`
    #[serde(default)]
    pub default_difficulty: u32,
    /// Highest accepted target
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: u32,
    /// Search threads per job; `0` means one per CPU
    #[serde(default)]
    pub threads: usize,
    /// Hashes per thread between cancellation checks
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Job time limit such as `"30s"` or `"5m"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_job_duration: Option<String>,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            default_difficulty: 0,
            max_difficulty: default_max_difficulty(),
            threads: 0,
            batch_size: default_batch_size(),
            max_job_duration: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Complete configuration for the mining service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pow: PowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration for `args`
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let mut config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Command line flags take precedence over every other source
    fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(max_connections) = args.max_connections {
            self.server.max_connections = max_connections;
        }
        if let Some(threads) = args.threads {
            self.pow.threads = threads;
        }
        if let Some(level) = args.log_level {
            self.logging.level = level;
        }
        if let Some(format) = args.log_format {
            self.logging.format = format;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pow.max_difficulty > Difficulty::MAX.value() {
            return Err(Error::config(format!(
                "max_difficulty must be at most {}",
                Difficulty::MAX
            )));
        }

        if self.pow.default_difficulty > self.pow.max_difficulty {
            return Err(Error::config(
                "default_difficulty must not exceed max_difficulty",
            ));
        }

        if self.pow.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }

        if self.server.max_connections == 0 {
            return Err(Error::config("max_connections must be greater than 0"));
        }

        let search_threads = CpuWorker::effective_threads(self.pow.threads)
            .saturating_mul(self.server.max_connections);
        if search_threads > MAX_SEARCH_THREADS {
            return Err(Error::config(format!(
                "threads x max_connections allows {} search threads, maximum is {}",
                search_threads, MAX_SEARCH_THREADS
            )));
        }

        self.socket_addr()?;
        self.max_job_duration()?;
        Ok(())
    }

    /// Get listen socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|e| Error::config(format!("Invalid host {:?}: {}", self.server.host, e)))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Get parsed job time limit
    pub fn max_job_duration(&self) -> Result<Option<Duration>> {
        self.pow
            .max_job_duration
            .as_deref()
            .map(|text| {
                humantime::parse_duration(text)
                    .map_err(|e| Error::config(format!("Invalid max_job_duration: {}", e)))
            })
            .transpose()
    }

    /// Difficulty policy for coordinators
    pub fn pow_limits(&self) -> Result<PowLimits> {
        Ok(PowLimits {
            default_difficulty: Difficulty::new(self.pow.default_difficulty)?,
            max_difficulty: Difficulty::new(self.pow.max_difficulty)?,
            max_job_duration: self.max_job_duration()?,
        })
    }

    /// Settings for the CPU search engine
    pub fn cpu_worker_config(&self) -> CpuWorkerConfig {
        CpuWorkerConfig {
            threads: self.pow.threads,
            batch_size: self.pow.batch_size,
        }
    }
}

// Default value functions for serde
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> usize { 100 }
fn default_max_difficulty() -> u32 { Difficulty::MAX.value() }
fn default_batch_size() -> u64 { DEFAULT_BATCH_SIZE }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
