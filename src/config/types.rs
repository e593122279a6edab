//! Configuration types
//!
//! Every section deserializes with defaults so a missing file, or a file
//! naming only a few keys, is a valid configuration.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Absent means in-memory repositories
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP front door
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of trailing host labels forming the platform domain
    #[serde(default = "default_subdomain_offset")]
    pub subdomain_offset: usize,
    /// Largest request body forwarded to a guest
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    /// Largest module accepted by the upload endpoint
    #[serde(default = "default_max_module_bytes")]
    pub max_module_bytes: usize,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            subdomain_offset: default_subdomain_offset(),
            max_request_body: default_max_request_body(),
            max_module_bytes: default_max_module_bytes(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4251
}

fn default_subdomain_offset() -> usize {
    2
}

fn default_max_request_body() -> usize {
    8 * 1024 * 1024
}

fn default_max_module_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Module blob storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendType,
    /// Root directory of the filesystem backend
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Bucket holding uploaded modules
    #[serde(default = "default_module_bucket")]
    pub module_bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackendType::default(),
            root: default_storage_root(),
            module_bucket: default_module_bucket(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/modules")
}

fn default_module_bucket() -> String {
    "modules".to_string()
}

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    /// Local directory tree (default)
    #[default]
    Fs,
    /// In-memory (no persistence)
    Memory,
}

impl std::str::FromStr for StorageBackendType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "file" | "filesystem" => Ok(StorageBackendType::Fs),
            "memory" | "mem" => Ok(StorageBackendType::Memory),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid storage backend: {}. Valid options: fs, memory",
                s
            ))),
        }
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(skip_serializing)]
    pub url: SecretString,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        DatabaseConfig {
            url: SecretString::from(url.into()),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

/// Guest execution limits and platform network policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Allow guests that ask for it to open outbound connections
    #[serde(default)]
    pub network_enabled: bool,
    /// Reachable addresses when the network is enabled; `["*"]` allows all
    #[serde(default)]
    pub allowed_addresses: Vec<String>,
    /// Linear memory cap per instance
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Cap on bytes a guest may write as its response
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Interval at which running guests yield to the executor
    #[serde(with = "humantime_serde", default = "default_epoch_tick")]
    pub epoch_tick: Duration,
    /// Wall-clock limit per guest call; none by default
    #[serde(with = "humantime_serde", default)]
    pub call_timeout: Option<Duration>,
    /// Maximum number of compiled modules kept; unbounded by default
    #[serde(default)]
    pub cache_capacity: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            network_enabled: false,
            allowed_addresses: Vec::new(),
            max_memory_bytes: default_max_memory_bytes(),
            max_output_bytes: default_max_output_bytes(),
            epoch_tick: default_epoch_tick(),
            call_timeout: None,
            cache_capacity: None,
        }
    }
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_epoch_tick() -> Duration {
    Duration::from_millis(10)
}

/// Logging setup used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid log format: {}. Valid options: pretty, json",
                s
            ))),
        }
    }
}
