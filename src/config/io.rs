//! Configuration I/O - Loading and saving configuration
//!
//! Precedence, lowest first: defaults, config file, environment. CLI flags
//! are applied on top by the binary.

use secrecy::SecretString;
use std::path::{Path, PathBuf};

use super::types::{Config, DatabaseConfig};
use crate::error::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "WASMGATE_CONFIG";

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "wasmgate.toml";

/// Resolve which config file to read, if any.
///
/// An explicit path always wins and must exist; the default file is optional.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    default.exists().then_some(default)
}

/// Load configuration with layered precedence:
/// 1. Config file if one is named or `wasmgate.toml` exists, otherwise defaults
/// 2. Environment variable overrides (includes `.env`)
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    // Load .env before reading WASMGATE_CONFIG so it can name the file too
    dotenvy::dotenv().ok();

    let mut config = match config_path(explicit) {
        Some(path) => load_config_from_path(&path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "json" || ext == "json5") {
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try TOML first, then JSON5
        toml::from_str(&content)
            .or_else(|_| json5::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Overlay process environment variables onto `config`
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Overlay variables from `lookup`; unparseable values are ignored
fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    // Server overrides
    if let Some(host) = lookup("WASMGATE_HOST") {
        config.server.host = host;
    }
    if let Some(v) = lookup("WASMGATE_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = v;
    }
    if let Some(v) = lookup("WASMGATE_SUBDOMAIN_OFFSET").and_then(|v| v.parse().ok()) {
        config.server.subdomain_offset = v;
    }
    if let Some(v) = lookup("WASMGATE_MAX_REQUEST_BODY").and_then(|v| v.parse().ok()) {
        config.server.max_request_body = v;
    }

    // Storage overrides
    if let Some(v) = lookup("WASMGATE_STORAGE_BACKEND").and_then(|v| v.parse().ok()) {
        config.storage.backend = v;
    }
    if let Some(root) = lookup("WASMGATE_STORAGE_ROOT") {
        config.storage.root = PathBuf::from(root);
    }
    if let Some(bucket) = lookup("WASMGATE_MODULE_BUCKET") {
        config.storage.module_bucket = bucket;
    }

    // Database overrides
    if let Some(database_url) = lookup("DATABASE_URL") {
        let db = config
            .database
            .get_or_insert_with(|| DatabaseConfig::new(String::new()));
        db.url = SecretString::from(database_url);
    }
    if let Some(v) = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
        if let Some(ref mut db) = config.database {
            db.max_connections = v;
        }
    }
    if let Some(v) = lookup("DATABASE_TIMEOUT").and_then(|v| v.parse().ok()) {
        if let Some(ref mut db) = config.database {
            db.connect_timeout_secs = v;
        }
    }

    // Sandbox overrides
    if let Some(v) = lookup("WASMGATE_NETWORK_ENABLED") {
        config.sandbox.network_enabled = v == "true" || v == "1";
    }
    if let Some(list) = lookup("WASMGATE_ALLOWED_ADDRESSES") {
        config.sandbox.allowed_addresses = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = lookup("WASMGATE_CALL_TIMEOUT").and_then(|v| humantime::parse_duration(&v).ok()) {
        config.sandbox.call_timeout = Some(v);
    }

    // Log overrides
    if let Some(level) = lookup("RUST_LOG") {
        config.log.level = level;
    }
    if let Some(v) = lookup("WASMGATE_LOG_FORMAT").and_then(|v| v.parse().ok()) {
        config.log.format = v;
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}
