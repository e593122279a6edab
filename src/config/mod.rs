//! Configuration module
//!
//! - types.rs: configuration sections and their defaults
//! - io.rs: loading from file and environment
//! - validation.rs: configuration validation

mod io;
mod types;
mod validation;

pub use io::{
    apply_env_overrides, config_path, load_config, load_config_from_path, save_config,
    CONFIG_ENV, DEFAULT_CONFIG_FILE,
};
pub use types::{
    Config, DatabaseConfig, LogConfig, LogFormat, SandboxConfig, ServerConfig,
    StorageBackendType, StorageConfig,
};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};

use crate::sandbox::{AddressPolicy, Capabilities};

impl SandboxConfig {
    /// Platform-wide network capabilities; an action can only narrow these
    pub fn capabilities(&self) -> crate::error::Result<Capabilities> {
        Ok(Capabilities {
            network_enabled: self.network_enabled,
            allowed_addresses: AddressPolicy::from_patterns(&self.allowed_addresses)?,
        })
    }
}
