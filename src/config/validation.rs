//! Configuration validation
//!
//! Validates configuration and reports issues.

use secrecy::ExposeSecret;

use super::types::{Config, StorageBackendType};
use crate::sandbox::AddressPolicy;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_server_config(config, result);
    result = validate_storage_config(config, result);
    result = validate_database_config(config, result);
    result = validate_sandbox_config(config, result);

    result
}

fn validate_server_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.server.port == 0 {
        result = result.with_error(ValidationIssue::new("server.port", "Port must be non-zero"));
    }

    if config.server.subdomain_offset == 0 {
        result = result.with_error(
            ValidationIssue::new(
                "server.subdomain_offset",
                "Subdomain offset must be at least 1",
            )
            .with_suggestion("Use 2 for a platform domain like example.com"),
        );
    }

    if config.server.max_request_body == 0 {
        result = result.with_warning(ValidationIssue::new(
            "server.max_request_body",
            "Every request with a body will be rejected with 413",
        ));
    }

    result
}

fn validate_storage_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.storage.module_bucket.trim().is_empty() {
        result = result.with_error(
            ValidationIssue::new("storage.module_bucket", "Module bucket must not be empty")
                .with_suggestion("Set storage.module_bucket, e.g. \"modules\""),
        );
    }

    if config.storage.backend == StorageBackendType::Memory {
        result = result.with_warning(ValidationIssue::new(
            "storage.backend",
            "In-memory storage loses uploaded modules on restart",
        ));
    }

    result
}

fn validate_database_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    match config.database {
        Some(ref db) if db.url.expose_secret().trim().is_empty() => {
            result = result.with_error(
                ValidationIssue::new("database.url", "Database URL is empty")
                    .with_suggestion("Set DATABASE_URL or remove the database section"),
            );
        }
        Some(_) => {}
        None => {
            result = result.with_warning(
                ValidationIssue::new(
                    "database",
                    "No database configured; projects and actions are kept in memory",
                )
                .with_suggestion("Set DATABASE_URL to persist metadata in PostgreSQL"),
            );
        }
    }

    result
}

fn validate_sandbox_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if let Err(e) = AddressPolicy::from_patterns(&config.sandbox.allowed_addresses) {
        result = result.with_error(
            ValidationIssue::new("sandbox.allowed_addresses", e.to_string())
                .with_suggestion("Use ip[:port] entries such as 10.0.0.1:443, or \"*\""),
        );
    }

    if !config.sandbox.network_enabled && !config.sandbox.allowed_addresses.is_empty() {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.allowed_addresses",
            "Addresses are listed but sandbox.network_enabled is false",
        ));
    }

    if config.sandbox.epoch_tick.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "sandbox.epoch_tick",
            "Epoch tick must be greater than zero",
        ));
    }

    if config.sandbox.cache_capacity == Some(0) {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.cache_capacity",
            "A zero capacity recompiles the module on every request",
        ));
    }

    result
}
