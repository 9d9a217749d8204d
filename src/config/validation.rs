//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::{EngineConfig, ReadinessMode, Strategy};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: '{value}'")]
    BadAddress { field: &'static str, value: String },

    #[error("invalid log level '{0}'")]
    BadLogLevel(String),

    #[error("host must not be empty")]
    EmptyHost,
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if config.read_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "read_timeout_secs" });
    }
    if config.write_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "write_timeout_secs" });
    }
    // The broker always waits for its successor; the graceful strategy only
    // with a handshake.
    let waits_for_readiness = config.upgrade.strategy == Strategy::Broker
        || config.upgrade.readiness == ReadinessMode::Handshake;
    if waits_for_readiness && config.upgrade.readiness_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "upgrade.readiness_timeout_secs" });
    }
    if config.upgrade.readiness == ReadinessMode::Delay && config.upgrade.readiness_delay_ms == 0 {
        errors.push(ValidationError::Zero { field: "upgrade.readiness_delay_ms" });
    }
    if config.metrics.enabled && config.metrics.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            field: "metrics.address",
            value: config.metrics.address.clone(),
        });
    }
    if config.logging.file.is_some() && config.logging.max_size_mb == 0 {
        errors.push(ValidationError::Zero { field: "logging.max_size_mb" });
    }
    if EnvFilter::try_new(&config.logging.level).is_err() {
        errors.push(ValidationError::BadLogLevel(config.logging.level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
