//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host to bind (e.g., "0.0.0.0").
    pub host: String,

    /// TCP port to serve on. Port 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Request read timeout in seconds.
    pub read_timeout_secs: u64,

    /// Response write timeout in seconds.
    pub write_timeout_secs: u64,

    /// Turn handler panics into 500 responses.
    pub enable_recovery: bool,

    /// Emit one log span per request.
    pub enable_access_log: bool,

    /// Log sink settings.
    pub logging: LogConfig,

    /// Restart and upgrade behaviour.
    pub upgrade: UpgradeConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            enable_recovery: true,
            enable_access_log: true,
            logging: LogConfig::default(),
            upgrade: UpgradeConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The `host:port` string handed to `Listen`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-request deadline derived from the read and write timeouts.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.saturating_add(self.write_timeout_secs))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub level: String,

    /// Write human-readable logs to stdout.
    pub console: bool,

    /// Use JSON lines on the console instead of the compact format.
    pub json: bool,

    /// Optional file receiving JSON lines.
    pub file: Option<String>,

    /// Rotate the log file once it grows past this many megabytes.
    pub max_size_mb: u64,

    /// Delete rotated files older than this many days. 0 keeps them.
    pub max_age_days: u64,

    /// Rotated files to keep. 0 keeps all of them.
    pub max_backups: usize,

    /// Gzip rotated files.
    pub compress: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            json: false,
            file: None,
            max_size_mb: 100,
            max_age_days: 30,
            max_backups: 30,
            compress: true,
        }
    }
}

/// Which upgrade strategy the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Self-managed descriptor passing driven by the signal loop.
    #[default]
    Graceful,
    /// Delegated to the in-process broker with a readiness rendezvous.
    Broker,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graceful" => Ok(Self::Graceful),
            "broker" => Ok(Self::Broker),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// How long the parent waits for its replacement before draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Drain immediately after spawning.
    #[default]
    Disabled,
    /// Sleep for `readiness_delay_ms` before draining.
    Delay,
    /// Wait for the child to report readiness over a pipe.
    Handshake,
}

/// What happens when a shutdown callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallbackFailure {
    /// Stop the drain at the failing callback.
    #[default]
    Abort,
    /// Log the panic and keep going.
    Isolate,
}

/// Upgrade configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub strategy: Strategy,

    pub readiness: ReadinessMode,

    /// Handshake deadline in seconds (also used by the broker).
    pub readiness_timeout_secs: u64,

    /// Fixed wait used by `ReadinessMode::Delay`.
    pub readiness_delay_ms: u64,

    pub callback_failure: CallbackFailure,

    /// Treat SIGQUIT like SIGTERM.
    pub stop_on_quit: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Graceful,
            readiness: ReadinessMode::Disabled,
            readiness_timeout_secs: 10,
            readiness_delay_ms: 500,
            callback_failure: CallbackFailure::Abort,
            stop_on_quit: true,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus endpoint.
    pub enabled: bool,

    /// Metrics endpoint bind address.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9090".to_string(),
        }
    }
}
