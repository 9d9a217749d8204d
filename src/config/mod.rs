//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + CLI overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → handed to the Engine by the composition root
//!
//! On reload signal:
//!     the replacement process re-reads the file at startup;
//!     there is no in-process hot swap
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes ride along with a binary upgrade
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    CallbackFailure, EngineConfig, LogConfig, MetricsConfig, ReadinessMode, Strategy,
    UpgradeConfig,
};
