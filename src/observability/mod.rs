//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Composition root (main.rs):
//!     LogConfig → logging.rs → tracing::Dispatch → installed once
//!     MetricsConfig → metrics.rs → Prometheus exporter (optional)
//!
//! Library components:
//!     tracing macros inside a `process{pid, ppid}` span
//!     metrics facade counters for reloads and shutdowns
//! ```
//!
//! # Design Decisions
//! - No lazily initialised global logger: the dispatcher is built explicitly
//!   and background tasks inherit the caller's dispatcher
//! - Structured logging (JSON) for files, compact format for terminals
//! - Metrics are cheap facade calls; without an exporter they are no-ops

pub mod logging;
pub mod metrics;
