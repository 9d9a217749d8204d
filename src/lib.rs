//! Zero-downtime restarts for Tokio/axum services.
//!
//! # Architecture Overview
//!
//! ```text
//!    SIGHUP / SIGTERM / SIGINT / SIGQUIT
//!                 │
//!                 ▼
//!        ┌─────────────────┐     reload     ┌──────────────┐  slot 3 + marker  ┌───────────┐
//!        │    lifecycle    │───────────────▶│   upgrade    │──────────────────▶│ successor │
//!        │  orchestrator   │                │   spawner    │                   │  process  │
//!        └────────┬────────┘                └──────────────┘                   └─────┬─────┘
//!                 │ drain                                                            │
//!                 ▼                                                                  ▼
//!        ┌─────────────────┐    shutdown    ┌──────────────┐   accept   ┌────────────────────┐
//!        │    shutdown     │───────────────▶│     http     │◀───────────│ net: inherited or  │
//!        │   coordinator   │                │    server    │            │ fresh listener     │
//!        └─────────────────┘                └──────────────┘            └────────────────────┘
//! ```
//!
//! Two strategies share the `upgrade::Upgrader` contract:
//! - `GracefulUpgrader`: this process spawns its successor and drains
//! - `BrokerUpgrader`: a broker actor spawns, waits for readiness, then
//!   fires `Exit()`

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod upgrade;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::EngineConfig;
pub use http::{Engine, EngineError, HttpServer, Server};
pub use lifecycle::{ShutdownCoordinator, DRAIN_DEADLINE};
pub use upgrade::{BrokerUpgrader, GracefulUpgrader, Upgrader};
