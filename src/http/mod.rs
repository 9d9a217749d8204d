//! HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! Engine (engine.rs)
//!     → route/merge into an axum Router
//!     → build_server: timeout, access log, panic recovery layers
//!     → server.rs serves on the upgrader's listener
//!     → lifecycle drains it through the `Server` contract
//! ```

pub mod engine;
pub mod server;

pub use engine::{Engine, EngineError};
pub use server::{HttpServer, Server};
