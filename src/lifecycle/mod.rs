//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGHUP → Reload
//!     SIGTERM/SIGINT (and SIGQUIT when enabled) → Terminate
//!
//! Orchestrator (orchestrator.rs):
//!     one consumer → Reload: spawn successor → drain
//!                  → Terminate: drain
//!
//! Shutdown (shutdown.rs):
//!     callbacks in order → stop server → wait (30 s deadline) → exit
//! ```
//!
//! # Design Decisions
//! - Signals are handled strictly one at a time
//! - Ordered shutdown: callbacks, then server, then the listener
//! - Shutdown has a deadline: reported as an error, never retried

pub mod identity;
pub mod orchestrator;
pub mod shutdown;
pub mod signals;

pub use identity::ProcessIdentity;
pub use orchestrator::{Orchestrator, OrchestratorError, ReloadAction, Transition, UpgradeState};
pub use shutdown::{ShutdownCoordinator, ShutdownError, DRAIN_DEADLINE};
pub use signals::{forward_os_signals, shutdown_signal, SignalSet, UpgradeSignal};
