//! Upgrade subsystem: zero-downtime restart strategies.
//!
//! # Data Flow
//! ```text
//! Self-managed (graceful.rs):
//!     Listen → Ready → WatchSignal → orchestrator
//!         SIGHUP → spawner.rs (slot 3 + marker) → [readiness.rs] → drain → exit
//!
//! Delegated broker (broker.rs):
//!     Listen → Ready → WatchSignal (SIGHUP only)
//!         SIGHUP → broker actor → spawn + handshake → Exit() fires → drain → exit
//! ```
//!
//! # Design Decisions
//! - Both strategies implement one `Upgrader` capability set and are picked
//!   explicitly by the composition root
//! - Syscalls sit behind `SocketSource` and `ProcessLauncher` so tests can
//!   intercept them
//! - `Stop` is safe before `Listen`; signal watching starts at most once

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::lifecycle::{ProcessIdentity, SignalSet};
use crate::net::descriptor::{self, RELOAD_MARKER_ENV};
use crate::net::{AcquireError, BoundSocket, OsSockets, SocketSource};

pub mod broker;
pub mod graceful;
pub mod readiness;
pub mod spawner;

pub use broker::{BrokerState, BrokerUpgrader};
pub use graceful::GracefulUpgrader;
pub use readiness::ReadinessWait;
pub use spawner::{OsLauncher, ProcessLauncher, SpawnError, SpawnPlan, Spawner};

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Orchestrator(#[from] crate::lifecycle::OrchestratorError),

    #[error("signal watching already started")]
    AlreadyWatching,

    #[error("failed to install signal handlers: {0}")]
    Signal(io::Error),

    #[error("failed to report readiness to parent: {0}")]
    Ready(io::Error),
}

/// Public contract shared by both upgrade strategies.
pub trait Upgrader: Send + Sync {
    /// Obtain this process's listener. Succeeds at most once.
    fn listen(&self, network: &str, address: &str) -> Result<BoundSocket, AcquireError>;

    /// Report that this process is prepared to serve.
    fn ready(&self) -> Result<(), UpgradeError>;

    /// One-shot notification that this process should go away.
    fn exit(&self) -> ExitSignal;

    /// Give up the listener and fire `exit`. Safe to call at any time.
    fn stop(&self);

    /// Start reacting to OS signals. Fails if already started.
    fn watch_signal(&self) -> Result<(), UpgradeError>;
}

/// Receiver side of an upgrader's exit notification.
#[derive(Debug, Clone)]
pub struct ExitSignal(watch::Receiver<bool>);

impl ExitSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once exit has fired (or its sender is gone).
    pub async fn wait(mut self) {
        let _ = self.0.wait_for(|fired| *fired).await;
    }
}

/// Where `Listen` learns whether to inherit its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerSource {
    /// Read `GRACEFUL_RESTART` from the process environment.
    #[default]
    Environment,
    /// Fixed answer.
    Fixed(bool),
}

impl MarkerSource {
    pub fn is_set(&self) -> bool {
        match self {
            MarkerSource::Environment => descriptor::env_marker(RELOAD_MARKER_ENV),
            MarkerSource::Fixed(value) => *value,
        }
    }
}

/// OS seams an upgrader is built from.
#[derive(Clone)]
pub struct UpgraderParts {
    pub sockets: Arc<dyn SocketSource>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub marker: MarkerSource,
    pub signals: SignalSet,
    pub identity: ProcessIdentity,
}

impl UpgraderParts {
    /// Real sockets, real processes, environment marker.
    pub fn os(signals: SignalSet) -> Self {
        Self {
            sockets: Arc::new(OsSockets),
            launcher: Arc::new(OsLauncher),
            marker: MarkerSource::Environment,
            signals,
            identity: ProcessIdentity::current(),
        }
    }

    pub(crate) fn spawner(&self) -> Spawner {
        Spawner::new(self.launcher.clone(), self.identity)
    }
}

/// Child side of a readiness handshake shared by both strategies.
pub(crate) fn report_ready(identity: &ProcessIdentity) -> Result<(), UpgradeError> {
    let notified = readiness::notify_parent().map_err(UpgradeError::Ready)?;
    tracing::info!(
        pid = identity.pid,
        ppid = identity.parent_pid,
        notified_parent = notified,
        "Process ready"
    );
    Ok(())
}
