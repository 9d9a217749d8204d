//! Signal-driven orchestration of the self-managed upgrade strategy.
//!
//! # Responsibilities
//! - Consume `UpgradeSignal`s one at a time from a single channel
//! - Drive `UpgradeState` through reload or termination to `Exited`
//! - Hand off to the shutdown coordinator for the drain
//!
//! # Data Flow
//! ```text
//! Running ─ Reload ─▶ ReloadRequested ─ spawn ok ─▶ ChildSpawned ─▶ Draining ─▶ Exited
//!    ▲                      │
//!    └──── spawn failed ────┘
//! Running ─ Terminate ─▶ Draining ─▶ Exited
//! ```
//!
//! # Design Decisions
//! - No lock guards the state: there is exactly one consumer
//! - A failed reload is logged and abandoned, never retried
//! - A closed signal channel is treated as a terminate request

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::http::Server;
use crate::lifecycle::shutdown::{ShutdownCoordinator, ShutdownError};
use crate::lifecycle::signals::UpgradeSignal;
use crate::observability::metrics;
use crate::upgrade::SpawnError;

/// Where the self-managed upgrade currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Running,
    ReloadRequested,
    ChildSpawned,
    Draining,
    Exited,
}

impl UpgradeState {
    /// Whether `self → next` is a legal step.
    pub fn can_advance_to(self, next: UpgradeState) -> bool {
        use UpgradeState::*;
        matches!(
            (self, next),
            (Running, ReloadRequested)
                | (ReloadRequested, ChildSpawned)
                | (ReloadRequested, Running)
                | (ChildSpawned, Draining)
                | (Running, Draining)
                | (Draining, Exited)
        )
    }
}

/// Starts a successor process. Resolves to the child's pid.
pub trait ReloadAction: Send + Sync {
    fn reload(&self) -> BoxFuture<'_, Result<u32, SpawnError>>;
}

/// How the orchestrator reached `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Reloaded { child_pid: u32 },
    Terminated,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("orchestrator has already exited")]
    Exited,
}

/// Single-consumer state machine over the signal channel.
#[derive(Debug)]
pub struct Orchestrator {
    state: UpgradeState,
    history: Vec<UpgradeState>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: UpgradeState::Running,
            history: vec![UpgradeState::Running],
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[UpgradeState] {
        &self.history
    }

    fn advance(&mut self, next: UpgradeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "Upgrade state changed");
        self.state = next;
        self.history.push(next);
    }

    /// Process signals until the process should exit.
    ///
    /// Returns once `Exited` is reached. The drain's outcome is the result:
    /// a timeout is reported as an error but the state is still `Exited`.
    pub async fn run<S: Server + ?Sized>(
        &mut self,
        signals: &mut mpsc::Receiver<UpgradeSignal>,
        action: &dyn ReloadAction,
        coordinator: &ShutdownCoordinator,
        server: &S,
    ) -> Result<Transition, OrchestratorError> {
        if self.state != UpgradeState::Running {
            return Err(OrchestratorError::Exited);
        }

        let transition = loop {
            let signal = signals.recv().await.unwrap_or_else(|| {
                tracing::warn!("Signal channel closed; shutting down");
                UpgradeSignal::Terminate
            });

            match signal {
                UpgradeSignal::Terminate => break Transition::Terminated,
                UpgradeSignal::Reload => {
                    self.advance(UpgradeState::ReloadRequested);
                    match action.reload().await {
                        Ok(child_pid) => {
                            metrics::record_reload("spawned");
                            self.advance(UpgradeState::ChildSpawned);
                            break Transition::Reloaded { child_pid };
                        }
                        Err(e) => {
                            let outcome = match e {
                                SpawnError::ReadinessTimeout { .. }
                                | SpawnError::ReadinessFailed { .. } => "not_ready",
                                _ => "failed",
                            };
                            metrics::record_reload(outcome);
                            tracing::error!(error = %e, "Graceful reload failed; still serving");
                            self.advance(UpgradeState::Running);
                        }
                    }
                }
            }
        };

        self.advance(UpgradeState::Draining);
        let drained = coordinator.drain(server).await;
        self.advance(UpgradeState::Exited);

        if let Err(e) = drained {
            tracing::error!(error = %e, "Drain did not complete cleanly");
            return Err(e.into());
        }
        match transition {
            Transition::Reloaded { child_pid } => {
                tracing::info!(new_pid = child_pid, "Graceful reload completed")
            }
            Transition::Terminated => tracing::info!("Graceful shutdown completed"),
        }
        Ok(transition)
    }
}
