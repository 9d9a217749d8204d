//! Shutdown coordination.
//!
//! # Responsibilities
//! - Keep an ordered registry of cleanup callbacks
//! - Run every callback exactly once, in registration order, before the
//!   server is touched
//! - Ask the server to stop and wait for it, bounded by `DRAIN_DEADLINE`
//!
//! # Design Decisions
//! - Registration is rejected once a drain has started
//! - A drain is not cancellable: it finishes or times out
//! - A timeout is reported, not retried; the caller still exits

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::CallbackFailure;
use crate::http::Server;
use crate::observability::metrics;

/// Fixed bound on how long the server may take to stop.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Drain failure.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("server did not stop within {deadline:?}")]
    Timeout { deadline: Duration },

    #[error("shutdown callback #{index} panicked; remaining drain skipped")]
    CallbackPanicked { index: usize },

    #[error("server shutdown failed: {0}")]
    Server(std::io::Error),
}

#[derive(Default)]
struct Registry {
    callbacks: Vec<Callback>,
    draining: bool,
}

/// Ordered cleanup callbacks plus a bounded server drain.
pub struct ShutdownCoordinator {
    registry: Mutex<Registry>,
    policy: CallbackFailure,
}

impl ShutdownCoordinator {
    pub fn new(policy: CallbackFailure) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            policy,
        }
    }

    pub fn policy(&self) -> CallbackFailure {
        self.policy
    }

    /// Append a callback. Returns `false` if a drain has already started.
    pub fn register(&self, action: impl FnOnce() + Send + 'static) -> bool {
        let mut registry = self.lock();
        if registry.draining {
            tracing::warn!("Shutdown callback registered after drain started; ignored");
            return false;
        }
        registry.callbacks.push(Box::new(action));
        true
    }

    pub fn len(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Close the registry and run every callback in order.
    ///
    /// Callbacks run outside the registry lock. A second call finds the
    /// registry empty and does nothing.
    pub fn run_callbacks(&self) -> Result<(), ShutdownError> {
        let callbacks = {
            let mut registry = self.lock();
            registry.draining = true;
            std::mem::take(&mut registry.callbacks)
        };

        let total = callbacks.len();
        for (index, callback) in callbacks.into_iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_ok() {
                continue;
            }
            match self.policy {
                CallbackFailure::Abort => {
                    tracing::error!(index, total, "Shutdown callback panicked; aborting drain");
                    return Err(ShutdownError::CallbackPanicked { index });
                }
                CallbackFailure::Isolate => {
                    tracing::error!(index, total, "Shutdown callback panicked; continuing");
                }
            }
        }
        tracing::debug!(total, "Shutdown callbacks completed");
        Ok(())
    }

    /// Run callbacks, then stop `server` within `DRAIN_DEADLINE`.
    pub async fn drain<S: Server + ?Sized>(&self, server: &S) -> Result<(), ShutdownError> {
        let started = Instant::now();
        tracing::info!(deadline = ?DRAIN_DEADLINE, "Draining");

        if let Err(e) = self.run_callbacks() {
            metrics::record_shutdown("failed", started.elapsed());
            return Err(e);
        }

        match tokio::time::timeout(DRAIN_DEADLINE, server.shutdown()).await {
            Ok(Ok(())) => {
                metrics::record_shutdown("completed", started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Server shutdown failed");
                metrics::record_shutdown("failed", started.elapsed());
                Err(ShutdownError::Server(e))
            }
            Err(_) => {
                tracing::error!(deadline = ?DRAIN_DEADLINE, "Server shutdown timed out");
                metrics::record_shutdown("timeout", started.elapsed());
                Err(ShutdownError::Timeout {
                    deadline: DRAIN_DEADLINE,
                })
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(CallbackFailure::default())
    }
}
