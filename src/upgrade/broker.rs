//! Delegated-broker upgrade strategy.
//!
//! # Responsibilities
//! - Own the control-plane state (`Serving → Upgrading → HandedOff | Stopped`)
//! - Run upgrades on a background actor task, one at a time
//! - Hand the listener and a readiness pipe to the successor and fire
//!   `Exit()` only after it reports ready
//!
//! # Design Decisions
//! - Readiness is always a handshake here; the parent never exits early
//! - A failed upgrade terminates the successor and returns to `Serving`
//! - `WatchSignal` reacts to SIGHUP only; termination belongs to the caller
//! - `Stop` does not queue behind the actor; it takes effect immediately and
//!   an upgrade still in flight cannot undo it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::instrument::WithSubscriber;
use tracing::Instrument;

use crate::config::UpgradeConfig;
use crate::lifecycle::{forward_os_signals, SignalSet, UpgradeSignal};
use crate::net::{AcquireError, BoundSocket, ListenerSlot};
use crate::observability::metrics;
use crate::upgrade::{
    report_ready, ExitSignal, SpawnError, Spawner, UpgradeError, Upgrader, UpgraderParts,
};

/// Control-plane state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Serving,
    Upgrading,
    HandedOff,
    Stopped,
}

#[derive(Debug, Error)]
#[error("broker actor is gone")]
struct ActorGone;

enum Command {
    Upgrade(oneshot::Sender<Result<u32, SpawnError>>),
}

struct Inner {
    parts: UpgraderParts,
    slot: ListenerSlot,
    spawner: Spawner,
    readiness_timeout: Duration,
    state: Mutex<BrokerState>,
    exit: watch::Sender<bool>,
    commands: mpsc::Sender<Command>,
    ready: AtomicBool,
    watching: AtomicBool,
}

/// Upgrader whose hand-offs are arbitrated by an in-process broker actor.
///
/// Cheap to clone; clones share one broker.
#[derive(Clone)]
pub struct BrokerUpgrader {
    inner: Arc<Inner>,
}

impl BrokerUpgrader {
    /// Create the broker and start its actor. Must be called inside a Tokio
    /// runtime.
    pub fn new(parts: UpgraderParts, readiness_timeout: Duration) -> Self {
        let (commands, rx) = mpsc::channel(1);
        let (exit, _) = watch::channel(false);
        let span = parts.identity.span();
        let inner = Arc::new(Inner {
            spawner: parts.spawner(),
            parts,
            slot: ListenerSlot::new(),
            readiness_timeout,
            state: Mutex::new(BrokerState::Serving),
            exit,
            commands,
            ready: AtomicBool::new(false),
            watching: AtomicBool::new(false),
        });

        tokio::spawn(
            run_actor(Arc::downgrade(&inner), rx)
                .instrument(span)
                .with_current_subscriber(),
        );
        Self { inner }
    }

    /// OS-backed broker configured from `config`.
    pub fn from_config(config: &UpgradeConfig) -> Self {
        Self::new(
            UpgraderParts::os(SignalSet::reload_only()),
            Duration::from_secs(config.readiness_timeout_secs),
        )
    }

    pub fn state(&self) -> BrokerState {
        *self.inner.lock_state()
    }

    pub fn slot(&self) -> &ListenerSlot {
        &self.inner.slot
    }

    /// Ask the broker to hand off to a new process. Resolves once the
    /// successor is ready (and `Exit()` has fired) or the attempt failed.
    pub async fn upgrade(&self) -> Result<u32, SpawnError> {
        {
            let mut state = self.inner.lock_state();
            match *state {
                BrokerState::Serving => *state = BrokerState::Upgrading,
                BrokerState::Upgrading => return Err(SpawnError::InProgress),
                BrokerState::HandedOff | BrokerState::Stopped => return Err(SpawnError::Finished),
            }
        }

        let (reply, response) = oneshot::channel();
        let sent = self.inner.commands.send(Command::Upgrade(reply)).await;
        let result = match sent {
            Ok(()) => response.await.map_err(|_| ActorGone),
            Err(_) => Err(ActorGone),
        };
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Upgrade request lost");
            self.inner.settle(BrokerState::Serving);
            Err(SpawnError::Finished)
        })
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leave `Upgrading`; a concurrent `Stop` wins.
    fn settle(&self, next: BrokerState) {
        let mut state = self.lock_state();
        if *state == BrokerState::Upgrading {
            *state = next;
        }
    }

    async fn perform_upgrade(&self) -> Result<u32, SpawnError> {
        let child = match self.spawner.spawn(&self.slot, true) {
            Ok(child) => child,
            Err(e) => {
                metrics::record_reload("failed");
                self.settle(BrokerState::Serving);
                return Err(e);
            }
        };

        let waited = match child.readiness {
            Some(pipe) => pipe.wait(child.pid, self.readiness_timeout).await,
            None => Err(SpawnError::ReadinessFailed {
                pid: child.pid,
                reason: "no readiness pipe".to_string(),
            }),
        };
        if let Err(e) = waited {
            metrics::record_reload("not_ready");
            self.spawner.abandon(child.pid);
            self.settle(BrokerState::Serving);
            return Err(e);
        }

        metrics::record_reload("spawned");
        self.settle(BrokerState::HandedOff);
        self.exit.send_replace(true);
        tracing::info!(new_pid = child.pid, "Upgrade completed; handing off");
        Ok(child.pid)
    }
}

async fn run_actor(inner: Weak<Inner>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match command {
            Command::Upgrade(reply) => {
                let result = inner.perform_upgrade().await;
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Upgrade failed; still serving");
                }
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!("Broker actor stopped");
}

impl Upgrader for BrokerUpgrader {
    fn listen(&self, network: &str, address: &str) -> Result<BoundSocket, AcquireError> {
        let inherit = self.inner.parts.marker.is_set();
        self.inner
            .slot
            .acquire(network, address, inherit, self.inner.parts.sockets.as_ref())
    }

    fn ready(&self) -> Result<(), UpgradeError> {
        if self.inner.ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        report_ready(&self.inner.parts.identity)
    }

    fn exit(&self) -> ExitSignal {
        ExitSignal::new(self.inner.exit.subscribe())
    }

    fn stop(&self) {
        {
            let mut state = self.inner.lock_state();
            if *state != BrokerState::HandedOff {
                *state = BrokerState::Stopped;
            }
        }
        self.inner.slot.release();
        self.inner.exit.send_replace(true);
    }

    fn watch_signal(&self) -> Result<(), UpgradeError> {
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::AlreadyWatching);
        }
        let signals = SignalSet {
            reload: self.inner.parts.signals.reload,
            ..SignalSet::none()
        };
        if signals.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(1);
        forward_os_signals(signals, tx).map_err(UpgradeError::Signal)?;

        let broker = self.clone();
        let task = async move {
            while let Some(signal) = rx.recv().await {
                if signal != UpgradeSignal::Reload {
                    continue;
                }
                match broker.upgrade().await {
                    Ok(pid) => tracing::info!(new_pid = pid, "Upgrade requested by signal succeeded"),
                    Err(SpawnError::Finished) => break,
                    Err(e) => tracing::warn!(error = %e, "Upgrade requested by signal failed"),
                }
            }
        };
        tokio::spawn(
            task.instrument(self.inner.parts.identity.span())
                .with_current_subscriber(),
        );
        Ok(())
    }
}
