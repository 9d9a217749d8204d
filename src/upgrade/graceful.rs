//! Self-managed upgrade strategy.
//!
//! # Responsibilities
//! - Acquire the listener (inherit under the reload marker, bind otherwise)
//! - Forward OS signals into the orchestrator's channel
//! - Start the successor on reload, optionally wait for it, then drain
//!
//! # Design Decisions
//! - No external broker: this process arbitrates its own hand-off
//! - The readiness wait is configurable; `Disabled` drains right after spawn
//! - The listener is released only after the drain has finished

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::config::UpgradeConfig;
use crate::http::Server;
use crate::lifecycle::{
    forward_os_signals, Orchestrator, ReloadAction, ShutdownCoordinator, SignalSet, Transition,
    UpgradeSignal,
};
use crate::net::{AcquireError, BoundSocket, ListenerSlot};
use crate::upgrade::readiness::ReadinessWait;
use crate::upgrade::{
    report_ready, ExitSignal, SpawnError, Spawner, UpgradeError, Upgrader, UpgraderParts,
};

/// Signals buffered ahead of the orchestrator.
const SIGNAL_BUFFER: usize = 8;

/// Upgrader that hands its listener to a successor it starts itself.
pub struct GracefulUpgrader {
    parts: UpgraderParts,
    slot: ListenerSlot,
    spawner: Spawner,
    readiness: ReadinessWait,
    ready: AtomicBool,
    watching: AtomicBool,
    exit: watch::Sender<bool>,
    signal_tx: mpsc::Sender<UpgradeSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<UpgradeSignal>>>,
}

impl GracefulUpgrader {
    pub fn new(parts: UpgraderParts, readiness: ReadinessWait) -> Self {
        let (exit, _) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        Self {
            spawner: parts.spawner(),
            parts,
            slot: ListenerSlot::new(),
            readiness,
            ready: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            exit,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// OS-backed upgrader configured from `config`.
    pub fn from_config(config: &UpgradeConfig) -> Self {
        Self::new(
            UpgraderParts::os(SignalSet::all(config.stop_on_quit)),
            ReadinessWait::from_config(config),
        )
    }

    /// Inject signals directly, alongside (or instead of) OS signals.
    pub fn signal_sender(&self) -> mpsc::Sender<UpgradeSignal> {
        self.signal_tx.clone()
    }

    pub fn slot(&self) -> &ListenerSlot {
        &self.slot
    }

    /// Run the orchestrator until this process should exit, then release
    /// the listener. Can be awaited only once.
    pub async fn wait_for_signal<S: Server + ?Sized>(
        &self,
        server: &S,
        coordinator: &ShutdownCoordinator,
    ) -> Result<Transition, UpgradeError> {
        let mut signals = self
            .signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(crate::lifecycle::OrchestratorError::Exited)?;

        let span = self.parts.identity.span();
        let result = Orchestrator::new()
            .run(&mut signals, self, coordinator, server)
            .instrument(span)
            .await;

        self.stop();
        Ok(result?)
    }

    async fn reload_and_wait(&self) -> Result<u32, SpawnError> {
        let child = self.spawner.spawn(&self.slot, self.readiness.needs_pipe())?;

        match (self.readiness, child.readiness) {
            (ReadinessWait::Delay(delay), _) => {
                tracing::debug!(new_pid = child.pid, ?delay, "Waiting before drain");
                tokio::time::sleep(delay).await;
            }
            (ReadinessWait::Handshake { timeout }, Some(pipe)) => {
                if let Err(e) = pipe.wait(child.pid, timeout).await {
                    self.spawner.abandon(child.pid);
                    return Err(e);
                }
                tracing::info!(new_pid = child.pid, "New process reported ready");
            }
            _ => {}
        }
        Ok(child.pid)
    }
}

impl ReloadAction for GracefulUpgrader {
    fn reload(&self) -> BoxFuture<'_, Result<u32, SpawnError>> {
        self.reload_and_wait().boxed()
    }
}

impl Upgrader for GracefulUpgrader {
    fn listen(&self, network: &str, address: &str) -> Result<BoundSocket, AcquireError> {
        let inherit = self.parts.marker.is_set();
        self.slot
            .acquire(network, address, inherit, self.parts.sockets.as_ref())
    }

    fn ready(&self) -> Result<(), UpgradeError> {
        if self.ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        report_ready(&self.parts.identity)
    }

    fn exit(&self) -> ExitSignal {
        ExitSignal::new(self.exit.subscribe())
    }

    fn stop(&self) {
        self.slot.release();
        self.exit.send_replace(true);
    }

    fn watch_signal(&self) -> Result<(), UpgradeError> {
        if self.watching.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::AlreadyWatching);
        }
        if self.parts.signals.is_empty() {
            return Ok(());
        }
        forward_os_signals(self.parts.signals, self.signal_tx.clone())
            .map_err(UpgradeError::Signal)?;
        Ok(())
    }
}
