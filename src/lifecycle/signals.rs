//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGHUP, SIGTERM, SIGINT, optionally SIGQUIT)
//! - Translate signals to `UpgradeSignal`s on one channel
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Exactly one consumer reads the channel; handlers only forward
//! - SIGHUP means reload, never shutdown

use std::future::Future;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::Instrument;

/// What the orchestrator is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeSignal {
    Reload,
    Terminate,
}

/// Which OS signals to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet {
    /// SIGHUP → `Reload`.
    pub reload: bool,
    /// SIGTERM and SIGINT → `Terminate`.
    pub terminate: bool,
    /// SIGQUIT → `Terminate`.
    pub quit: bool,
}

impl SignalSet {
    /// Everything the self-managed strategy reacts to.
    pub fn all(quit: bool) -> Self {
        Self {
            reload: true,
            terminate: true,
            quit,
        }
    }

    /// Only SIGHUP; the broker strategy leaves termination to its caller.
    pub fn reload_only() -> Self {
        Self {
            reload: true,
            terminate: false,
            quit: false,
        }
    }

    /// No OS signals; signals arrive only through the channel sender.
    pub fn none() -> Self {
        Self {
            reload: false,
            terminate: false,
            quit: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.reload || self.terminate || self.quit)
    }
}

/// Install handlers for `set` and forward them to `tx` from a background task.
///
/// Handlers are registered before this returns, so registration errors
/// surface here rather than in the task.
pub fn forward_os_signals(
    set: SignalSet,
    tx: mpsc::Sender<UpgradeSignal>,
) -> io::Result<JoinHandle<()>> {
    let mut hup = set.reload.then(|| signal(SignalKind::hangup())).transpose()?;
    let mut term = set.terminate.then(|| signal(SignalKind::terminate())).transpose()?;
    let mut int = set.terminate.then(|| signal(SignalKind::interrupt())).transpose()?;
    let mut quit = set.quit.then(|| signal(SignalKind::quit())).transpose()?;

    let task = async move {
        loop {
            let (name, event) = tokio::select! {
                Some(()) = recv(&mut hup) => ("SIGHUP", UpgradeSignal::Reload),
                Some(()) = recv(&mut term) => ("SIGTERM", UpgradeSignal::Terminate),
                Some(()) = recv(&mut int) => ("SIGINT", UpgradeSignal::Terminate),
                Some(()) = recv(&mut quit) => ("SIGQUIT", UpgradeSignal::Terminate),
                else => break,
            };
            tracing::info!(signal = name, "Signal received");
            if tx.send(event).await.is_err() {
                break;
            }
        }
        tracing::debug!("Signal forwarder stopped");
    };

    Ok(tokio::spawn(task.in_current_span().with_current_subscriber()))
}

async fn recv(stream: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(s) => s.recv().await,
        None => None,
    }
}

/// Register SIGINT, SIGTERM and (when `quit`) SIGQUIT. The returned future
/// resolves on the first of them.
pub fn shutdown_signal(quit: bool) -> io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = quit.then(|| signal(SignalKind::quit())).transpose()?;

    Ok(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            Some(()) = recv(&mut sigquit) => "SIGQUIT",
        };
        tracing::info!(signal = name, "Shutdown signal received");
    })
}
