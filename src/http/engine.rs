//! Engine: a router plus the server lifecycle around it.
//!
//! # Responsibilities
//! - Compose an axum `Router` and expose `route`/`merge` delegates
//! - Collect shutdown callbacks (`register_on_shutdown`)
//! - Run the server under one of the lifecycles:
//!   - `graceful_serve`: own address, drain on SIGINT/SIGTERM/SIGQUIT
//!   - `graceful_run`: self-managed hand-off on SIGHUP
//!   - `run`: delegated broker hand-off on SIGHUP
//!
//! # Design Decisions
//! - Composition, not embedding: `Engine` holds the router and delegates
//! - Every run path drains through the same `ShutdownCoordinator`
//! - Lifecycle logs sit in a `process{pid, ppid}` span

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::routing::MethodRouter;
use axum::Router;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument::WithSubscriber;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::http::server::{HttpServer, Server};
use crate::lifecycle::{
    shutdown_signal, ProcessIdentity, ShutdownCoordinator, ShutdownError, Transition,
    UpgradeSignal,
};
use crate::net::{AcceptSocket, AcquireError};
use crate::upgrade::{BrokerUpgrader, GracefulUpgrader, UpgradeError, Upgrader};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("server error: {0}")]
    Server(io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signal(io::Error),
}

/// A router with a zero-downtime lifecycle.
pub struct Engine {
    router: Router,
    config: EngineConfig,
    identity: ProcessIdentity,
    coordinator: Arc<ShutdownCoordinator>,
    span: tracing::Span,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let identity = ProcessIdentity::current();
        Self {
            router: Router::new(),
            coordinator: Arc::new(ShutdownCoordinator::new(config.upgrade.callback_failure)),
            span: identity.span(),
            identity,
            config,
        }
    }

    pub fn route(mut self, path: &str, handler: MethodRouter) -> Self {
        self.router = self.router.route(path, handler);
        self
    }

    pub fn merge(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Run `action` during drain, after earlier registrations. Returns
    /// `false` once draining has begun.
    pub fn register_on_shutdown(&self, action: impl FnOnce() + Send + 'static) -> bool {
        self.coordinator.register(action)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Span framing lifecycle logs with this process's identity.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Build the HTTP server with the configured middleware.
    #[allow(deprecated)]
    pub fn build_server(&self) -> HttpServer {
        let mut router = self
            .router
            .clone()
            .layer(TimeoutLayer::new(self.config.request_timeout()));
        if self.config.enable_access_log {
            router = router.layer(TraceLayer::new_for_http());
        }
        if self.config.enable_recovery {
            router = router.layer(CatchPanicLayer::new());
        }
        HttpServer::new(router, self.config.listen_address())
    }

    /// Serve on the server's own address until SIGINT/SIGTERM (or SIGQUIT
    /// when enabled), then drain.
    pub async fn graceful_serve<S: Server + ?Sized>(&self, server: &S) -> Result<(), EngineError> {
        let shutdown =
            shutdown_signal(self.config.upgrade.stop_on_quit).map_err(EngineError::Signal)?;
        self.graceful_serve_until(server, shutdown).await
    }

    /// `graceful_serve` with an explicit shutdown trigger.
    pub async fn graceful_serve_until<S, F>(&self, server: &S, shutdown: F) -> Result<(), EngineError>
    where
        S: Server + ?Sized,
        F: Future<Output = ()>,
    {
        self.serve_until(server, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn serve_until<S, F>(&self, server: &S, shutdown: F) -> Result<(), EngineError>
    where
        S: Server + ?Sized,
        F: Future<Output = ()>,
    {
        let mut serving = tokio::spawn(server.listen_and_serve().with_current_subscriber());

        tokio::select! {
            joined = &mut serving => {
                let e = server_failure(joined);
                tracing::error!(error = %e, "Server stopped before shutdown was requested");
                return Err(EngineError::Server(e));
            }
            () = shutdown => tracing::info!("Shutdown requested"),
        }

        if let Err(e) = self.coordinator.drain(server).await {
            serving.abort();
            return Err(e.into());
        }
        if let Ok(Err(e)) = serving.await {
            tracing::warn!(error = %e, "Server reported an error while stopping");
        }
        tracing::info!("Graceful shutdown completed");
        Ok(())
    }

    /// Self-managed zero-downtime run with an OS-backed upgrader.
    pub async fn graceful_run(&self) -> Result<Transition, EngineError> {
        let upgrader = GracefulUpgrader::from_config(&self.config.upgrade);
        self.graceful_run_with(&upgrader).await
    }

    /// Serve on `upgrader`'s listener and let its orchestrator decide when
    /// to hand off or stop.
    pub async fn graceful_run_with(
        &self,
        upgrader: &GracefulUpgrader,
    ) -> Result<Transition, EngineError> {
        self.run_graceful(upgrader)
            .instrument(self.span.clone())
            .await
    }

    async fn run_graceful(&self, upgrader: &GracefulUpgrader) -> Result<Transition, EngineError> {
        let server = self.build_server();
        let accept = self.listen(upgrader)?;

        let signals = upgrader.signal_sender();
        let serving = server.serve(accept);
        let serving = tokio::spawn(
            async move {
                if let Err(e) = serving.await {
                    tracing::error!(error = %e, "Server error; shutting down");
                    let _ = signals.send(UpgradeSignal::Terminate).await;
                }
            }
            .in_current_span()
            .with_current_subscriber(),
        );

        let outcome = match upgrader.ready().and_then(|()| upgrader.watch_signal()) {
            Ok(()) => upgrader.wait_for_signal(&server, &self.coordinator).await,
            Err(e) => {
                upgrader.stop();
                Err(e)
            }
        };
        if outcome.is_err() {
            // Nothing else stops the accept loop on failure.
            serving.abort();
        }
        Ok(outcome?)
    }

    /// Delegated-broker run with an OS-backed broker. SIGINT/SIGTERM (and
    /// SIGQUIT when enabled) stop without handing off.
    pub async fn run(&self) -> Result<(), EngineError> {
        let broker = BrokerUpgrader::from_config(&self.config.upgrade);
        let shutdown =
            shutdown_signal(self.config.upgrade.stop_on_quit).map_err(EngineError::Signal)?;
        self.run_with(&broker, shutdown).await
    }

    /// Serve on `upgrader`'s listener until its exit notification fires,
    /// `shutdown` resolves, or the server fails; then drain and stop.
    pub async fn run_with<U, F>(&self, upgrader: &U, shutdown: F) -> Result<(), EngineError>
    where
        U: Upgrader + ?Sized,
        F: Future<Output = ()>,
    {
        self.run_delegated(upgrader, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn run_delegated<U, F>(&self, upgrader: &U, shutdown: F) -> Result<(), EngineError>
    where
        U: Upgrader + ?Sized,
        F: Future<Output = ()>,
    {
        let server = self.build_server();
        let accept = self.listen(upgrader)?;

        let mut serving = tokio::spawn(server.serve(accept).with_current_subscriber());
        if let Err(e) = upgrader.ready().and_then(|()| upgrader.watch_signal()) {
            serving.abort();
            upgrader.stop();
            return Err(e.into());
        }

        tokio::select! {
            () = upgrader.exit().wait() => tracing::info!("Exit requested"),
            () = shutdown => tracing::info!("Shutdown requested"),
            joined = &mut serving => {
                let e = server_failure(joined);
                tracing::error!(error = %e, "Server error; stopping");
            }
        }

        let drained = self.coordinator.drain(&server).await;
        upgrader.stop();
        if drained.is_err() {
            serving.abort();
        }
        drained?;
        tracing::info!("Graceful shutdown completed");
        Ok(())
    }

    fn listen<U: Upgrader + ?Sized>(&self, upgrader: &U) -> Result<AcceptSocket, EngineError> {
        let address = self.config.listen_address();
        let socket = upgrader.listen("tcp", &address)?;
        let accept = socket.into_accept().map_err(EngineError::Server)?;
        tracing::info!(address = %address, local_addr = ?accept.local_addr(), "Listening");
        Ok(accept)
    }
}

/// Turn the outcome of a serving task that ended on its own into an error.
fn server_failure(joined: Result<io::Result<()>, tokio::task::JoinError>) -> io::Error {
    match joined {
        Ok(Ok(())) => io::Error::other("server exited unexpectedly"),
        Ok(Err(e)) => e,
        Err(e) => io::Error::other(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use std::time::Duration;
    use tower::ServiceExt;

    fn config() -> EngineConfig {
        EngineConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    async fn status(engine: &Engine, path: &str) -> StatusCode {
        let request = Request::get(path).body(Body::empty()).unwrap();
        engine
            .build_server()
            .router()
            .oneshot(request)
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn delegates_compose_routes() {
        let engine = Engine::new(config())
            .route("/a", get(|| async { "a" }))
            .merge(Router::new().route("/b", get(|| async { "b" })));

        assert_eq!(engine.build_server().address(), "127.0.0.1:0");
        assert_eq!(status(&engine, "/a").await, StatusCode::OK);
        assert_eq!(status(&engine, "/b").await, StatusCode::OK);
        assert_eq!(status(&engine, "/c").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recovery_turns_panics_into_500() {
        async fn boom() -> &'static str {
            panic!("handler failed")
        }
        let engine = Engine::new(config()).route("/boom", get(boom));
        assert_eq!(status(&engine, "/boom").await, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let mut config = config();
        config.read_timeout_secs = 1;
        config.write_timeout_secs = 1;
        let engine = Engine::new(config).route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "late"
            }),
        );
        assert_eq!(status(&engine, "/slow").await, StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn shutdown_registrations_reach_coordinator() {
        let engine = Engine::new(config());
        assert!(engine.register_on_shutdown(|| {}));
        assert!(engine.register_on_shutdown(|| {}));
        assert_eq!(engine.coordinator().len(), 2);
    }
}
