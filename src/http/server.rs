//! HTTP server setup and the minimal server contract.
//!
//! # Responsibilities
//! - Define `Server`: serve on a listener, serve on its own address, shut down
//! - Back it with axum's `serve` + graceful shutdown
//! - Track running accept loops so `shutdown` can wait for them
//!
//! # Design Decisions
//! - Lifecycle code sees only the `Server` trait, never axum
//! - `shutdown` stops accepting, then waits for in-flight work; the
//!   deadline belongs to the caller

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;

use crate::net::AcceptSocket;

/// What the lifecycle glue needs from a server.
pub trait Server: Send + Sync {
    /// Accept and serve connections on `listener` until shut down.
    fn serve(&self, listener: AcceptSocket) -> BoxFuture<'static, io::Result<()>>;

    /// Bind the server's own address, then `serve` on it.
    fn listen_and_serve(&self) -> BoxFuture<'static, io::Result<()>>;

    /// Stop accepting and wait for in-flight work to finish.
    fn shutdown(&self) -> BoxFuture<'_, io::Result<()>>;
}

struct Inner {
    router: Router,
    address: String,
    stop: watch::Sender<bool>,
    running: watch::Sender<usize>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// axum-backed `Server`. Clones share one server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

/// Counts one accept loop for as long as it lives.
struct Running(Arc<Inner>);

impl Running {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.running.send_modify(|n| *n += 1);
        Self(inner)
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl HttpServer {
    /// Create a server for `router`. `address` is used by `listen_and_serve`.
    pub fn new(router: Router, address: impl Into<String>) -> Self {
        let (stop, _) = watch::channel(false);
        let (running, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                router,
                address: address.into(),
                stop,
                running,
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// The router with every middleware layer applied.
    pub fn router(&self) -> Router {
        self.inner.router.clone()
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Address of the most recent TCP listener this server served on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Number of accept loops currently running.
    pub fn running(&self) -> usize {
        *self.inner.running.borrow()
    }
}

impl Server for HttpServer {
    fn serve(&self, listener: AcceptSocket) -> BoxFuture<'static, io::Result<()>> {
        let inner = self.inner.clone();
        async move {
            let _running = Running::enter(inner.clone());
            let mut stop = inner.stop.subscribe();
            let stopped = async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            };

            if let Some(addr) = listener.local_addr() {
                *inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
            }
            tracing::info!(local_addr = ?listener.local_addr(), "HTTP server starting");

            let router = inner.router.clone();
            match listener {
                AcceptSocket::Tcp(l) => {
                    axum::serve(l, router)
                        .with_graceful_shutdown(stopped)
                        .await?
                }
                AcceptSocket::Unix(l) => {
                    axum::serve(l, router)
                        .with_graceful_shutdown(stopped)
                        .await?
                }
            }

            tracing::info!("HTTP server stopped");
            Ok(())
        }
        .boxed()
    }

    fn listen_and_serve(&self) -> BoxFuture<'static, io::Result<()>> {
        let this = self.clone();
        async move {
            let listener = tokio::net::TcpListener::bind(this.address()).await?;
            this.serve(AcceptSocket::Tcp(listener)).await
        }
        .boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.inner.stop.send_replace(true);
            let mut running = self.inner.running.subscribe();
            let _ = running.wait_for(|n| *n == 0).await;
            Ok(())
        }
        .boxed()
    }
}
