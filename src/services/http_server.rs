//! HTTP server service: binds the Axum app and runs it in a background task.
//!
//! Depends on the cache and encoder services so that nothing is served before
//! the cache directory exists. Runs until [stop](Service::stop), which lets
//! in-flight requests finish.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::app::{AppState, build_app};
use crate::services::manager::{Service, ServiceHealth};

/// HTTP server service: binds and serves the Axum app in a background task.
pub struct HttpServerService {
    state: AppState,
    addr: SocketAddr,
    /// Bound address; set in start(). Differs from `addr` when binding port 0.
    local_addr: RwLock<Option<SocketAddr>>,
    /// JoinHandle for the server task; set in start(), taken in stop().
    join_handle: RwLock<Option<tokio::task::JoinHandle<Result<()>>>>,
    /// Send to trigger server shutdown; set in start(), taken in stop().
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl HttpServerService {
    pub fn new(state: AppState, addr: SocketAddr) -> Self {
        Self {
            state,
            addr,
            local_addr: RwLock::new(None),
            join_handle: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }
}

#[async_trait]
impl Service for HttpServerService {
    fn name(&self) -> &str {
        "http"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["cache".to_string(), "encoder".to_string()]
    }

    async fn start(&self) -> Result<()> {
        info!(service = "http", "HTTP server service starting");

        let app = build_app(self.state.clone());
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("HTTP server: bind {} failed", self.addr))?;
        let local_addr = listener.local_addr().context("HTTP server: local address")?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .context("axum::serve")
        });

        *self.join_handle.write() = Some(join);
        *self.shutdown_tx.write() = Some(shutdown_tx);
        *self.local_addr.write() = Some(local_addr);

        info!(service = "http", "Listening on http://{}", local_addr);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tx = self.shutdown_tx.write().take();
        let handle = self.join_handle.write().take();
        drop(tx); // dropping the sender unblocks the server task's recv
        if let Some(h) = handle {
            h.await.context("HTTP server task panicked")??;
        }
        *self.local_addr.write() = None;
        info!(service = "http", "HTTP server service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match self.join_handle.read().as_ref() {
            Some(handle) if !handle.is_finished() => Ok(ServiceHealth::healthy()),
            _ => Ok(ServiceHealth::unhealthy("server task not running")),
        }
    }
}
