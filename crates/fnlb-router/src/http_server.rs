//! HTTP Server for the router
//!
//! Binds the client-facing listener and, optionally, a separate admin
//! listener for the control API. Both stop gracefully when the shutdown
//! token is cancelled, together with the expiry sweeper and the health
//! checker.

use fnlb_common::protocol::{FnlbError, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http_router;
use crate::router::Router;

/// HTTP server for the router.
///
/// This server:
/// - Proxies every request not addressed to the control API
/// - Serves the control API under `/1/lb/` (on the admin listener if one
///   is configured)
/// - Provides `/__health`, `/__info` and `/__metrics`
pub struct HttpServer {
    router: Arc<Router>,
}

impl HttpServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Binds `addr` (and `admin_addr`, if given) and serves until `shutdown`
    /// is cancelled.
    pub async fn run(
        self,
        addr: SocketAddr,
        admin_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = bind(addr).await?;
        let admin = match admin_addr {
            Some(admin_addr) => Some(bind(admin_addr).await?),
            None => None,
        };
        self.serve(listener, admin, shutdown).await
    }

    /// Serves on already-bound listeners.
    pub async fn serve(
        self,
        listener: TcpListener,
        admin: Option<TcpListener>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let sweeper = self.router.spawn_sweeper(shutdown.clone());
        let health_checker = self.router.spawn_health_checker(shutdown.clone());

        let local_addr = listener
            .local_addr()
            .map_err(|e| FnlbError::Transport(format!("Failed to get local addr: {}", e)))?;

        let result = match admin {
            Some(admin) => {
                let admin_addr = admin
                    .local_addr()
                    .map_err(|e| FnlbError::Transport(format!("Failed to get local addr: {}", e)))?;
                info!("Router proxy listening on {}", local_addr);
                info!("Router control API listening on {}", admin_addr);

                let proxy = axum::serve(
                    listener,
                    http_router::proxy_app(self.router.clone())
                        .into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(cancelled(shutdown.clone()));

                let control = axum::serve(
                    admin,
                    http_router::admin_app(self.router.clone()).into_make_service(),
                )
                .with_graceful_shutdown(cancelled(shutdown.clone()));

                tokio::try_join!(proxy.into_future(), control.into_future()).map(|_| ())
            }
            None => {
                info!("Router listening on {}", local_addr);
                axum::serve(
                    listener,
                    http_router::app(self.router.clone())
                        .into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(cancelled(shutdown.clone()))
                .await
            }
        };

        sweeper.shutdown().await;
        if let Some(health_checker) = health_checker {
            health_checker.shutdown().await;
        }
        info!("Router stopped");

        result.map_err(|e| FnlbError::Transport(format!("Server error: {}", e)))
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| FnlbError::Transport(format!("Failed to bind to {}: {}", addr, e)))
}

async fn cancelled(token: CancellationToken) {
    token.cancelled().await
}
