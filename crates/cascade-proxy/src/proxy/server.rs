//! ProxyServer and its accept loop.
//!
//! [`ProxyServer`] implements [`ServerLifecycle`]: each `start` binds the
//! listen address and serves one mode until the returned [`ServerHandle`] is
//! shut down.

use super::handler::{handle_request, RequestHandlerContext};
use super::network::create_reusable_listener;
use crate::mode::{Mode, ServerError, ServerLifecycle, ServerWiring};
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Starts proxy servers on a fixed address.
#[derive(Clone, Debug)]
pub struct ProxyServer {
    addr: SocketAddr,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, drain_timeout: Duration) -> Self {
        Self {
            addr,
            drain_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and start serving `wiring`.
    pub fn spawn(&self, wiring: ServerWiring) -> Result<ServerHandle, ServerError> {
        let listener = create_reusable_listener(self.addr).map_err(|source| ServerError::Bind {
            addr: self.addr,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.addr,
            source,
        })?;
        let mode = wiring.mode;

        let ctx = RequestHandlerContext {
            wiring: Arc::new(wiring),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };
        let abort = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, ctx.clone(), abort.clone()));

        info!("Listening on http://{} ({} mode)", local_addr, mode);
        Ok(ServerHandle {
            mode,
            local_addr,
            ctx,
            abort,
            accept_task,
            drain_timeout: self.drain_timeout,
        })
    }
}

async fn accept_loop(listener: TcpListener, ctx: RequestHandlerContext, abort: CancellationToken) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let conn_ctx = ctx.clone();
        let abort = abort.clone();
        ctx.tasks.spawn(async move {
            let service_ctx = conn_ctx.clone();
            let service = service_fn(move |req| {
                let ctx = service_ctx.clone();
                async move { handle_request(&ctx, req).await }
            });

            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = conn_ctx.shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    tokio::select! {
                        result = conn.as_mut() => result,
                        _ = abort.cancelled() => {
                            debug!("Dropping connection from {} after drain timeout", remote_addr);
                            return;
                        }
                    }
                }
            };
            if let Err(e) = result {
                debug!("Error serving connection from {}: {}", remote_addr, e);
            }
        });
    }
    // Listener dropped here, releasing the port.
}

/// A running proxy server.
pub struct ServerHandle {
    mode: Mode,
    local_addr: SocketAddr,
    ctx: RequestHandlerContext,
    abort: CancellationToken,
    accept_task: JoinHandle<()>,
    drain_timeout: Duration,
}

impl ServerHandle {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close tunnels, give HTTP exchanges `drain_timeout`
    /// to finish, then drop whatever is left.
    pub async fn shutdown(self) {
        self.ctx.shutdown.cancel();
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop for {} ended abnormally: {}", self.local_addr, e);
        }

        self.ctx.tasks.close();
        if tokio::time::timeout(self.drain_timeout, self.ctx.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still open after {:?}; dropping them",
                self.ctx.tasks.len(),
                self.drain_timeout
            );
            self.abort.cancel();
            self.ctx.tasks.wait().await;
        }
        info!("Stopped {} server on {}", self.mode, self.local_addr);
    }
}

#[async_trait]
impl ServerLifecycle for ProxyServer {
    type Handle = ServerHandle;

    async fn start(&self, wiring: ServerWiring) -> Result<ServerHandle, ServerError> {
        self.spawn(wiring)
    }

    async fn shutdown(&self, handle: ServerHandle) {
        handle.shutdown().await;
    }
}
