//! Gateway HTTP server.
//!
//! Owns the listening socket and request timeouts, spawns one task per
//! connection with the dispatcher as the sole request handler, and drains
//! in-flight connections for a fixed grace period on shutdown.

use http::StatusCode;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{error_response, Dispatcher};
use crate::error::{GatewayError, Result};

/// How long in-flight connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The gateway's listening server.
pub struct GatewayServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl GatewayServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    pub async fn bind(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::ListenerBind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GatewayError::ListenerBind { addr, source })?;

        info!("bound to {local_addr}");

        Ok(Self {
            listener,
            dispatcher,
            addr: local_addr,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves connections until a shutdown signal is received.
    ///
    /// Each accepted connection runs on its own task; request handling is
    /// bounded by the configured write timeout and header reads by the
    /// read timeout. After the shutdown signal, in-flight connections get
    /// [`SHUTDOWN_GRACE`] to complete before being aborted.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections on {}", self.addr);

        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished connection tasks.
            while connections.try_join_next().is_some() {}

            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {peer_addr}");
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let read_timeout = self.read_timeout;
                            let write_timeout = self.write_timeout;

                            connections.spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let dispatcher = Arc::clone(&dispatcher);
                                    async move {
                                        let response = match timeout(
                                            write_timeout,
                                            dispatcher.dispatch(req, peer_addr),
                                        )
                                        .await
                                        {
                                            Ok(response) => response,
                                            Err(_) => {
                                                warn!(
                                                    peer = %peer_addr,
                                                    "request exceeded write timeout"
                                                );
                                                error_response(
                                                    StatusCode::GATEWAY_TIMEOUT,
                                                    "request timed out",
                                                )
                                            }
                                        };
                                        Ok::<_, Infallible>(response)
                                    }
                                });

                                let result = http1::Builder::new()
                                    .timer(TokioTimer::new())
                                    .header_read_timeout(read_timeout)
                                    .serve_connection(io, service)
                                    .await;
                                if let Err(e) = result {
                                    debug!("connection error from {peer_addr}: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!(
                in_flight = connections.len(),
                "waiting for in-flight connections"
            );
            let drained = timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("shutdown grace period expired, aborting remaining connections");
                connections.abort_all();
            }
        }

        info!("server stopped");
        Ok(())
    }
}

/// Resolves when SIGINT or SIGTERM is received.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
