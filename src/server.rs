//!
//! pkgindex TCP front-end
//! ----------------------
//! This module binds the stream listener and farms accepted connections out
//! to a fixed pool of long-lived workers over a bounded queue, so the pool
//! size directly bounds how many clients are served concurrently and a full
//! queue back-pressures the accept loop instead of spawning without limit.
//!
//! Responsibilities:
//! - Reuse-address bind so a service restart does not trip over TIME_WAIT.
//! - Accept loop feeding the bounded connection queue.
//! - Worker pool running one connection handler to completion at a time.
//! - Watch-channel shutdown: stop accepting, dump the final store state, exit.
//!
//! The index itself lives in `crate::store`; per-connection framing and
//! dispatch live in `handler`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::server::handler::{serve_connection, CONN_ID_COUNTER};
use crate::store::SharedIndex;

pub mod handler;
pub mod request;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
/// Pool size tuned for bursts of >50 simultaneous clients that hold their
/// connection open for a whole command script.
pub const DEFAULT_WORKERS: usize = 100;

/// Listener and pool settings. None of these change the wire contract.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: DEFAULT_HOST.to_string(), port: DEFAULT_PORT, workers: DEFAULT_WORKERS }
    }
}

/// Run a fresh index service until the process interrupt signal arrives.
pub async fn run(config: ServerConfig) -> Result<()> {
    let index = SharedIndex::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "pkgindex::server", "failed to listen for interrupt: {}", e);
            return;
        }
        info!(target: "pkgindex::server", "interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    serve(index, config, shutdown_rx).await
}

/// Accept loop plus worker pool over an existing index. Returns once
/// `shutdown` flips to true (or its sender goes away); in-flight connections
/// finish on their workers or are dropped with the runtime.
pub async fn serve(
    index: SharedIndex,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = bind_reuse(addr)?;
    let local = listener.local_addr()?;
    info!(target: "pkgindex::server", "listening on {} with {} workers", local, config.workers);

    // Accepted connections wait here for a free worker. Capacity matches the
    // pool, so a full house blocks the accept loop rather than growing a
    // backlog without bound.
    let (conn_tx, conn_rx) = mpsc::channel::<(TcpStream, u64)>(config.workers.max(1));
    let conn_rx = Arc::new(tokio::sync::Mutex::new(conn_rx));

    for worker_id in 0..config.workers.max(1) {
        let conn_rx = conn_rx.clone();
        let index = index.clone();
        tokio::spawn(async move {
            loop {
                let next = { conn_rx.lock().await.recv().await };
                let Some((stream, conn_id)) = next else { break };
                let peer = stream
                    .peer_addr()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string());
                debug!(
                    target: "pkgindex::server",
                    "worker={} conn_id={} peer={} starting handler", worker_id, conn_id, peer
                );
                if let Err(e) = serve_connection(stream, index.clone(), conn_id).await {
                    error!(
                        target: "pkgindex::server",
                        "conn_id={} peer={} connection error: {}", conn_id, peer, e
                    );
                }
            }
        });
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Transient accept failures must not take the service down.
                        error!(target: "pkgindex::server", "accept failed: {}", e);
                        continue;
                    }
                };
                let conn_id = CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
                debug!(target: "pkgindex::server", "conn_id={} accepted from {}", conn_id, peer);
                if conn_tx.send((stream, conn_id)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Closing the queue lets idle workers exit; busy ones finish their client.
    drop(conn_tx);
    index.log_state();
    info!(target: "pkgindex::server", "server stopped");
    Ok(())
}

/// Bind with SO_REUSEADDR so restarts do not fail on `address in use`.
fn bind_reuse(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}
