// src/server/connection_loop.rs

//! The acceptor: TLS handshake, ban screen, and session bootstrap, plus
//! graceful shutdown of the whole server.

use super::context::{ServerContext, SessionQueues};
use crate::connection::SessionHandler;
use crate::connection::session::ClientSession;
use crate::core::ServerError;
use crate::core::crypt::CryptState;
use crate::core::state::SharedState;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("Failed to create SIGINT stream: {e}");
            return std::future::pending().await;
        }
    };
    #[cfg(unix)]
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("Failed to create SIGTERM stream: {e}");
            return std::future::pending().await;
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }

    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl-C received, initiating graceful shutdown.");
    }
}

/// The main accept loop. Runs until a shutdown signal or a fatal
/// background-task failure, then drains everything.
pub async fn run(mut ctx: ServerContext) {
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            // A background task ending on its own means the server cannot
            // continue: the control loop and datagram tasks are load-bearing.
            Some(result) = ctx.background_tasks.join_next() => {
                match result {
                    Ok(Ok(())) => info!("A background task completed."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {e}. Shutting down."); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            }

            accepted = ctx.listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("Accepted new connection from {addr}");
                        client_tasks.spawn(bootstrap_session(
                            socket,
                            addr,
                            ctx.acceptor.clone(),
                            ctx.shared.clone(),
                            ctx.queues.clone(),
                            ctx.shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {e}"),
                }
            }

            // Reap completed client tasks.
            Some(result) = client_tasks.join_next() => {
                if let Err(e) = result
                    && e.is_panic()
                {
                    error!("A session handler panicked: {e:?}");
                }
            }
        }
    }

    // --- Graceful shutdown sequence ---
    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("No tasks were listening for the shutdown signal.");
    }

    client_tasks.shutdown().await;
    info!("All client connections closed.");

    // The control loop writes its final snapshot on the way out; give the
    // background set a bounded window to drain.
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }
    info!("Server shutdown complete.");
}

/// Handshake, ban screen, crypto setup, then the session fibers. The
/// acceptor never touches loop-owned state.
async fn bootstrap_session(
    socket: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    shared: Arc<SharedState>,
    queues: SessionQueues,
    shutdown_tx: broadcast::Sender<()>,
) {
    let tls_stream = match acceptor.accept(socket).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TLS handshake error for {addr}: {e}");
            return;
        }
    };

    if shared.bans.read().is_banned(addr.ip(), chrono::Utc::now()) {
        info!("Dropping banned peer {addr}");
        return;
    }

    let cert_digest = peer_cert_digest(&tls_stream);
    let crypt = match CryptState::generate() {
        Ok(crypt) => crypt,
        Err(e @ ServerError::Rng(_)) => {
            // A dead RNG poisons every key we would hand out.
            error!("CRITICAL: {e}. Shutting the server down.");
            let _ = shutdown_tx.send(());
            return;
        }
        Err(e) => {
            error!("Session crypto setup failed for {addr}: {e}");
            return;
        }
    };

    let (session, control_rx, voice_in_rx) = ClientSession::new(addr, cert_digest, crypt);
    SessionHandler::new(
        tls_stream,
        session,
        control_rx,
        voice_in_rx,
        queues.events_tx,
        queues.auth_tx,
        queues.voice_tx,
        shared,
    )
    .run()
    .await;
}

/// SHA-1 hex digest of the peer's end-entity certificate, or empty when
/// no certificate was presented.
fn peer_cert_digest(stream: &TlsStream<TcpStream>) -> String {
    let (_, connection) = stream.get_ref();
    connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| hex::encode(Sha1::digest(cert.as_ref())))
        .unwrap_or_default()
}
