// src/server/udp.rs

//! The shared datagram socket: one receive loop that demultiplexes,
//! decrypts, and delivers inbound packets, and one serialized sender that
//! encrypts with each recipient's key.

use crate::connection::handler::PROTOCOL_VERSION;
use crate::connection::session::ClientSession;
use crate::core::events::UdpOut;
use crate::core::protocol::packet;
use crate::core::state::SharedState;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Large enough for any legal voice datagram.
const RECV_BUFFER_LEN: usize = 2048;

/// The datagram receive loop.
///
/// A 12-byte probe gets an unencrypted server-info reply. Anything else
/// is matched to a session by its (address, port); unknown sources are
/// trial-decrypted against every session sharing the source IP, and the
/// first success binds the address. Repeated failures trigger a
/// rate-limited crypt resync request on the control channel.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    shared: Arc<SharedState>,
    udp_tx: mpsc::Sender<UdpOut>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Datagram receiver running");
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        let (len, addr) = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Datagram receive error: {e}");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        if let Some(nonce) = packet::parse_probe(datagram) {
            let (current, max_users, max_bandwidth) = {
                let config = shared.config.read();
                (
                    shared.user_count.load(Ordering::Acquire),
                    config.max_users,
                    config.max_bandwidth,
                )
            };
            let reply =
                packet::probe_reply(PROTOCOL_VERSION, nonce, current, max_users, max_bandwidth);
            if udp_tx
                .try_send(UdpOut::Raw {
                    addr,
                    payload: reply,
                })
                .is_err()
            {
                debug!("Dropping probe reply to {addr}: sender queue is full");
            }
            continue;
        }

        let bound = shared.host_index.lock().lookup_addr(&addr);
        match bound {
            Some(session) => {
                decrypt_and_deliver(&session, datagram);
            }
            None => {
                // First datagram from this (address, port); find the
                // owner by trial decryption among same-IP sessions.
                let candidates = shared.host_index.lock().sessions_for_ip(addr.ip());
                for session in candidates {
                    if decrypt_and_deliver(&session, datagram) {
                        session.bind_udp_addr(addr);
                        shared
                            .host_index
                            .lock()
                            .bind_addr(addr, session.clone());
                        debug!("Bound datagram address {addr} to session {}", session.id());
                        break;
                    }
                }
            }
        }
    }
    info!("Datagram receiver stopped");
}

/// Decrypts one datagram with the session's key and queues the plaintext
/// for the session's datagram receiver fiber. Returns whether decryption
/// succeeded.
fn decrypt_and_deliver(session: &Arc<ClientSession>, datagram: &[u8]) -> bool {
    let mut plain = Vec::new();
    let (ok, wants_resync) = {
        let mut crypt = session.crypt.lock();
        match crypt.decrypt(datagram, &mut plain) {
            Ok(()) => (true, false),
            Err(_) => (false, crypt.should_request_resync()),
        }
    };
    if !ok {
        if wants_resync {
            debug!("Requesting crypt resync from session {}", session.id());
            session.send(crate::core::protocol::ControlMessage::CryptSetup(
                crate::core::protocol::messages::CryptSetup::default(),
            ));
        }
        return false;
    }
    // The voice queue is bounded; a full queue drops the frame.
    if session.voice_in_tx.try_send(Bytes::from(plain)).is_err() {
        debug!("Dropping inbound voice frame for session {}: queue full", session.id());
    }
    true
}

/// The serialized datagram sender. Voice items are encrypted with the
/// recipient's key; raw items (probe replies) go out as-is to an explicit
/// address.
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    mut udp_rx: mpsc::Receiver<UdpOut>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Datagram sender running");
    let mut cipher = Vec::new();
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            item = udp_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        match item {
            UdpOut::Raw { addr, payload } => {
                if let Err(e) = socket.send_to(&payload, addr).await {
                    debug!("Raw datagram to {addr} failed: {e}");
                }
            }
            UdpOut::Voice { session, payload } => {
                let Some(addr) = session.udp_addr() else {
                    // No round-trip yet; nowhere to send.
                    continue;
                };
                session.crypt.lock().encrypt(&payload, &mut cipher);
                if let Err(e) = socket.send_to(&cipher, addr).await {
                    debug!("Voice datagram to {addr} failed: {e}");
                }
            }
        }
    }
    info!("Datagram sender stopped");
}
