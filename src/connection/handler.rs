// src/connection/handler.rs

//! Drives one client connection: the stream reader (this task), the
//! writer fiber, and the datagram receiver fiber.
//!
//! Authentication runs here, outside the control loop, so a slow identity
//! lookup can never stall the rest of the server. Everything that mutates
//! server state is shipped to the loop as a typed event.

use crate::connection::session::{ClientSession, SessionPhase};
use crate::core::ServerError;
use crate::core::events::{AuthOutcome, ControlEvent, VoiceEnvelope};
use crate::core::protocol::messages::{
    Authenticate, CryptSetup, Ping, Reject, RejectReason, Version,
};
use crate::core::protocol::{ControlCodec, ControlMessage, VoiceFrame};
use crate::core::state::SharedState;
use crate::core::users::{self, SUPER_USER_ID, SUPER_USER_NAME};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type ControlFramed = Framed<TlsStream<TcpStream>, ControlCodec>;

/// The protocol version advertised in the `Version` exchange and the
/// probe reply (1.4.2).
pub const PROTOCOL_VERSION: u32 = (1 << 16) | (4 << 8) | 2;

/// Manages the full lifecycle of one client connection.
pub struct SessionHandler {
    framed: Option<ControlFramed>,
    session: Arc<ClientSession>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    voice_in_rx: mpsc::Receiver<Bytes>,
    events_tx: mpsc::Sender<ControlEvent>,
    auth_tx: mpsc::Sender<AuthOutcome>,
    voice_tx: mpsc::Sender<VoiceEnvelope>,
    shared: Arc<SharedState>,
}

impl SessionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TlsStream<TcpStream>,
        session: Arc<ClientSession>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        voice_in_rx: mpsc::Receiver<Bytes>,
        events_tx: mpsc::Sender<ControlEvent>,
        auth_tx: mpsc::Sender<AuthOutcome>,
        voice_tx: mpsc::Sender<VoiceEnvelope>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            framed: Some(Framed::new(stream, ControlCodec)),
            session,
            control_rx,
            voice_in_rx,
            events_tx,
            auth_tx,
            voice_tx,
            shared,
        }
    }

    /// Runs the reader until the peer goes away or a protocol violation
    /// kills the session, then notifies the loop exactly once.
    pub async fn run(mut self) {
        let framed = match self.framed.take() {
            Some(framed) => framed,
            None => return,
        };
        let (sink, stream) = framed.split();

        let writer = tokio::spawn(run_writer(
            sink,
            std::mem::replace(&mut self.control_rx, mpsc::unbounded_channel().1),
            self.session.clone(),
        ));
        let datagram = tokio::spawn(run_datagram_receiver(
            std::mem::replace(&mut self.voice_in_rx, mpsc::channel(1).1),
            self.voice_tx.clone(),
            self.session.clone(),
        ));

        if let Err(e) = self.read_loop(stream).await {
            match &e {
                ServerError::Io(io) => debug!(
                    "Session from {} closed: {}",
                    self.session.peer_addr, io
                ),
                other => warn!(
                    "Panicking session from {}: {}",
                    self.session.peer_addr, other
                ),
            }
        }

        // Tear down the sibling fibers and hand removal to the loop.
        self.session.shutdown();
        let _ = writer.await;
        let _ = datagram.await;
        let _ = self
            .events_tx
            .send(ControlEvent::Disconnected {
                session: self.session.clone(),
            })
            .await;
    }

    async fn read_loop(
        &mut self,
        mut stream: SplitStream<ControlFramed>,
    ) -> Result<(), ServerError> {
        let mut shutdown_rx = self.session.subscribe_shutdown();

        // The server speaks first.
        self.session.send(ControlMessage::Version(Version {
            version: PROTOCOL_VERSION,
            release: format!("Timbre {}", env!("CARGO_PKG_VERSION")),
            os: std::env::consts::OS.to_string(),
            os_version: String::new(),
        }));
        self.session.set_phase(SessionPhase::SentVersion);

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                message = stream.next() => match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
            };

            self.session.touch();
            match (self.session.phase(), message) {
                (_, ControlMessage::Unknown(kind)) => {
                    debug!("Ignoring unknown message kind {kind}");
                }
                (SessionPhase::SentVersion, ControlMessage::Version(version)) => {
                    *self.session.version.lock() = (version.version, version.release);
                    self.session.set_phase(SessionPhase::GotClientVersion);
                }
                (SessionPhase::GotClientVersion, ControlMessage::Authenticate(auth)) => {
                    self.authenticate(auth).await?;
                }
                // Clients ping while waiting for finish-authenticate.
                (phase, ControlMessage::Ping(ping)) if phase < SessionPhase::Authenticated => {
                    self.session.send(ControlMessage::Ping(Ping {
                        timestamp: ping.timestamp,
                        ..Ping::default()
                    }));
                }
                (phase, message) if phase < SessionPhase::Authenticated => {
                    return Err(ServerError::Protocol(format!(
                        "{} before authentication",
                        message.name()
                    )));
                }
                (_, message) => {
                    if self
                        .events_tx
                        .send(ControlEvent::Message {
                            session: self.session.clone(),
                            message,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Validates the `Authenticate` message and resolves the registered
    /// identity, then signals completion to the loop. Rejections are sent
    /// and the session is torn down without ever reaching the loop.
    async fn authenticate(&mut self, auth: Authenticate) -> Result<(), ServerError> {
        *self.session.tokens.lock() = auth.tokens.iter().cloned().collect();

        let username = auth.username.trim().to_string();
        if username.is_empty() {
            return self.reject(RejectReason::InvalidUsername, "empty username");
        }

        let digest = self.session.cert_digest.clone();
        let (username, user_id) = if username == SUPER_USER_NAME {
            let record = self.shared.config.read().super_user_password.clone();
            if record.is_empty() || !users::verify_super_user_password(&record, &auth.password) {
                return self.reject(RejectReason::WrongUserPassword, "wrong SuperUser password");
            }
            (username, Some(SUPER_USER_ID))
        } else {
            let registry = self.shared.users.read();
            match registry.find_by_name(&username) {
                Some(user) => {
                    if !digest.is_empty() && user.cert_digest == digest {
                        (username, Some(user.id))
                    } else {
                        return self.reject(
                            RejectReason::WrongUserPassword,
                            "username is registered to another certificate",
                        );
                    }
                }
                // A known certificate logs in under its registered name
                // regardless of the name the client asked for.
                None => match registry.find_by_digest(&digest) {
                    Some(user) => (user.name.clone(), Some(user.id)),
                    None => (username, None),
                },
            }
        };

        *self.session.celt_versions.lock() = auth.celt_versions.clone();
        *self.session.opus.lock() = auth.opus;

        {
            let crypt = self.session.crypt.lock();
            self.session.send(ControlMessage::CryptSetup(CryptSetup {
                key: Bytes::copy_from_slice(crypt.key()),
                client_nonce: Bytes::copy_from_slice(crypt.decrypt_nonce()),
                server_nonce: Bytes::copy_from_slice(crypt.encrypt_nonce()),
            }));
        }

        self.session.set_phase(SessionPhase::Authenticated);
        info!(
            "Session from {} authenticated as {:?} (user id {:?})",
            self.session.peer_addr, username, user_id
        );
        let _ = self
            .auth_tx
            .send(AuthOutcome {
                session: self.session.clone(),
                username,
                user_id,
                celt_versions: auth.celt_versions,
                opus: auth.opus,
            })
            .await;
        Ok(())
    }

    fn reject(&self, reason: RejectReason, description: &str) -> Result<(), ServerError> {
        self.session.send(ControlMessage::Reject(Reject {
            reason,
            description: description.to_string(),
        }));
        Err(ServerError::Protocol(format!(
            "authentication rejected: {description}"
        )))
    }
}

/// The writer fiber: drains the per-session queue in FIFO order, framing
/// and writing sequentially.
async fn run_writer(
    mut sink: SplitSink<ControlFramed, ControlMessage>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    session: Arc<ClientSession>,
) {
    let mut shutdown_rx = session.subscribe_shutdown();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            message = control_rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    debug!("Writer for {} stopping: {}", session.peer_addr, e);
                    session.shutdown();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// The datagram receiver fiber: re-parses decrypted frames and forwards
/// them to the loop's voice queue.
async fn run_datagram_receiver(
    mut voice_in_rx: mpsc::Receiver<Bytes>,
    voice_tx: mpsc::Sender<VoiceEnvelope>,
    session: Arc<ClientSession>,
) {
    let mut shutdown_rx = session.subscribe_shutdown();
    loop {
        let plain = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            plain = voice_in_rx.recv() => match plain {
                Some(plain) => plain,
                None => break,
            },
        };
        match VoiceFrame::parse(plain) {
            Ok(frame) => {
                if voice_tx
                    .send(VoiceEnvelope {
                        session: session.clone(),
                        frame,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => debug!("Dropping malformed voice frame: {e}"),
        }
    }
}
