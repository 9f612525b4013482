// src/core/events.rs

//! The typed events flowing into and out of the control loop.
//!
//! The loop multiplexes four bounded input queues: decoded control
//! messages (with disconnect notifications sharing the queue), completed
//! authentications, voice broadcast requests, and configuration updates.
//! Its only outbound queue is the serialized datagram sender.

use crate::connection::session::ClientSession;
use crate::core::protocol::{ControlMessage, VoiceFrame};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// An event on the loop's primary queue. Events carry the session handle
/// itself so the loop never has to look an id up to reach the sender.
#[derive(Debug)]
pub enum ControlEvent {
    /// A decoded control message read from a session's stream.
    Message {
        session: Arc<ClientSession>,
        message: ControlMessage,
    },
    /// The session's fibers have exited; remove it. Idempotent.
    Disconnected { session: Arc<ClientSession> },
}

/// Delivered by a session's authentication task once identity resolution
/// has finished successfully. Rejections never reach the loop; the session
/// task sends the `Reject` and closes the stream itself.
#[derive(Debug)]
pub struct AuthOutcome {
    pub session: Arc<ClientSession>,
    pub username: String,
    /// The resolved registered identity, `None` for anonymous clients.
    pub user_id: Option<u32>,
    pub celt_versions: Vec<i32>,
    pub opus: bool,
}

/// A decrypted voice frame, forwarded by a session's datagram receiver for
/// routing on the loop.
#[derive(Debug)]
pub struct VoiceEnvelope {
    pub session: Arc<ClientSession>,
    pub frame: VoiceFrame,
}

/// A typed configuration update, applied and persisted by the loop.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: String,
}

/// Work for the serialized datagram sender.
#[derive(Debug)]
pub enum UdpOut {
    /// Encrypt `payload` with the recipient's key and send it to the
    /// recipient's bound datagram address.
    Voice {
        session: Arc<ClientSession>,
        payload: Bytes,
    },
    /// An unencrypted reply (the server-info probe) to an explicit peer.
    Raw { addr: SocketAddr, payload: Bytes },
}
