// src/connection/session.rs

//! Per-connection state shared between a session's fibers and the control
//! loop.
//!
//! Ownership follows the single-writer rule: the control loop is the only
//! writer of the fields it broadcasts (flags, channel, identity); the
//! fibers own their I/O. The few fields crossed by the datagram tasks
//! (crypto state, datagram address) sit behind brief `parking_lot` locks.

use crate::core::channel::{AclSubject, ROOT_ID};
use crate::core::crypt::CryptState;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::VoiceTargetSpec;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};

/// Lifecycle of a session. Only `Ready` sessions see broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionPhase {
    Connected = 0,
    SentVersion = 1,
    GotClientVersion = 2,
    Authenticated = 3,
    Ready = 4,
    Dead = 5,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionPhase::Connected,
            1 => SessionPhase::SentVersion,
            2 => SessionPhase::GotClientVersion,
            3 => SessionPhase::Authenticated,
            4 => SessionPhase::Ready,
            _ => SessionPhase::Dead,
        }
    }
}

/// The ephemeral per-user flags broadcast in `UserState`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserFlags {
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
}

/// Identity facts fixed by finish-authenticate.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub username: String,
    pub user_id: Option<u32>,
}

/// Capacity of the plaintext queue between the datagram demultiplexer and
/// the session's datagram receiver fiber.
pub const VOICE_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
pub struct ClientSession {
    /// Session id; 0 until finish-authenticate assigns one from the pool.
    id: AtomicU32,
    pub peer_addr: SocketAddr,
    /// SHA-1 hex digest of the peer certificate; empty without one.
    pub cert_digest: String,
    pub version: Mutex<(u32, String)>,

    phase: AtomicU8,
    channel_id: AtomicU32,

    /// Outgoing control messages, drained FIFO by the writer fiber.
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    /// Decrypted datagrams, drained by the datagram receiver fiber.
    pub voice_in_tx: mpsc::Sender<Bytes>,
    /// Closes the session's fibers.
    shutdown_tx: broadcast::Sender<()>,

    /// Voice crypto state, shared with the datagram rx/tx tasks.
    pub crypt: Mutex<CryptState>,
    udp_addr: Mutex<Option<SocketAddr>>,

    pub flags: Mutex<UserFlags>,
    identity: Mutex<Identity>,
    pub tokens: Mutex<HashSet<String>>,
    pub celt_versions: Mutex<Vec<i32>>,
    pub opus: Mutex<bool>,
    pub whisper_targets: Mutex<HashMap<u8, Vec<VoiceTargetSpec>>>,

    pub comment_hash: Mutex<Option<String>>,
    pub texture_hash: Mutex<Option<String>>,
    pub plugin_context: Mutex<Bytes>,
    pub plugin_identity: Mutex<String>,

    pub connected_at: Instant,
    pub last_active: Mutex<Instant>,

    /// Set once a kick path has already broadcast the `UserRemove`, so
    /// removal does not announce it a second time.
    remove_announced: AtomicBool,
}

impl ClientSession {
    /// Builds the session and hands back the receiving ends of its queues
    /// for the fibers.
    pub fn new(
        peer_addr: SocketAddr,
        cert_digest: String,
        crypt: CryptState,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<ControlMessage>,
        mpsc::Receiver<Bytes>,
    ) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (voice_in_tx, voice_in_rx) = mpsc::channel(VOICE_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);
        let now = Instant::now();
        let session = Arc::new(Self {
            id: AtomicU32::new(0),
            peer_addr,
            cert_digest,
            version: Mutex::new((0, String::new())),
            phase: AtomicU8::new(SessionPhase::Connected as u8),
            channel_id: AtomicU32::new(ROOT_ID),
            control_tx,
            voice_in_tx,
            shutdown_tx,
            crypt: Mutex::new(crypt),
            udp_addr: Mutex::new(None),
            flags: Mutex::new(UserFlags::default()),
            identity: Mutex::new(Identity::default()),
            tokens: Mutex::new(HashSet::new()),
            celt_versions: Mutex::new(Vec::new()),
            opus: Mutex::new(false),
            whisper_targets: Mutex::new(HashMap::new()),
            comment_hash: Mutex::new(None),
            texture_hash: Mutex::new(None),
            plugin_context: Mutex::new(Bytes::new()),
            plugin_identity: Mutex::new(String::new()),
            connected_at: now,
            last_active: Mutex::new(now),
            remove_announced: AtomicBool::new(false),
        });
        (session, control_rx, voice_in_rx)
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn assign_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Whether this session participates in broadcasts.
    pub fn is_ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Acquire)
    }

    pub fn set_channel_id(&self, id: u32) {
        self.channel_id.store(id, Ordering::Release);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock()
    }

    /// Binds the peer's datagram address on the first successful
    /// round-trip.
    pub fn bind_udp_addr(&self, addr: SocketAddr) {
        *self.udp_addr.lock() = Some(addr);
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    pub fn set_identity(&self, username: String, user_id: Option<u32>) {
        *self.identity.lock() = Identity { username, user_id };
    }

    pub fn user_id(&self) -> Option<u32> {
        self.identity.lock().user_id
    }

    pub fn username(&self) -> String {
        self.identity.lock().username.clone()
    }

    /// The identity facts the ACL resolver needs.
    pub fn acl_subject(&self) -> AclSubject {
        AclSubject {
            user_id: self.user_id(),
            tokens: self.tokens.lock().clone(),
        }
    }

    /// Queues a control message for the writer fiber. A closed queue means
    /// the session is going away; the message is dropped silently.
    pub fn send(&self, message: ControlMessage) {
        let _ = self.control_tx.send(message);
    }

    /// Queues a control message, reporting whether the writer is still
    /// there. Broadcast helpers use this to abort on the first dead
    /// recipient.
    pub fn try_send(&self, message: ControlMessage) -> bool {
        self.control_tx.send(message).is_ok()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Marks the session dead and tells its fibers to exit within one
    /// outstanding I/O.
    pub fn shutdown(&self) {
        self.set_phase(SessionPhase::Dead);
        let _ = self.shutdown_tx.send(());
    }

    /// Marks the removal broadcast as done; returns whether it had
    /// already been announced.
    pub fn mark_removal_announced(&self) -> bool {
        self.remove_announced.swap(true, Ordering::AcqRel)
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn online_secs(&self) -> u32 {
        self.connected_at.elapsed().as_secs() as u32
    }

    pub fn idle_secs(&self) -> u32 {
        self.last_active.lock().elapsed().as_secs() as u32
    }
}
