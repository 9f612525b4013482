// src/core/state/mod.rs

//! `ServerCore`, the single-writer heart of the server.
//!
//! The control loop owns this struct exclusively. Every durable or
//! broadcast-visible mutation flows through it: the channel tree, the
//! session map, the permission cache, codec negotiation, and the freezer.

pub mod shared;

pub use shared::{HostIndex, SharedState};

use crate::connection::session::{ClientSession, SessionPhase};
use crate::core::ServerError;
use crate::core::blobstore::BlobStore;
use crate::core::channel::{ChannelTree, Permissions, acl};
use crate::core::events::UdpOut;
use crate::core::idpool::SessionIdPool;
use crate::core::persistence::{Freezer, FreezerOp, ServerImage};
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::CodecVersion;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The CELT 0.7.0 compatibility bitstream id; clients advertising it are
/// kept on the alpha slot.
pub const CELT_COMPAT_BITSTREAM: i32 = -2147483637;

/// Effective permissions memoized per (session, channel) until the next
/// ACL-affecting mutation clears the whole cache.
#[derive(Debug, Default)]
pub struct PermissionCache {
    entries: HashMap<(u32, u32), Permissions>,
}

impl PermissionCache {
    pub fn get(&self, session: u32, channel: u32) -> Option<Permissions> {
        self.entries.get(&(session, channel)).copied()
    }

    pub fn insert(&mut self, session: u32, channel: u32, mask: Permissions) {
        self.entries.insert((session, channel), mask);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct ServerCore {
    pub server_id: u32,
    pub shared: Arc<SharedState>,

    pub tree: ChannelTree,
    /// Sessions past finish-authenticate, keyed by session id.
    pub sessions: HashMap<u32, Arc<ClientSession>>,
    /// Registered user id → session id, for duplicate-login checks.
    pub by_user: HashMap<u32, u32>,
    pub id_pool: SessionIdPool,
    pub perm_cache: PermissionCache,
    pub blobs: BlobStore,

    /// `None` only in unit tests that exercise pure state transitions.
    pub freezer: Option<Freezer>,
    /// Runtime configuration overrides, part of the durable image.
    pub config_overrides: BTreeMap<String, String>,

    pub codec_alpha: i32,
    pub codec_beta: i32,
    pub prefer_alpha: bool,

    udp_tx: mpsc::Sender<UdpOut>,
}

impl ServerCore {
    pub fn new(server_id: u32, shared: Arc<SharedState>, udp_tx: mpsc::Sender<UdpOut>) -> Self {
        Self {
            server_id,
            shared,
            tree: ChannelTree::new(),
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            id_pool: SessionIdPool::new(),
            perm_cache: PermissionCache::default(),
            blobs: BlobStore::new(),
            freezer: None,
            config_overrides: BTreeMap::new(),
            codec_alpha: 0,
            codec_beta: 0,
            // Matches the peer expectation that the first negotiated codec
            // lands in the beta slot.
            prefer_alpha: true,
            udp_tx,
        }
    }

    /// Installs the boot image produced by the freezer.
    pub fn restore(&mut self, image: ServerImage) -> Result<(), ServerError> {
        let next_id = image.next_channel_id;
        self.tree = ChannelTree::from_channels(image.channels)?;
        self.tree.bump_next_id(next_id);
        *self.shared.users.write() = crate::core::users::UserRegistry::from_users(image.users);
        self.shared.bans.write().replace(image.bans);
        self.config_overrides = image.config_overrides;
        {
            let mut config = self.shared.config.write();
            for (key, value) in &self.config_overrides {
                if let Err(e) = config.set_key(key, value) {
                    warn!("Ignoring persisted configuration override: {e}");
                }
            }
        }
        Ok(())
    }

    /// Produces a consistent durable image of the current state.
    /// Temporary channels live and die with their members, so they are
    /// left out, along with any references to them.
    pub fn image(&self) -> ServerImage {
        let all = self.tree.snapshot_channels();
        let temp_ids: std::collections::HashSet<u32> =
            all.iter().filter(|c| c.temporary).map(|c| c.id).collect();
        let channels = all
            .into_iter()
            .filter(|c| !c.temporary)
            .map(|mut c| {
                c.children.retain(|id| !temp_ids.contains(id));
                c.links.retain(|id| !temp_ids.contains(id));
                c
            })
            .collect();
        ServerImage {
            server_id: self.server_id,
            next_channel_id: self.tree.peek_next_id(),
            channels,
            users: self.shared.users.read().snapshot_users(),
            bans: self.shared.bans.read().snapshot_bans(),
            config_overrides: self.config_overrides.clone(),
        }
    }

    // --- Freezer plumbing ---

    pub async fn freeze(&mut self, op: FreezerOp) -> Result<(), ServerError> {
        if let Some(freezer) = self.freezer.as_mut() {
            freezer.append(&op).await?;
        }
        Ok(())
    }

    /// Logs the current record of a channel. Called after any durable
    /// channel mutation.
    pub async fn freeze_channel(&mut self, id: u32) -> Result<(), ServerError> {
        let Some(channel) = self.tree.get(id).cloned() else {
            return Ok(());
        };
        self.freeze(FreezerOp::ChannelUpsert { channel }).await
    }

    pub async fn freeze_user(&mut self, id: u32) -> Result<(), ServerError> {
        let user = self.shared.users.read().get(id).cloned();
        match user {
            Some(user) => self.freeze(FreezerOp::UserUpsert { user }).await,
            None => Ok(()),
        }
    }

    pub async fn freeze_bans(&mut self) -> Result<(), ServerError> {
        let bans = self.shared.bans.read().snapshot_bans();
        self.freeze(FreezerOp::BanListReplace { bans }).await
    }

    /// Snapshot probe, run by the loop after handling each queue item.
    pub async fn maybe_snapshot(&mut self) -> Result<(), ServerError> {
        if self.freezer.as_ref().is_some_and(|f| f.snapshot_due()) {
            self.snapshot_now().await?;
        }
        Ok(())
    }

    pub async fn snapshot_now(&mut self) -> Result<(), ServerError> {
        let image = self.image();
        if let Some(freezer) = self.freezer.as_mut() {
            freezer.snapshot(&image).await?;
        }
        Ok(())
    }

    // --- Permissions ---

    /// Returns the effective mask and whether it came out of the cache.
    /// The super-user short-circuits without touching the cache.
    pub fn query_permissions(
        &mut self,
        session: &Arc<ClientSession>,
        channel: u32,
    ) -> (Permissions, bool) {
        let subject = session.acl_subject();
        if subject.is_super_user() {
            return (Permissions::all(), false);
        }
        let key_session = session.id();
        if let Some(mask) = self.perm_cache.get(key_session, channel) {
            return (mask, true);
        }
        let mask = acl::resolve(&self.tree, channel, &subject);
        self.perm_cache.insert(key_session, channel, mask);
        (mask, false)
    }

    pub fn has_permission(
        &mut self,
        session: &Arc<ClientSession>,
        channel: u32,
        bit: Permissions,
    ) -> bool {
        self.query_permissions(session, channel).0.contains(bit)
    }

    /// Coarse invalidation: any ACL, group, token, tree, or registry
    /// mutation clears every entry.
    pub fn clear_acl_caches(&mut self) {
        self.perm_cache.clear();
    }

    // --- Broadcasts ---

    /// Sends to every session in state `Authenticated` or later. A send
    /// error aborts the rest of this broadcast; the dead session is
    /// reaped through its own disconnect path.
    pub fn broadcast(&self, message: ControlMessage) {
        self.broadcast_if(message, |_| true);
    }

    pub fn broadcast_if(
        &self,
        message: ControlMessage,
        predicate: impl Fn(&ClientSession) -> bool,
    ) {
        let mut ids: Vec<u32> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            if session.phase() < SessionPhase::Authenticated || !predicate(session) {
                continue;
            }
            if !session.try_send(message.clone()) {
                warn!(
                    "Aborting broadcast of {} at session {}: writer is gone",
                    message.name(),
                    id
                );
                return;
            }
        }
    }

    // --- Voice output ---

    /// Hands an encrypted-voice work item to the serialized datagram
    /// sender, dropping the frame when the queue is full. Silence beats
    /// latency on the voice path.
    pub fn send_voice(&self, to: Arc<ClientSession>, payload: Bytes) {
        if let Err(e) = self.udp_tx.try_send(UdpOut::Voice {
            session: to,
            payload,
        }) {
            debug!("Dropping voice frame: {e}");
        }
    }

    pub fn send_raw_datagram(&self, addr: std::net::SocketAddr, payload: Bytes) {
        if let Err(e) = self.udp_tx.try_send(UdpOut::Raw { addr, payload }) {
            debug!("Dropping raw datagram: {e}");
        }
    }

    // --- Codec negotiation ---

    /// Re-tallies advertised codecs after a session set change. Returns
    /// the broadcast to emit if the negotiated pair changed.
    pub fn recompute_codecs(&mut self) -> Option<ControlMessage> {
        let mut counts: HashMap<i32, usize> = HashMap::new();
        let mut any = false;
        let mut all_opus = true;
        for session in self.sessions.values() {
            let versions = session.celt_versions.lock().clone();
            if versions.is_empty() {
                continue;
            }
            any = true;
            all_opus &= *session.opus.lock();
            for version in versions {
                *counts.entry(version).or_default() += 1;
            }
        }
        if !any {
            return None;
        }

        // Highest count wins; equal counts go to the higher identifier.
        let winner = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
            .map(|(version, _)| *version)?;

        let current = if self.prefer_alpha {
            self.codec_alpha
        } else {
            self.codec_beta
        };
        if winner == current {
            return None;
        }
        if winner == CELT_COMPAT_BITSTREAM {
            self.prefer_alpha = true;
        } else {
            self.prefer_alpha = !self.prefer_alpha;
        }
        if self.prefer_alpha {
            self.codec_alpha = winner;
        } else {
            self.codec_beta = winner;
        }
        Some(ControlMessage::CodecVersion(CodecVersion {
            alpha: self.codec_alpha,
            beta: self.codec_beta,
            prefer_alpha: self.prefer_alpha,
            opus: all_opus,
        }))
    }
}
