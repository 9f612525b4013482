// src/server/handlers/user.rs

//! User state edits, moves, kicks and bans, and registered-user
//! maintenance.

use crate::connection::session::ClientSession;
use crate::core::ServerError;
use crate::core::bans::Ban;
use crate::core::blobstore::INLINE_LIMIT;
use crate::core::channel::{Permissions, ROOT_ID};
use crate::core::persistence::FreezerOp;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{
    BanEntry, BanList, DenyKind, UserList, UserListEntry, UserRemove, UserState,
};
use crate::core::state::ServerCore;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

impl ServerCore {
    /// Moves a session into `dest`, broadcasting the change and reaping
    /// the vacated channel if it was temporary and emptied.
    pub async fn move_user(
        &mut self,
        session: Arc<ClientSession>,
        dest: u32,
        actor: Option<u32>,
    ) -> Result<(), ServerError> {
        let from = session.channel_id();
        if from == dest || !self.tree.contains(dest) {
            return Ok(());
        }
        self.tree.move_member(session.id(), Some(from), Some(dest));
        session.set_channel_id(dest);
        self.broadcast(ControlMessage::UserState(UserState {
            session: Some(session.id()),
            actor,
            channel_id: Some(dest),
            ..UserState::default()
        }));

        if let Some(uid) = session.user_id() {
            let known = self
                .shared
                .users
                .write()
                .update(uid, |user| user.last_channel = dest)
                .is_ok();
            if known {
                self.freeze_user(uid).await?;
            }
        }
        self.reap_temporary_channel(from).await
    }

    pub async fn handle_user_state(
        &mut self,
        actor: &Arc<ClientSession>,
        msg: UserState,
    ) -> Result<(), ServerError> {
        let target = match msg.session {
            None => actor.clone(),
            Some(id) if id == actor.id() => actor.clone(),
            Some(id) => match self.sessions.get(&id) {
                Some(target) => target.clone(),
                None => return Ok(()),
            },
        };
        let editing_self = Arc::ptr_eq(&target, actor);
        let mut announce = UserState {
            session: Some(target.id()),
            actor: Some(actor.id()),
            ..UserState::default()
        };

        // Channel move.
        if let Some(dest) = msg.channel_id
            && dest != target.channel_id()
            && self.tree.contains(dest)
        {
            let allowed = if editing_self {
                self.has_permission(actor, dest, Permissions::ENTER)
            } else {
                self.has_permission(actor, dest, Permissions::MOVE)
                    && self.has_permission(actor, target.channel_id(), Permissions::MOVE)
            };
            if !allowed {
                let needed = if editing_self {
                    Permissions::ENTER
                } else {
                    Permissions::MOVE
                };
                self.deny(actor, DenyKind::Permission, needed, dest);
                return Ok(());
            }
            self.move_user(target.clone(), dest, Some(actor.id())).await?;
        }

        // Server mute/deafen and priority speaker need MuteDeafen on the
        // target's channel.
        if msg.mute.is_some() || msg.deaf.is_some() || msg.priority_speaker.is_some() {
            let channel = target.channel_id();
            if !self.has_permission(actor, channel, Permissions::MUTE_DEAFEN) {
                self.deny(actor, DenyKind::Permission, Permissions::MUTE_DEAFEN, channel);
                return Ok(());
            }
            let mut flags = target.flags.lock();
            if let Some(mute) = msg.mute {
                flags.mute = mute;
                // Undeafening is implied by unmuting, deafening implies
                // muting.
                if !mute {
                    flags.deaf = false;
                    announce.deaf = Some(false);
                }
                announce.mute = Some(mute);
            }
            if let Some(deaf) = msg.deaf {
                flags.deaf = deaf;
                if deaf {
                    flags.mute = true;
                    announce.mute = Some(true);
                }
                announce.deaf = Some(deaf);
            }
            if let Some(priority) = msg.priority_speaker {
                flags.priority_speaker = priority;
                announce.priority_speaker = Some(priority);
            }
        }

        if msg.suppress == Some(false) {
            let channel = target.channel_id();
            if self.has_permission(actor, channel, Permissions::MUTE_DEAFEN) {
                target.flags.lock().suppress = false;
                announce.suppress = Some(false);
            }
        }

        // Self flags apply only to the sender.
        if editing_self {
            let mut flags = target.flags.lock();
            if let Some(self_mute) = msg.self_mute {
                flags.self_mute = self_mute;
                if !self_mute {
                    flags.self_deaf = false;
                    announce.self_deaf = Some(false);
                }
                announce.self_mute = Some(self_mute);
            }
            if let Some(self_deaf) = msg.self_deaf {
                flags.self_deaf = self_deaf;
                if self_deaf {
                    flags.self_mute = true;
                    announce.self_mute = Some(true);
                }
                announce.self_deaf = Some(self_deaf);
            }
            if let Some(recording) = msg.recording {
                flags.recording = recording;
                announce.recording = Some(recording);
            }
        }

        // Comment and texture blobs.
        if let Some(comment) = msg.comment.clone()
            && editing_self
        {
            let hash = self.store_text_blob(&comment);
            *target.comment_hash.lock() = hash.clone();
            if hash.is_some() {
                announce.comment_hash = hash.clone().map(|h| Bytes::from(h.into_bytes()));
            } else {
                announce.comment = Some(comment);
            }
            self.persist_user_blobs(&target, hash, None).await?;
        }
        if let Some(texture) = msg.texture.clone()
            && editing_self
        {
            let hash = (!texture.is_empty()).then(|| self.blobs.put(texture.clone()));
            *target.texture_hash.lock() = hash.clone();
            if hash.is_some() {
                announce.texture_hash = hash.clone().map(|h| Bytes::from(h.into_bytes()));
            } else {
                announce.texture = Some(texture);
            }
            self.persist_user_blobs(&target, None, hash).await?;
        }

        // Positional-audio plugin data is relayed, not interpreted.
        if let Some(context) = msg.plugin_context.clone()
            && editing_self
        {
            *target.plugin_context.lock() = context.clone();
            announce.plugin_context = Some(context);
        }
        if let Some(identity) = msg.plugin_identity.clone()
            && editing_self
        {
            *target.plugin_identity.lock() = identity.clone();
            announce.plugin_identity = Some(identity);
        }

        // Self-registration request.
        if msg.user_id == Some(0) && editing_self && target.user_id().is_none() {
            if target.cert_digest.is_empty() {
                self.deny(actor, DenyKind::MissingCertificate, Permissions::empty(), ROOT_ID);
                return Ok(());
            }
            if !self.has_permission(actor, ROOT_ID, Permissions::SELF_REGISTER) {
                self.deny(actor, DenyKind::Permission, Permissions::SELF_REGISTER, ROOT_ID);
                return Ok(());
            }
            let registered = self
                .shared
                .users
                .write()
                .register(&target.username(), &target.cert_digest);
            match registered {
                Ok(uid) => {
                    target.set_identity(target.username(), Some(uid));
                    self.by_user.insert(uid, target.id());
                    self.freeze_user(uid).await?;
                    self.clear_acl_caches();
                    announce.user_id = Some(uid);
                    info!("Registered {} as user {}", target.username(), uid);
                }
                Err(e) => {
                    self.deny(actor, DenyKind::UserName, Permissions::empty(), ROOT_ID);
                    info!("Self-registration failed: {e}");
                    return Ok(());
                }
            }
        }

        if announce != (UserState {
            session: Some(target.id()),
            actor: Some(actor.id()),
            ..UserState::default()
        }) {
            self.broadcast(ControlMessage::UserState(announce));
        }
        Ok(())
    }

    fn store_text_blob(&mut self, text: &str) -> Option<String> {
        (text.len() > INLINE_LIMIT)
            .then(|| self.blobs.put(Bytes::from(text.to_string().into_bytes())))
    }

    async fn persist_user_blobs(
        &mut self,
        target: &Arc<ClientSession>,
        comment_hash: Option<String>,
        texture_hash: Option<String>,
    ) -> Result<(), ServerError> {
        let Some(uid) = target.user_id() else {
            return Ok(());
        };
        let known = self
            .shared
            .users
            .write()
            .update(uid, |user| {
                if let Some(hash) = &comment_hash {
                    user.comment_hash = Some(hash.clone());
                }
                if let Some(hash) = &texture_hash {
                    user.texture_hash = Some(hash.clone());
                }
            })
            .is_ok();
        if known {
            self.freeze_user(uid).await?;
        }
        Ok(())
    }

    /// Kick, optionally with a ban on the peer's address. The
    /// `UserRemove` announcement goes out before the session is torn
    /// down.
    pub async fn handle_user_remove(
        &mut self,
        actor: &Arc<ClientSession>,
        msg: UserRemove,
    ) -> Result<(), ServerError> {
        let Some(target) = self.sessions.get(&msg.session).cloned() else {
            return Ok(());
        };
        let needed = if msg.ban {
            Permissions::BAN
        } else {
            Permissions::KICK
        };
        if !self.has_permission(actor, ROOT_ID, needed) {
            self.deny(actor, DenyKind::Permission, needed, ROOT_ID);
            return Ok(());
        }

        info!(
            "Session {} {} session {} ({:?})",
            actor.id(),
            if msg.ban { "ban-kicks" } else { "kicks" },
            target.id(),
            msg.reason
        );
        if msg.ban {
            let ip = target.peer_addr.ip();
            let prefix_len = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            self.shared.bans.write().push(Ban {
                address: ip,
                prefix_len,
                name: target.username(),
                cert_digest: target.cert_digest.clone(),
                reason: msg.reason.clone(),
                start: Utc::now(),
                duration_secs: 0,
            });
            self.freeze_bans().await?;
        }

        self.broadcast(ControlMessage::UserRemove(UserRemove {
            session: target.id(),
            actor: Some(actor.id()),
            reason: msg.reason,
            ban: msg.ban,
        }));
        target.mark_removal_announced();
        target.shutdown();
        Ok(())
    }

    /// Query or edit the registered-user table. Renames and empty-name
    /// deregistrations are applied; deregistration purges the user from
    /// every ACL and group.
    pub async fn handle_user_list(
        &mut self,
        actor: &Arc<ClientSession>,
        msg: UserList,
    ) -> Result<(), ServerError> {
        if !self.has_permission(actor, ROOT_ID, Permissions::REGISTER) {
            self.deny(actor, DenyKind::Permission, Permissions::REGISTER, ROOT_ID);
            return Ok(());
        }

        if msg.users.is_empty() {
            let users: Vec<UserListEntry> = self
                .shared
                .users
                .read()
                .iter_by_id()
                .map(|user| UserListEntry {
                    user_id: user.id,
                    name: user.name.clone(),
                })
                .collect();
            actor.send(ControlMessage::UserList(UserList { users }));
            return Ok(());
        }

        for entry in msg.users {
            if entry.name.is_empty() {
                let removed = self.shared.users.write().remove(entry.user_id).is_some();
                if removed {
                    info!("Deregistered user {}", entry.user_id);
                    self.tree.purge_user(entry.user_id);
                    self.clear_acl_caches();
                    self.freeze(FreezerOp::UserRemove { id: entry.user_id }).await?;
                    // A connected session loses its registered identity but
                    // stays online.
                    if let Some(session_id) = self.by_user.remove(&entry.user_id)
                        && let Some(session) = self.sessions.get(&session_id)
                    {
                        session.set_identity(session.username(), None);
                    }
                }
            } else {
                let renamed = self
                    .shared
                    .users
                    .write()
                    .rename(entry.user_id, &entry.name)
                    .is_ok();
                if renamed {
                    self.freeze_user(entry.user_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Query or replace the ban list.
    pub async fn handle_ban_list(
        &mut self,
        actor: &Arc<ClientSession>,
        msg: BanList,
    ) -> Result<(), ServerError> {
        if !self.has_permission(actor, ROOT_ID, Permissions::BAN) {
            self.deny(actor, DenyKind::Permission, Permissions::BAN, ROOT_ID);
            return Ok(());
        }

        if msg.query {
            let bans: Vec<BanEntry> = self
                .shared
                .bans
                .read()
                .iter()
                .map(ban_to_entry)
                .collect();
            actor.send(ControlMessage::BanList(BanList { bans, query: true }));
            return Ok(());
        }

        let bans: Vec<Ban> = msg.bans.iter().filter_map(entry_to_ban).collect();
        info!("Session {} replaced the ban list ({} entries)", actor.id(), bans.len());
        self.shared.bans.write().replace(bans);
        self.freeze_bans().await?;
        Ok(())
    }
}

fn ban_to_entry(ban: &Ban) -> BanEntry {
    let address = match ban.address {
        IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    };
    BanEntry {
        address,
        mask: u32::from(ban.prefix_len),
        name: ban.name.clone(),
        hash: ban.cert_digest.clone(),
        reason: ban.reason.clone(),
        start: ban.start.to_rfc3339(),
        duration: ban.duration_secs,
    }
}

fn entry_to_ban(entry: &BanEntry) -> Option<Ban> {
    let address = match entry.address.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&entry.address);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry.address);
            IpAddr::from(octets)
        }
        _ => return None,
    };
    let start = DateTime::parse_from_rfc3339(&entry.start)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Some(Ban {
        address,
        prefix_len: entry.mask.min(128) as u8,
        name: entry.name.clone(),
        cert_digest: entry.hash.clone(),
        reason: entry.reason.clone(),
        start,
        duration_secs: entry.duration,
    })
}
