// src/server/handlers/auth.rs

//! Finish-authenticate and session removal, both running on the control
//! loop after the out-of-loop authentication step has resolved identity.

use crate::connection::session::{ClientSession, SessionPhase};
use crate::core::ServerError;
use crate::core::channel::{Permissions, ROOT_ID};
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{
    CodecVersion, Reject, RejectReason, ServerSync, UserRemove,
};
use crate::core::state::ServerCore;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

impl ServerCore {
    /// Runs back on the loop once a session's auth task succeeded: reject
    /// duplicates, admit the session, and synchronize it.
    pub async fn finish_authenticate(
        &mut self,
        outcome: crate::core::events::AuthOutcome,
    ) -> Result<(), ServerError> {
        let session = outcome.session;
        if session.phase() != SessionPhase::Authenticated {
            // The connection died while the outcome was in flight.
            return Ok(());
        }

        // One live session per registered identity; the newcomer loses.
        let duplicate_user = outcome
            .user_id
            .is_some_and(|uid| self.by_user.contains_key(&uid));
        let duplicate_name = self
            .sessions
            .values()
            .any(|s| s.username() == outcome.username);
        if duplicate_user || duplicate_name {
            session.send(ControlMessage::Reject(Reject {
                reason: RejectReason::UsernameInUse,
                description: format!("{} is already connected", outcome.username),
            }));
            session.shutdown();
            return Ok(());
        }

        let max_users = self.shared.config.read().max_users;
        if self.sessions.len() as u32 >= max_users {
            session.send(ControlMessage::Reject(Reject {
                reason: RejectReason::ServerFull,
                description: format!("server is full ({max_users} users)"),
            }));
            session.shutdown();
            return Ok(());
        }

        let id = self.id_pool.acquire();
        session.assign_id(id);
        session.set_identity(outcome.username.clone(), outcome.user_id);
        *session.celt_versions.lock() = outcome.celt_versions.clone();
        *session.opus.lock() = outcome.opus;
        if let Some(uid) = outcome.user_id {
            self.by_user.insert(uid, id);
        }
        self.sessions.insert(id, session.clone());
        self.shared
            .host_index
            .lock()
            .insert_session(session.clone());

        // Registered users resume in their last channel when they may
        // still enter it.
        let mut target = ROOT_ID;
        if let Some(uid) = outcome.user_id {
            let last = self.shared.users.read().get(uid).map(|u| u.last_channel);
            if let Some(last) = last
                && self.tree.contains(last)
                && self.has_permission(&session, last, Permissions::ENTER)
            {
                target = last;
            }
        }
        self.tree.move_member(id, None, Some(target));
        session.set_channel_id(target);

        // Codec negotiation over the changed session set.
        match self.recompute_codecs() {
            Some(broadcast) => self.broadcast(broadcast),
            None => session.send(ControlMessage::CodecVersion(CodecVersion {
                alpha: self.codec_alpha,
                beta: self.codec_beta,
                prefer_alpha: self.prefer_alpha,
                opus: *session.opus.lock(),
            })),
        }

        // Channel tree, parents before children.
        for channel_id in self.tree.walk() {
            if let Some(state) = self.channel_state_of(channel_id) {
                session.send(ControlMessage::ChannelState(state));
            }
        }

        // Everyone already present, then the newcomer to everyone.
        let mut present: Vec<u32> = self.sessions.keys().copied().collect();
        present.sort_unstable();
        for other_id in present {
            if other_id == id {
                continue;
            }
            if let Some(other) = self.sessions.get(&other_id)
                && other.is_ready()
            {
                session.send(ControlMessage::UserState(self.user_state_of(other)));
            }
        }
        self.broadcast(ControlMessage::UserState(self.user_state_of(&session)));

        let (permissions, _) = self.query_permissions(&session, ROOT_ID);
        let sync = {
            let config = self.shared.config.read();
            ServerSync {
                session: id,
                max_bandwidth: config.max_bandwidth,
                welcome_text: config.welcome_text.clone(),
                permissions: permissions.bits(),
            }
        };
        session.send(ControlMessage::ServerSync(sync));
        session.send(ControlMessage::ServerConfig(self.server_config_message()));

        session.set_phase(SessionPhase::Ready);
        self.shared.user_count.store(
            self.sessions.values().filter(|s| s.is_ready()).count() as u32,
            Ordering::Release,
        );
        info!(
            "Session {} ({}) is ready in channel {}",
            id, outcome.username, target
        );
        Ok(())
    }

    /// Removes a session from every index. Idempotent; triggered by the
    /// reader/writer fibers exiting or by a kick.
    pub async fn remove_session(
        &mut self,
        session: &Arc<ClientSession>,
    ) -> Result<(), ServerError> {
        self.shared.host_index.lock().remove_session(session);

        let id = session.id();
        if id == 0 || self.sessions.remove(&id).is_none() {
            // Never finished authentication, or already removed.
            session.set_phase(SessionPhase::Dead);
            return Ok(());
        }
        debug!("Removing session {} ({})", id, session.username());

        let was_visible = session.is_ready() || session.phase() == SessionPhase::Dead;
        let channel = session.channel_id();
        self.tree.move_member(id, Some(channel), None);
        self.id_pool.release(id);

        if let Some(uid) = session.user_id() {
            self.by_user.remove(&uid);
            // Remember where a registered user left off.
            let last_channel = if self.tree.contains(channel) {
                channel
            } else {
                ROOT_ID
            };
            let known = self
                .shared
                .users
                .write()
                .update(uid, |user| {
                    user.last_channel = last_channel;
                    user.last_seen = Some(chrono::Utc::now());
                })
                .is_ok();
            if known {
                self.freeze_user(uid).await?;
            }
        }

        session.set_phase(SessionPhase::Dead);

        if was_visible && !session.mark_removal_announced() {
            self.broadcast(ControlMessage::UserRemove(UserRemove {
                session: id,
                actor: None,
                reason: String::new(),
                ban: false,
            }));
        }

        self.reap_temporary_channel(channel).await?;

        if let Some(broadcast) = self.recompute_codecs() {
            self.broadcast(broadcast);
        }
        // Entries under a reclaimable session id must not leak to its
        // successor.
        self.clear_acl_caches();
        self.shared.user_count.store(
            self.sessions.values().filter(|s| s.is_ready()).count() as u32,
            Ordering::Release,
        );
        Ok(())
    }

    /// Deletes a temporary channel the moment it empties.
    pub async fn reap_temporary_channel(&mut self, channel_id: u32) -> Result<(), ServerError> {
        let reap = self.tree.get(channel_id).is_some_and(|c| {
            c.temporary && c.members.is_empty() && c.children.is_empty() && !c.is_root()
        });
        if reap {
            debug!("Reaping emptied temporary channel {channel_id}");
            self.remove_channel_cascade(channel_id, None).await?;
        }
        Ok(())
    }
}
