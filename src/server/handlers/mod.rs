// src/server/handlers/mod.rs

//! Control-message handlers, split by area. Each handler is an inherent
//! method on `ServerCore` and runs on the control loop, so it may mutate
//! any server-owned state without further synchronization.

pub mod acl;
pub mod auth;
pub mod channel;
pub mod query;
pub mod text;
pub mod user;
pub mod voice;

use crate::connection::session::ClientSession;
use crate::core::ServerError;
use crate::core::channel::Permissions;
use crate::core::events::ConfigUpdate;
use crate::core::persistence::FreezerOp;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{
    self, ChannelState, DenyKind, PermissionDenied, UserState,
};
use std::sync::Arc;
use tracing::debug;

impl crate::core::state::ServerCore {
    /// Routes one decoded message from a `Ready` (or `Authenticated`)
    /// session. Kinds a client has no business sending, and unknown
    /// kinds, are silently dropped.
    pub async fn dispatch(
        &mut self,
        session: Arc<ClientSession>,
        message: ControlMessage,
    ) -> Result<(), ServerError> {
        if session.phase() == crate::connection::session::SessionPhase::Dead {
            return Ok(());
        }
        // The event queue and the auth queue are independent; anything but
        // a ping from a session that finish-authenticate has not admitted
        // yet is dropped rather than dispatched against missing state.
        if !matches!(message, ControlMessage::Ping(_))
            && !self.sessions.contains_key(&session.id())
        {
            debug!(
                "Dropping {} from unadmitted session {}",
                message.name(),
                session.id()
            );
            return Ok(());
        }
        match message {
            ControlMessage::Ping(m) => self.handle_ping(&session, m),
            ControlMessage::ChannelState(m) => self.handle_channel_state(&session, m).await?,
            ControlMessage::ChannelRemove(m) => self.handle_channel_remove(&session, m).await?,
            ControlMessage::UserState(m) => self.handle_user_state(&session, m).await?,
            ControlMessage::UserRemove(m) => self.handle_user_remove(&session, m).await?,
            ControlMessage::BanList(m) => self.handle_ban_list(&session, m).await?,
            ControlMessage::TextMessage(m) => self.handle_text_message(&session, m),
            ControlMessage::Acl(m) => self.handle_acl(&session, m).await?,
            ControlMessage::QueryUsers(m) => self.handle_query_users(&session, m),
            ControlMessage::CryptSetup(m) => self.handle_crypt_setup(&session, m),
            ControlMessage::UserList(m) => self.handle_user_list(&session, m).await?,
            ControlMessage::VoiceTarget(m) => self.handle_voice_target(&session, m),
            ControlMessage::PermissionQuery(m) => self.handle_permission_query(&session, m),
            ControlMessage::UserStats(m) => self.handle_user_stats(&session, m),
            ControlMessage::RequestBlob(m) => self.handle_request_blob(&session, m),
            ControlMessage::Authenticate(m) => {
                // A repeated Authenticate refreshes the session's access
                // tokens; token changes invalidate cached permissions.
                *session.tokens.lock() = m.tokens.into_iter().collect();
                self.clear_acl_caches();
                debug!("Session {} refreshed its access tokens", session.id());
            }
            other => {
                debug!(
                    "Dropping client-sent {} from session {}",
                    other.name(),
                    session.id()
                );
            }
        }
        Ok(())
    }

    /// Sends a typed `PermissionDenied` back to the actor.
    pub(crate) fn deny(
        &self,
        session: &Arc<ClientSession>,
        what: DenyKind,
        permission: Permissions,
        channel_id: u32,
    ) {
        session.send(ControlMessage::PermissionDenied(PermissionDenied {
            what,
            permission: permission.bits(),
            channel_id,
            session: session.id(),
            reason: String::new(),
            name: String::new(),
        }));
    }

    /// Applies one typed configuration update from the loop's
    /// configuration queue: mutate the live config, record the override
    /// in the durable image, and announce surface-visible changes.
    pub async fn apply_config_update(&mut self, update: ConfigUpdate) -> Result<(), ServerError> {
        if let Err(e) = self.shared.config.write().set_key(&update.key, &update.value) {
            debug!("Rejected configuration update: {e}");
            return Ok(());
        }
        self.config_overrides
            .insert(update.key.clone(), update.value.clone());
        self.freeze(FreezerOp::ConfigSet {
            key: update.key,
            value: update.value,
        })
        .await?;
        self.broadcast(ControlMessage::ServerConfig(self.server_config_message()));
        Ok(())
    }

    /// The `ServerConfig` message reflecting the live configuration.
    pub(crate) fn server_config_message(&self) -> messages::ServerConfig {
        let config = self.shared.config.read();
        messages::ServerConfig {
            max_bandwidth: config.max_bandwidth,
            welcome_text: config.welcome_text.clone(),
            allow_html: config.allow_html,
            message_length: config.max_text_message_length as u32,
            image_message_length: config.max_image_message_length as u32,
            max_users: config.max_users,
        }
    }

    /// The full broadcastable record of a connected session.
    pub(crate) fn user_state_of(&self, session: &Arc<ClientSession>) -> UserState {
        let flags = *session.flags.lock();
        UserState {
            session: Some(session.id()),
            name: Some(session.username()),
            user_id: session.user_id(),
            channel_id: Some(session.channel_id()),
            mute: Some(flags.mute),
            deaf: Some(flags.deaf),
            suppress: Some(flags.suppress),
            self_mute: Some(flags.self_mute),
            self_deaf: Some(flags.self_deaf),
            priority_speaker: Some(flags.priority_speaker),
            recording: Some(flags.recording),
            texture_hash: session
                .texture_hash
                .lock()
                .as_ref()
                .map(|h| bytes::Bytes::from(h.clone().into_bytes())),
            comment_hash: session
                .comment_hash
                .lock()
                .as_ref()
                .map(|h| bytes::Bytes::from(h.clone().into_bytes())),
            hash: (!session.cert_digest.is_empty()).then(|| session.cert_digest.clone()),
            ..UserState::default()
        }
    }

    /// The full broadcastable record of a channel.
    pub(crate) fn channel_state_of(&self, channel_id: u32) -> Option<ChannelState> {
        let channel = self.tree.get(channel_id)?;
        Some(ChannelState {
            channel_id: Some(channel.id),
            parent: channel.parent,
            name: Some(channel.name.clone()),
            links: channel.links.iter().copied().collect(),
            description_hash: channel
                .description_hash
                .as_ref()
                .map(|h| bytes::Bytes::from(h.clone().into_bytes())),
            temporary: Some(channel.temporary),
            position: Some(channel.position),
            ..ChannelState::default()
        })
    }
}
