// src/server/handlers/query.rs

//! Read-only queries: pings, user lookups, permission queries, stats,
//! blob requests, and crypt resync answers.

use crate::connection::session::ClientSession;
use crate::core::channel::Permissions;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{
    ChannelState, CryptSetup, CryptStats, Ping, PermissionQuery, QueryUsers, RequestBlob,
    UserState, UserStats,
};
use crate::core::state::ServerCore;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;

impl ServerCore {
    /// Stores the client's view of the reverse voice path and answers
    /// with ours.
    pub fn handle_ping(&mut self, session: &Arc<ClientSession>, msg: Ping) {
        let reply = {
            let mut crypt = session.crypt.lock();
            crypt.remote_good = msg.good;
            crypt.remote_late = msg.late;
            crypt.remote_lost = msg.lost;
            crypt.remote_resync = msg.resync;
            Ping {
                timestamp: msg.timestamp,
                good: crypt.good,
                late: crypt.late,
                lost: crypt.lost,
                resync: crypt.resync,
            }
        };
        session.send(ControlMessage::Ping(reply));
    }

    /// Resolves registered ids to names and names to ids; unknown inputs
    /// are omitted from the reply.
    pub fn handle_query_users(&mut self, session: &Arc<ClientSession>, msg: QueryUsers) {
        let registry = self.shared.users.read();
        let mut ids = Vec::new();
        let mut names = Vec::new();
        for id in msg.ids {
            if let Some(user) = registry.get(id) {
                ids.push(user.id);
                names.push(user.name.clone());
            }
        }
        for name in msg.names {
            if let Some(user) = registry.find_by_name(&name) {
                ids.push(user.id);
                names.push(user.name.clone());
            }
        }
        drop(registry);
        session.send(ControlMessage::QueryUsers(QueryUsers { ids, names }));
    }

    /// A `CryptSetup` from the client either delivers a fresh client
    /// nonce (completing a server-requested resync) or asks for the
    /// server nonce.
    pub fn handle_crypt_setup(&mut self, session: &Arc<ClientSession>, msg: CryptSetup) {
        if msg.client_nonce.is_empty() {
            let server_nonce = {
                let crypt = session.crypt.lock();
                Bytes::copy_from_slice(crypt.encrypt_nonce())
            };
            session.send(ControlMessage::CryptSetup(CryptSetup {
                server_nonce,
                ..CryptSetup::default()
            }));
        } else {
            let accepted = session
                .crypt
                .lock()
                .set_decrypt_nonce(&msg.client_nonce);
            if !accepted {
                tracing::debug!(
                    "Session {} sent a crypt nonce of the wrong size",
                    session.id()
                );
            }
        }
    }

    pub fn handle_permission_query(&mut self, session: &Arc<ClientSession>, msg: PermissionQuery) {
        if !self.tree.contains(msg.channel_id) {
            return;
        }
        let (permissions, _) = self.query_permissions(session, msg.channel_id);
        session.send(ControlMessage::PermissionQuery(PermissionQuery {
            channel_id: msg.channel_id,
            permissions: permissions.bits(),
            flush: false,
        }));
    }

    /// Connection statistics for a session. The peer address is included
    /// only for self-queries and holders of `Register` on the root.
    pub fn handle_user_stats(&mut self, actor: &Arc<ClientSession>, msg: UserStats) {
        let target = if msg.session == 0 || msg.session == actor.id() {
            actor.clone()
        } else {
            match self.sessions.get(&msg.session) {
                Some(target) => target.clone(),
                None => return,
            }
        };
        let full = Arc::ptr_eq(&target, actor)
            || self.has_permission(actor, crate::core::channel::ROOT_ID, Permissions::REGISTER);

        let (from_client, from_server) = {
            let crypt = target.crypt.lock();
            (
                CryptStats {
                    good: crypt.good,
                    late: crypt.late,
                    lost: crypt.lost,
                    resync: crypt.resync,
                },
                CryptStats {
                    good: crypt.remote_good,
                    late: crypt.remote_late,
                    lost: crypt.remote_lost,
                    resync: crypt.remote_resync,
                },
            )
        };
        let address = if full {
            match target.peer_addr.ip() {
                IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
                IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
            }
        } else {
            Bytes::new()
        };
        actor.send(ControlMessage::UserStats(UserStats {
            session: target.id(),
            stats_only: !full,
            from_client,
            from_server,
            online_secs: target.online_secs(),
            idle_secs: target.idle_secs(),
            address,
        }));
    }

    /// Answers blob requests with `UserState`/`ChannelState` messages
    /// carrying the content inline, sent only to the requester.
    pub fn handle_request_blob(&mut self, session: &Arc<ClientSession>, msg: RequestBlob) {
        for target_id in msg.session_texture {
            if let Some(target) = self.sessions.get(&target_id) {
                let blob = target
                    .texture_hash
                    .lock()
                    .as_ref()
                    .and_then(|hash| self.blobs.get(hash));
                if let Some(blob) = blob {
                    session.send(ControlMessage::UserState(UserState {
                        session: Some(target_id),
                        texture: Some(blob),
                        ..UserState::default()
                    }));
                }
            }
        }
        for target_id in msg.session_comment {
            if let Some(target) = self.sessions.get(&target_id) {
                let blob = target
                    .comment_hash
                    .lock()
                    .as_ref()
                    .and_then(|hash| self.blobs.get(hash));
                if let Some(blob) = blob {
                    session.send(ControlMessage::UserState(UserState {
                        session: Some(target_id),
                        comment: String::from_utf8(blob.to_vec()).ok(),
                        ..UserState::default()
                    }));
                }
            }
        }
        for channel_id in msg.channel_description {
            let blob = self
                .tree
                .get(channel_id)
                .and_then(|c| c.description_hash.as_ref())
                .and_then(|hash| self.blobs.get(hash));
            if let Some(blob) = blob {
                session.send(ControlMessage::ChannelState(ChannelState {
                    channel_id: Some(channel_id),
                    description: String::from_utf8(blob.to_vec()).ok(),
                    ..ChannelState::default()
                }));
            }
        }
    }
}
