// src/server/handlers/channel.rs

//! Channel creation, edits, links, and the remove cascade.

use crate::connection::session::ClientSession;
use crate::core::ServerError;
use crate::core::blobstore::INLINE_LIMIT;
use crate::core::channel::{Permissions, ROOT_ID};
use crate::core::persistence::FreezerOp;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{
    ChannelRemove, ChannelState, DenyKind, UserState,
};
use crate::core::state::ServerCore;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

impl ServerCore {
    pub async fn handle_channel_state(
        &mut self,
        session: &Arc<ClientSession>,
        msg: ChannelState,
    ) -> Result<(), ServerError> {
        match msg.channel_id {
            None => self.create_channel(session, msg).await,
            Some(id) => self.edit_channel(session, id, msg).await,
        }
    }

    async fn create_channel(
        &mut self,
        session: &Arc<ClientSession>,
        msg: ChannelState,
    ) -> Result<(), ServerError> {
        let parent = msg.parent.unwrap_or(ROOT_ID);
        let temporary = msg.temporary.unwrap_or(false);
        let Some(name) = msg.name.filter(|n| !n.trim().is_empty()) else {
            self.deny(session, DenyKind::ChannelName, Permissions::empty(), parent);
            return Ok(());
        };

        let Some(parent_channel) = self.tree.get(parent) else {
            return Ok(());
        };
        // A durable channel cannot live under an ephemeral one.
        if parent_channel.temporary && !temporary {
            self.deny(session, DenyKind::TemporaryChannel, Permissions::empty(), parent);
            return Ok(());
        }
        let sibling_clash = parent_channel
            .children
            .iter()
            .filter_map(|id| self.tree.get(*id))
            .any(|c| c.name == name);
        if sibling_clash {
            self.deny(session, DenyKind::ChannelName, Permissions::empty(), parent);
            return Ok(());
        }

        let needed = if temporary {
            Permissions::MAKE_TEMP_CHANNEL
        } else {
            Permissions::MAKE_CHANNEL
        };
        if !self.has_permission(session, parent, needed) {
            self.deny(session, DenyKind::Permission, needed, parent);
            return Ok(());
        }

        let id = self.tree.add(parent, &name, temporary)?;
        let description_hash = msg
            .description
            .as_ref()
            .filter(|d| !d.is_empty())
            .map(|d| self.blobs.put(Bytes::from(d.clone().into_bytes())));
        if let Some(channel) = self.tree.get_mut(id) {
            channel.position = msg.position.unwrap_or(0);
            channel.description_hash = description_hash;
        }
        self.clear_acl_caches();
        info!(
            "Session {} created {} channel {} ({:?}) under {}",
            session.id(),
            if temporary { "temporary" } else { "persistent" },
            id,
            name,
            parent
        );

        if let Some(state) = self.channel_state_of(id) {
            self.broadcast(ControlMessage::ChannelState(state));
        }
        if !temporary {
            self.freeze_channel(id).await?;
        }

        // The creator of a temporary channel lands inside it.
        if temporary {
            self.move_user(session.clone(), id, Some(session.id())).await?;
        }
        Ok(())
    }

    async fn edit_channel(
        &mut self,
        session: &Arc<ClientSession>,
        id: u32,
        msg: ChannelState,
    ) -> Result<(), ServerError> {
        if !self.tree.contains(id) {
            return Ok(());
        }
        let mut announce = ChannelState {
            channel_id: Some(id),
            ..ChannelState::default()
        };
        let mut touched = Vec::new();

        // Rename. A denied edit skips that edit alone; anything already
        // applied still gets announced below.
        if let Some(name) = msg.name.filter(|n| !n.trim().is_empty()) {
            if self.has_permission(session, id, Permissions::WRITE_ACL) {
                if let Some(channel) = self.tree.get_mut(id)
                    && channel.name != name
                {
                    channel.name = name.clone();
                    announce.name = Some(name);
                    touched.push(id);
                }
            } else {
                self.deny(session, DenyKind::Permission, Permissions::WRITE_ACL, id);
            }
        }

        // Re-parent.
        if let Some(new_parent) = msg.parent {
            let old_parent = self.tree.get(id).and_then(|c| c.parent);
            if old_parent != Some(new_parent) && id != ROOT_ID {
                let allowed = self.has_permission(session, id, Permissions::WRITE_ACL)
                    && self.has_permission(session, new_parent, Permissions::MAKE_CHANNEL);
                if allowed {
                    self.tree.move_channel(id, new_parent)?;
                    self.clear_acl_caches();
                    announce.parent = Some(new_parent);
                    touched.push(id);
                } else {
                    self.deny(session, DenyKind::Permission, Permissions::MAKE_CHANNEL, new_parent);
                }
            }
        }

        // Link edits; both sides of a new link need the permission.
        for peer in &msg.links_add {
            if !self.tree.contains(*peer) || *peer == id {
                continue;
            }
            let allowed = self.has_permission(session, id, Permissions::LINK_CHANNEL)
                && self.has_permission(session, *peer, Permissions::LINK_CHANNEL);
            if !allowed {
                self.deny(session, DenyKind::Permission, Permissions::LINK_CHANNEL, *peer);
                continue;
            }
            self.tree.link(id, *peer)?;
            announce.links_add.push(*peer);
            touched.push(id);
            touched.push(*peer);
        }
        for peer in &msg.links_remove {
            if !self.has_permission(session, id, Permissions::LINK_CHANNEL) {
                self.deny(session, DenyKind::Permission, Permissions::LINK_CHANNEL, id);
                continue;
            }
            self.tree.unlink(id, *peer);
            announce.links_remove.push(*peer);
            touched.push(id);
            touched.push(*peer);
        }

        // Description blob.
        if let Some(description) = msg.description {
            if self.has_permission(session, id, Permissions::WRITE_ACL) {
                let (hash, inline) = if description.is_empty() {
                    (None, None)
                } else if description.len() <= INLINE_LIMIT {
                    (None, Some(description.clone()))
                } else {
                    let digest = self
                        .blobs
                        .put(Bytes::from(description.clone().into_bytes()));
                    (Some(digest), None)
                };
                if let Some(channel) = self.tree.get_mut(id) {
                    channel.description_hash = hash.clone();
                }
                announce.description = inline;
                announce.description_hash = hash.map(|h| Bytes::from(h.into_bytes()));
                touched.push(id);
            } else {
                self.deny(session, DenyKind::Permission, Permissions::WRITE_ACL, id);
            }
        }

        if let Some(position) = msg.position
            && let Some(channel) = self.tree.get_mut(id)
            && channel.position != position
        {
            channel.position = position;
            announce.position = Some(position);
            touched.push(id);
        }

        if touched.is_empty() {
            return Ok(());
        }
        self.broadcast(ControlMessage::ChannelState(announce));

        touched.sort_unstable();
        touched.dedup();
        for channel_id in touched {
            let persistent = self.tree.get(channel_id).is_some_and(|c| !c.temporary);
            if persistent {
                self.freeze_channel(channel_id).await?;
            }
        }
        Ok(())
    }

    pub async fn handle_channel_remove(
        &mut self,
        session: &Arc<ClientSession>,
        msg: ChannelRemove,
    ) -> Result<(), ServerError> {
        let id = msg.channel_id;
        if !self.tree.contains(id) {
            return Ok(());
        }
        if id == ROOT_ID {
            self.deny(session, DenyKind::Permission, Permissions::WRITE_ACL, id);
            return Ok(());
        }
        if !self.has_permission(session, id, Permissions::WRITE_ACL) {
            self.deny(session, DenyKind::Permission, Permissions::WRITE_ACL, id);
            return Ok(());
        }
        info!("Session {} removing channel {}", session.id(), id);
        self.remove_channel_cascade(id, Some(session.id())).await
    }

    /// Removes a channel subtree: members are re-homed to their nearest
    /// permitted surviving ancestor (with a `UserState` broadcast each),
    /// then the channels fall deepest-first, each with its own
    /// `ChannelRemove` broadcast. Links are severed on both sides.
    pub async fn remove_channel_cascade(
        &mut self,
        id: u32,
        actor: Option<u32>,
    ) -> Result<(), ServerError> {
        let doomed = self.tree.subtree_postorder(id);
        let doomed_set: HashSet<u32> = doomed.iter().copied().collect();

        for victim in doomed {
            let members: Vec<u32> = self
                .tree
                .get(victim)
                .map(|c| c.members.iter().copied().collect())
                .unwrap_or_default();
            for member_id in members {
                let Some(member) = self.sessions.get(&member_id).cloned() else {
                    continue;
                };
                let dest = self.relocation_target(&member, victim, &doomed_set);
                self.tree.move_member(member_id, Some(victim), Some(dest));
                member.set_channel_id(dest);
                self.broadcast(ControlMessage::UserState(UserState {
                    session: Some(member_id),
                    actor,
                    channel_id: Some(dest),
                    ..UserState::default()
                }));
            }

            let was_persistent = self.tree.get(victim).is_some_and(|c| !c.temporary);
            self.tree.remove_leaf(victim)?;
            self.broadcast(ControlMessage::ChannelRemove(ChannelRemove {
                channel_id: victim,
            }));
            if was_persistent {
                // Replay scrubs links and child references from the
                // surviving records.
                self.freeze(FreezerOp::ChannelRemove { id: victim }).await?;
            }
        }
        self.clear_acl_caches();
        Ok(())
    }

    /// The nearest ancestor of `from` that survives the removal and that
    /// `member` may enter; the root as a last resort.
    fn relocation_target(
        &mut self,
        member: &Arc<ClientSession>,
        from: u32,
        doomed: &HashSet<u32>,
    ) -> u32 {
        let chain = self.tree.chain(from).unwrap_or_default();
        for candidate in chain.iter().rev().skip(1) {
            if doomed.contains(candidate) {
                continue;
            }
            if self.has_permission(member, *candidate, Permissions::ENTER) {
                return *candidate;
            }
        }
        ROOT_ID
    }
}
