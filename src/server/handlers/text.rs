// src/server/handlers/text.rs

//! Text message routing: direct sessions, channels, and whole subtrees.

use crate::connection::session::ClientSession;
use crate::core::channel::Permissions;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{DenyKind, TextMessage};
use crate::core::sanitize;
use crate::core::state::ServerCore;
use std::collections::BTreeSet;
use std::sync::Arc;

impl ServerCore {
    pub fn handle_text_message(&mut self, actor: &Arc<ClientSession>, msg: TextMessage) {
        let (allow_html, max_text, max_image) = {
            let config = self.shared.config.read();
            (
                config.allow_html,
                config.max_text_message_length,
                config.max_image_message_length,
            )
        };
        let message = match sanitize::clean_text_message(&msg.message, allow_html, max_text, max_image)
        {
            Ok(message) => message,
            Err(_) => {
                self.deny(actor, DenyKind::TextTooLong, Permissions::TEXT_MESSAGE, 0);
                return;
            }
        };

        // Collect recipients once so a session targeted through several
        // addresses still receives a single copy.
        let mut recipients: BTreeSet<u32> = BTreeSet::new();

        for session_id in &msg.sessions {
            if self.sessions.contains_key(session_id) {
                recipients.insert(*session_id);
            }
        }

        for channel_id in &msg.channels {
            if !self.tree.contains(*channel_id) {
                continue;
            }
            if !self.has_permission(actor, *channel_id, Permissions::TEXT_MESSAGE) {
                self.deny(actor, DenyKind::Permission, Permissions::TEXT_MESSAGE, *channel_id);
                continue;
            }
            if let Some(channel) = self.tree.get(*channel_id) {
                recipients.extend(channel.members.iter().copied());
            }
        }

        for root in &msg.trees {
            if !self.tree.contains(*root) {
                continue;
            }
            if !self.has_permission(actor, *root, Permissions::TEXT_MESSAGE) {
                self.deny(actor, DenyKind::Permission, Permissions::TEXT_MESSAGE, *root);
                continue;
            }
            for channel_id in self.tree.subtree_postorder(*root) {
                if let Some(channel) = self.tree.get(channel_id) {
                    recipients.extend(channel.members.iter().copied());
                }
            }
        }

        recipients.remove(&actor.id());
        let outgoing = TextMessage {
            actor: Some(actor.id()),
            sessions: msg.sessions,
            channels: msg.channels,
            trees: msg.trees,
            message,
        };
        for recipient_id in recipients {
            if let Some(recipient) = self.sessions.get(&recipient_id)
                && recipient.is_ready()
            {
                recipient.send(ControlMessage::TextMessage(outgoing.clone()));
            }
        }
    }
}
