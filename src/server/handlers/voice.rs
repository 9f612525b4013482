// src/server/handlers/voice.rs

//! Voice frame routing on the control loop.
//!
//! Target 0 is the speaker's current channel plus directly linked
//! channels; 1–30 are session-registered whisper targets; 31 is loopback.
//! Deafened listeners and the speaker never receive a frame. Frames are
//! relayed as opaque payloads with the speaker's session id spliced in.

use crate::connection::session::ClientSession;
use crate::core::channel::Permissions;
use crate::core::events::VoiceEnvelope;
use crate::core::protocol::VoiceKind;
use crate::core::protocol::packet::{TARGET_CURRENT_CHANNEL, TARGET_LOOPBACK};
use crate::core::protocol::messages::VoiceTarget;
use crate::core::state::ServerCore;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

impl ServerCore {
    /// Registers (or clears) one of the session's whisper target slots.
    pub fn handle_voice_target(&mut self, session: &Arc<ClientSession>, msg: VoiceTarget) {
        if !(1..=30).contains(&msg.id) {
            debug!("Session {} tried to bind voice target {}", session.id(), msg.id);
            return;
        }
        let mut targets = session.whisper_targets.lock();
        if msg.targets.is_empty() {
            targets.remove(&(msg.id as u8));
        } else {
            targets.insert(msg.id as u8, msg.targets);
        }
    }

    /// Routes one decrypted voice frame from a speaker.
    pub fn route_voice(&mut self, envelope: VoiceEnvelope) {
        let speaker = envelope.session;
        if !speaker.is_ready() {
            return;
        }
        let frame = envelope.frame;

        // UDP pings echo straight back, completing the address
        // round-trip.
        if frame.kind == VoiceKind::Ping {
            self.send_voice(speaker.clone(), frame.echo_bytes());
            return;
        }

        {
            let flags = speaker.flags.lock();
            if flags.mute || flags.suppress || flags.self_mute {
                return;
            }
        }

        let payload = frame.relay_bytes(speaker.id());
        match frame.target {
            TARGET_LOOPBACK => {
                self.send_voice(speaker, payload);
            }
            TARGET_CURRENT_CHANNEL => {
                let channel_id = speaker.channel_id();
                if !self.has_permission(&speaker, channel_id, Permissions::SPEAK) {
                    return;
                }
                let mut listeners = BTreeSet::new();
                self.collect_channel_listeners(channel_id, true, false, &mut listeners);
                self.deliver(&speaker, listeners, payload);
            }
            whisper => {
                let specs = speaker.whisper_targets.lock().get(&whisper).cloned();
                let Some(specs) = specs else {
                    return;
                };
                let mut listeners = BTreeSet::new();
                for spec in &specs {
                    for session_id in &spec.sessions {
                        listeners.insert(*session_id);
                    }
                    if let Some(channel_id) = spec.channel_id {
                        if !self.tree.contains(channel_id) {
                            continue;
                        }
                        if !self.has_permission(&speaker, channel_id, Permissions::WHISPER) {
                            continue;
                        }
                        self.collect_channel_listeners(
                            channel_id,
                            spec.links,
                            spec.children,
                            &mut listeners,
                        );
                    }
                }
                self.deliver(&speaker, listeners, payload);
            }
        }
    }

    /// Members of a channel, optionally expanded over its link set and
    /// its subtree.
    fn collect_channel_listeners(
        &self,
        channel_id: u32,
        links: bool,
        children: bool,
        out: &mut BTreeSet<u32>,
    ) {
        let Some(channel) = self.tree.get(channel_id) else {
            return;
        };
        out.extend(channel.members.iter().copied());
        if links {
            for linked in &channel.links {
                if let Some(peer) = self.tree.get(*linked) {
                    out.extend(peer.members.iter().copied());
                }
            }
        }
        if children {
            for sub in self.tree.subtree_postorder(channel_id) {
                if let Some(subchannel) = self.tree.get(sub) {
                    out.extend(subchannel.members.iter().copied());
                }
            }
        }
    }

    fn deliver(&self, speaker: &Arc<ClientSession>, listeners: BTreeSet<u32>, payload: Bytes) {
        for listener_id in listeners {
            if listener_id == speaker.id() {
                continue;
            }
            let Some(listener) = self.sessions.get(&listener_id) else {
                continue;
            };
            if !listener.is_ready() {
                continue;
            }
            {
                let flags = listener.flags.lock();
                if flags.deaf || flags.self_deaf {
                    continue;
                }
            }
            self.send_voice(listener.clone(), payload.clone());
        }
    }
}
