// src/server/handlers/acl.rs

//! ACL and group queries and edits.

use crate::connection::session::ClientSession;
use crate::core::ServerError;
use crate::core::channel::acl::group_members;
use crate::core::channel::{AclEntry, Group, Permissions};
use crate::core::protocol::ControlMessage;
use crate::core::protocol::messages::{AclMessage, AclSpec, DenyKind, GroupSpec};
use crate::core::state::ServerCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

impl ServerCore {
    pub async fn handle_acl(
        &mut self,
        actor: &Arc<ClientSession>,
        msg: AclMessage,
    ) -> Result<(), ServerError> {
        let channel_id = msg.channel_id;
        if !self.tree.contains(channel_id) {
            return Ok(());
        }
        if !self.has_permission(actor, channel_id, Permissions::WRITE_ACL) {
            self.deny(actor, DenyKind::Permission, Permissions::WRITE_ACL, channel_id);
            return Ok(());
        }

        if msg.query {
            actor.send(ControlMessage::Acl(self.describe_acl(channel_id)));
            return Ok(());
        }

        self.apply_acl(channel_id, msg);
        info!("Session {} rewrote the ACL of channel {}", actor.id(), channel_id);
        self.clear_acl_caches();
        let persistent = self.tree.get(channel_id).is_some_and(|c| !c.temporary);
        if persistent {
            self.freeze_channel(channel_id).await?;
        }
        Ok(())
    }

    /// Builds the query reply: inherited entries from the ancestor chain
    /// first, then the channel's own, plus group definitions with their
    /// computed inherited membership.
    fn describe_acl(&self, channel_id: u32) -> AclMessage {
        let mut acls = Vec::new();
        let mut inherit_acls = true;

        if let Some(chain) = self.tree.chain(channel_id) {
            for ancestor in chain {
                let Some(channel) = self.tree.get(ancestor) else {
                    continue;
                };
                if ancestor == channel_id {
                    inherit_acls = channel.inherit_acls;
                }
                for entry in &channel.acls {
                    let inherited = ancestor != channel_id;
                    if inherited && !entry.apply_subs {
                        continue;
                    }
                    acls.push(AclSpec {
                        apply_here: entry.apply_here,
                        apply_subs: entry.apply_subs,
                        inherited,
                        user_id: entry.user_id,
                        group: entry.group.clone(),
                        grant: entry.grant,
                        deny: entry.deny,
                    });
                }
            }
        }

        let groups = match self.tree.get(channel_id) {
            Some(channel) => channel
                .groups
                .values()
                .map(|group| GroupSpec {
                    name: group.name.clone(),
                    inherited: false,
                    inherit: group.inherit,
                    inheritable: group.inheritable,
                    add: group.add.iter().copied().collect(),
                    remove: group.remove.iter().copied().collect(),
                    inherited_members: group_members(&self.tree, channel_id, &group.name)
                        .into_iter()
                        .collect(),
                })
                .collect(),
            None => Vec::new(),
        };

        AclMessage {
            channel_id,
            inherit_acls,
            groups,
            acls,
            query: true,
        }
    }

    /// Replaces the channel's ACL entries and group definitions. Inherited
    /// records in the message belong to ancestors and are skipped;
    /// session-scoped temporary memberships survive the rewrite.
    fn apply_acl(&mut self, channel_id: u32, msg: AclMessage) {
        let Some(channel) = self.tree.get_mut(channel_id) else {
            return;
        };
        channel.inherit_acls = msg.inherit_acls;

        channel.acls = msg
            .acls
            .into_iter()
            .filter(|spec| !spec.inherited)
            .map(|spec| AclEntry {
                apply_here: spec.apply_here,
                apply_subs: spec.apply_subs,
                user_id: spec.user_id,
                group: spec.group,
                grant: spec.grant,
                deny: spec.deny,
            })
            .collect();

        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for spec in msg.groups {
            if spec.inherited {
                continue;
            }
            let temporary = channel
                .groups
                .get(&spec.name)
                .map(|g| g.temporary.clone())
                .unwrap_or_default();
            groups.insert(
                spec.name.clone(),
                Group {
                    name: spec.name,
                    inherit: spec.inherit,
                    inheritable: spec.inheritable,
                    add: spec.add.into_iter().collect(),
                    remove: spec.remove.into_iter().collect(),
                    temporary,
                },
            );
        }
        channel.groups = groups;
    }
}
