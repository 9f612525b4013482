// src/core/channel/acl.rs

//! ACL entries, groups, and effective-permission resolution.
//!
//! Resolution walks the ancestor chain of the queried channel, applying
//! entries top-down so that deeper channels override inherited grants. The
//! result is a plain bitmask; callers cache it in the permission cache
//! until the next ACL-affecting mutation.

use super::{Channel, ChannelTree, ROOT_ID};
use crate::core::users::SUPER_USER_ID;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

bitflags! {
    /// Per-channel permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const WRITE_ACL         = 0x1;
        const TRAVERSE          = 0x2;
        const ENTER             = 0x4;
        const SPEAK             = 0x8;
        const MUTE_DEAFEN       = 0x10;
        const MOVE              = 0x20;
        const MAKE_CHANNEL      = 0x40;
        const LINK_CHANNEL      = 0x80;
        const WHISPER           = 0x100;
        const TEXT_MESSAGE      = 0x200;
        const MAKE_TEMP_CHANNEL = 0x400;
        const KICK              = 0x10000;
        const BAN               = 0x20000;
        const REGISTER          = 0x40000;
        const SELF_REGISTER     = 0x80000;
    }
}

impl Permissions {
    /// What an unprivileged client may do when no ACL says otherwise.
    pub const DEFAULT: Permissions = Permissions::TRAVERSE
        .union(Permissions::ENTER)
        .union(Permissions::SPEAK)
        .union(Permissions::WHISPER)
        .union(Permissions::TEXT_MESSAGE);
}

/// One ACL entry attached to a channel: who it matches, where it applies,
/// and which bits it grants or denies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub apply_here: bool,
    pub apply_subs: bool,
    /// Matches a single registered user...
    pub user_id: Option<u32>,
    /// ...or a group name (possibly `!`-negated, `#token`, `all`, `auth`).
    pub group: Option<String>,
    pub grant: u64,
    pub deny: u64,
}

/// A named user-id set attached to a channel, with inheritance along the
/// tree plus session-scoped temporary additions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Whether this definition extends an inherited definition of the same
    /// name rather than replacing it.
    pub inherit: bool,
    /// Whether subchannels may inherit this definition.
    pub inheritable: bool,
    pub add: BTreeSet<u32>,
    pub remove: BTreeSet<u32>,
    /// Session-granted memberships; never persisted.
    #[serde(skip)]
    pub temporary: BTreeSet<u32>,
}

/// The identity facts permission resolution needs about a client.
#[derive(Debug, Clone, Default)]
pub struct AclSubject {
    /// Registered user id; `None` for anonymous sessions.
    pub user_id: Option<u32>,
    /// Access tokens presented by the session.
    pub tokens: HashSet<String>,
}

impl AclSubject {
    pub fn is_super_user(&self) -> bool {
        self.user_id == Some(SUPER_USER_ID)
    }
}

/// Computes the effective permission mask of `subject` on `channel_id`.
/// Unknown channels resolve to no permissions at all.
pub fn resolve(tree: &ChannelTree, channel_id: u32, subject: &AclSubject) -> Permissions {
    if subject.is_super_user() {
        return Permissions::all();
    }
    let Some(target) = tree.get(channel_id) else {
        return Permissions::empty();
    };

    // Collect the channels whose ACLs are in effect: walk up from the
    // target until a channel that does not inherit, then apply top-down.
    let mut active = Vec::new();
    let mut current = Some(target);
    while let Some(channel) = current {
        active.push(channel.id);
        if !channel.inherit_acls {
            break;
        }
        current = channel.parent.and_then(|p| tree.get(p));
    }
    active.reverse();

    let mut granted = Permissions::DEFAULT;
    for acl_channel in &active {
        let Some(channel) = tree.get(*acl_channel) else {
            continue;
        };
        for entry in &channel.acls {
            let applies = if *acl_channel == channel_id {
                entry.apply_here
            } else {
                entry.apply_subs
            };
            if !applies || !entry_matches(tree, channel, entry, subject) {
                continue;
            }
            granted &= !Permissions::from_bits_truncate(entry.deny);
            granted |= Permissions::from_bits_truncate(entry.grant);
        }
    }
    granted
}

fn entry_matches(
    tree: &ChannelTree,
    acl_channel: &Channel,
    entry: &AclEntry,
    subject: &AclSubject,
) -> bool {
    if let Some(user_id) = entry.user_id {
        return subject.user_id == Some(user_id);
    }
    match &entry.group {
        Some(group) => group_matches(tree, acl_channel.id, group, subject),
        None => false,
    }
}

/// Evaluates a group expression in the context of the channel that defines
/// the ACL entry.
fn group_matches(tree: &ChannelTree, context: u32, group: &str, subject: &AclSubject) -> bool {
    if let Some(negated) = group.strip_prefix('!') {
        return !group_matches(tree, context, negated, subject);
    }
    match group {
        "all" => true,
        "auth" => subject.user_id.is_some(),
        _ => {
            if let Some(token) = group.strip_prefix('#') {
                return subject.tokens.contains(token);
            }
            let Some(user_id) = subject.user_id else {
                return false;
            };
            group_members(tree, context, group).contains(&user_id)
        }
    }
}

/// The effective member set of a named group at `channel_id`: the chain is
/// walked from the root; a non-`inherit` definition restarts the set, a
/// non-`inheritable` definition stops propagating below its channel.
pub fn group_members(tree: &ChannelTree, channel_id: u32, name: &str) -> BTreeSet<u32> {
    let chain = match tree.chain(channel_id) {
        Some(chain) => chain,
        None => return BTreeSet::new(),
    };
    let mut members = BTreeSet::new();
    for id in chain {
        let Some(channel) = tree.get(id) else {
            continue;
        };
        if let Some(group) = channel.groups.get(name) {
            if !group.inherit {
                members.clear();
            }
            members.extend(group.add.iter().copied());
            for removed in &group.remove {
                members.remove(removed);
            }
            members.extend(group.temporary.iter().copied());
            if !group.inheritable && id != channel_id {
                members.clear();
            }
        }
    }
    members
}

/// Convenience used by the handlers: the root-channel mask sent in
/// `ServerSync` and `PermissionQuery` replies.
pub fn root_permissions(tree: &ChannelTree, subject: &AclSubject) -> Permissions {
    resolve(tree, ROOT_ID, subject)
}
