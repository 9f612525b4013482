// src/core/channel/mod.rs

//! The channel tree: an arena of channels keyed by stable integer ids.
//!
//! Parent/child/link relations are stored as id sets, so cyclic
//! relationships between channels and their members never translate into
//! ownership cycles. The tree is owned exclusively by the control loop;
//! nothing here is synchronized.

pub mod acl;

pub use acl::{AclEntry, AclSubject, Group, Permissions};

use crate::core::ServerError;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Channel id 0 is the root; it always exists and cannot be removed or
/// re-parented.
pub const ROOT_ID: u32 = 0;

const DEFAULT_ROOT_NAME: &str = "Root";

/// One node in the channel tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub parent: Option<u32>,
    /// Child ids in creation order.
    pub children: IndexSet<u32>,
    /// Symmetric link set; invariant: a ∈ b.links ⇔ b ∈ a.links.
    pub links: BTreeSet<u32>,
    pub acls: Vec<AclEntry>,
    pub groups: BTreeMap<String, Group>,
    pub inherit_acls: bool,
    pub temporary: bool,
    pub position: i32,
    /// Blob digest of the channel description, if one is set.
    pub description_hash: Option<String>,
    /// Session ids of present members. Runtime-only.
    #[serde(skip)]
    pub members: BTreeSet<u32>,
}

impl Channel {
    fn new(id: u32, name: String, parent: Option<u32>, temporary: bool) -> Self {
        Self {
            id,
            name,
            parent,
            children: IndexSet::new(),
            links: BTreeSet::new(),
            acls: Vec::new(),
            groups: BTreeMap::new(),
            inherit_acls: true,
            temporary,
            position: 0,
            description_hash: None,
            members: BTreeSet::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }
}

/// The arena of channels plus the monotonically increasing id counter.
/// Removed channel ids are never reused.
#[derive(Debug)]
pub struct ChannelTree {
    channels: HashMap<u32, Channel>,
    next_id: u32,
}

impl ChannelTree {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            ROOT_ID,
            Channel::new(ROOT_ID, DEFAULT_ROOT_NAME.to_string(), None, false),
        );
        Self {
            channels,
            next_id: ROOT_ID + 1,
        }
    }

    /// Rebuilds a tree from persisted channels. The id counter resumes past
    /// the highest persisted id.
    pub fn from_channels(list: Vec<Channel>) -> Result<Self, ServerError> {
        let mut tree = Self::new();
        let mut max_id = ROOT_ID;
        for channel in list {
            max_id = max_id.max(channel.id);
            tree.channels.insert(channel.id, channel);
        }
        if !tree.channels.contains_key(&ROOT_ID) {
            return Err(ServerError::Persistence("snapshot lost the root channel".into()));
        }
        tree.next_id = max_id + 1;
        Ok(tree)
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn peek_next_id(&self) -> u32 {
        self.next_id
    }

    /// Raises the id counter to at least `min`. Removed ids must never be
    /// reused, so restore paths feed the persisted counter through here.
    pub fn bump_next_id(&mut self, min: u32) {
        self.next_id = self.next_id.max(min);
    }

    /// All channels in ascending id order. Parents sort before their
    /// children only from the root, so tree-order consumers should use
    /// [`Self::walk`] instead.
    pub fn iter_by_id(&self) -> impl Iterator<Item = &Channel> {
        let mut ids: Vec<u32> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.channels.get(&id))
    }

    /// Pre-order traversal from the root: every parent is yielded before
    /// its children.
    pub fn walk(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.channels.len());
        let mut stack = vec![ROOT_ID];
        while let Some(id) = stack.pop() {
            if let Some(channel) = self.channels.get(&id) {
                out.push(id);
                // Reverse so that the first child is processed first.
                for child in channel.children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// Post-order traversal of the subtree rooted at `id`, deepest first,
    /// `id` itself last.
    pub fn subtree_postorder(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(channel) = self.channels.get(&current) {
                for child in channel.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        out
    }

    /// The chain root..=id, or `None` when `id` is not in the tree.
    pub fn chain(&self, id: u32) -> Option<Vec<u32>> {
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            let channel = self.channels.get(&current)?;
            chain.push(current);
            match channel.parent {
                Some(parent) => current = parent,
                None => break,
            }
            if chain.len() > self.channels.len() {
                // A corrupt parent relation must not hang the server.
                return None;
            }
        }
        chain.reverse();
        Some(chain)
    }

    /// True if `ancestor` lies on the parent chain of `id` (or equals it).
    pub fn is_ancestor_or_self(&self, ancestor: u32, id: u32) -> bool {
        self.chain(id)
            .map(|chain| chain.contains(&ancestor))
            .unwrap_or(false)
    }

    /// Creates a channel under `parent` and returns its id.
    pub fn add(&mut self, parent: u32, name: &str, temporary: bool) -> Result<u32, ServerError> {
        if !self.channels.contains_key(&parent) {
            return Err(ServerError::UnknownChannel(parent));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.channels
            .insert(id, Channel::new(id, name.to_string(), Some(parent), temporary));
        if let Some(parent_channel) = self.channels.get_mut(&parent) {
            parent_channel.children.insert(id);
        }
        Ok(id)
    }

    /// Re-parents `id` under `new_parent`, refusing cycles and root moves.
    pub fn move_channel(&mut self, id: u32, new_parent: u32) -> Result<(), ServerError> {
        if id == ROOT_ID {
            return Err(ServerError::TreeViolation("the root channel cannot be moved".into()));
        }
        if !self.channels.contains_key(&new_parent) {
            return Err(ServerError::UnknownChannel(new_parent));
        }
        if self.is_ancestor_or_self(id, new_parent) {
            return Err(ServerError::TreeViolation(format!(
                "moving channel {id} under {new_parent} would create a cycle"
            )));
        }
        let old_parent = self
            .channels
            .get(&id)
            .ok_or(ServerError::UnknownChannel(id))?
            .parent;
        if let Some(old) = old_parent
            && let Some(parent_channel) = self.channels.get_mut(&old)
        {
            parent_channel.children.shift_remove(&id);
        }
        if let Some(parent_channel) = self.channels.get_mut(&new_parent) {
            parent_channel.children.insert(id);
        }
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Links two channels. Both sides are updated together; linking a
    /// channel to itself or re-linking an existing pair is a no-op.
    pub fn link(&mut self, a: u32, b: u32) -> Result<(), ServerError> {
        if a == b {
            return Ok(());
        }
        if !self.channels.contains_key(&a) {
            return Err(ServerError::UnknownChannel(a));
        }
        if !self.channels.contains_key(&b) {
            return Err(ServerError::UnknownChannel(b));
        }
        if let Some(channel) = self.channels.get_mut(&a) {
            channel.links.insert(b);
        }
        if let Some(channel) = self.channels.get_mut(&b) {
            channel.links.insert(a);
        }
        Ok(())
    }

    /// Severs a link. Idempotent.
    pub fn unlink(&mut self, a: u32, b: u32) {
        if let Some(channel) = self.channels.get_mut(&a) {
            channel.links.remove(&b);
        }
        if let Some(channel) = self.channels.get_mut(&b) {
            channel.links.remove(&a);
        }
    }

    /// Removes a single childless channel, severing its remaining links and
    /// detaching it from its parent. Callers are responsible for relocating
    /// members and for removing subtrees in post-order first.
    pub fn remove_leaf(&mut self, id: u32) -> Result<Channel, ServerError> {
        if id == ROOT_ID {
            return Err(ServerError::TreeViolation("the root channel cannot be removed".into()));
        }
        let channel = self.channels.get(&id).ok_or(ServerError::UnknownChannel(id))?;
        if !channel.children.is_empty() {
            return Err(ServerError::TreeViolation(format!(
                "channel {id} still has subchannels"
            )));
        }
        let linked: Vec<u32> = channel.links.iter().copied().collect();
        for peer in linked {
            self.unlink(id, peer);
        }
        let removed = self
            .channels
            .remove(&id)
            .ok_or(ServerError::UnknownChannel(id))?;
        if let Some(parent) = removed.parent
            && let Some(parent_channel) = self.channels.get_mut(&parent)
        {
            parent_channel.children.shift_remove(&id);
        }
        Ok(removed)
    }

    /// Moves a session between member sets. Either side may be absent
    /// (a joining or leaving session).
    pub fn move_member(&mut self, session: u32, from: Option<u32>, to: Option<u32>) {
        if let Some(from_id) = from
            && let Some(channel) = self.channels.get_mut(&from_id)
        {
            channel.members.remove(&session);
        }
        if let Some(to_id) = to
            && let Some(channel) = self.channels.get_mut(&to_id)
        {
            channel.members.insert(session);
        }
    }

    /// Strips a deleted registered user from every ACL entry and every
    /// group member set in the tree.
    pub fn purge_user(&mut self, user_id: u32) {
        for channel in self.channels.values_mut() {
            channel
                .acls
                .retain(|entry| entry.user_id != Some(user_id));
            for group in channel.groups.values_mut() {
                group.add.remove(&user_id);
                group.remove.remove(&user_id);
                group.temporary.remove(&user_id);
            }
        }
    }

    /// Serializable image of every channel, in id order.
    pub fn snapshot_channels(&self) -> Vec<Channel> {
        self.iter_by_id().cloned().collect()
    }
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::new()
    }
}
