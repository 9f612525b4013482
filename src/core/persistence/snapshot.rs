// src/core/persistence/snapshot.rs

//! The full-image snapshot format.
//!
//! A snapshot is a single JSON document followed by a CRC-64 trailer line.
//! Saves go through a temp file and an atomic rename so a crash can never
//! leave a half-written image behind.

use crate::core::ServerError;
use crate::core::bans::Ban;
use crate::core::channel::Channel;
use crate::core::users::User;
use crc::{CRC_64_REDIS, Crc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::info;

const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// A consistent, serializable image of everything durable: channels
/// (with their ACLs and groups), registered users, bans, and runtime
/// configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerImage {
    pub server_id: u32,
    /// Channel id counter; persisted so removed ids are never reused.
    pub next_channel_id: u32,
    pub channels: Vec<Channel>,
    pub users: Vec<User>,
    pub bans: Vec<Ban>,
    pub config_overrides: BTreeMap<String, String>,
}

impl ServerImage {
    /// Replaces or inserts a channel record.
    pub fn upsert_channel(&mut self, channel: Channel) {
        self.next_channel_id = self.next_channel_id.max(channel.id + 1);
        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(slot) => *slot = channel,
            None => self.channels.push(channel),
        }
    }

    /// Drops a channel and scrubs every reference to it.
    pub fn remove_channel(&mut self, id: u32) {
        self.channels.retain(|c| c.id != id);
        for channel in &mut self.channels {
            channel.children.shift_remove(&id);
            channel.links.remove(&id);
            if channel.parent == Some(id) {
                channel.parent = Some(crate::core::channel::ROOT_ID);
            }
        }
    }

    pub fn upsert_user(&mut self, user: User) {
        match self.users.iter_mut().find(|u| u.id == user.id) {
            Some(slot) => *slot = user,
            None => self.users.push(user),
        }
    }

    /// Drops a user and scrubs ACL entries and group memberships.
    pub fn remove_user(&mut self, id: u32) {
        self.users.retain(|u| u.id != id);
        for channel in &mut self.channels {
            channel.acls.retain(|entry| entry.user_id != Some(id));
            for group in channel.groups.values_mut() {
                group.add.remove(&id);
                group.remove.remove(&id);
            }
        }
    }
}

/// Writes the image to `path` atomically, with a checksum trailer.
pub async fn save(image: &ServerImage, path: &Path) -> Result<(), ServerError> {
    let body = serde_json::to_string(image)?;
    let checksum = CHECKSUM_ALGO.checksum(body.as_bytes());
    let contents = format!("{body}\n{checksum:016x}\n");

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents.as_bytes()).await?;
    fs::rename(&tmp_path, path).await?;
    info!(
        "Wrote snapshot to {} ({} channels, {} users, {} bans)",
        path.display(),
        image.channels.len(),
        image.users.len(),
        image.bans.len()
    );
    Ok(())
}

/// Loads the image from `path`, verifying the checksum. Returns `None`
/// when no snapshot exists yet.
pub async fn load(path: &Path) -> Result<Option<ServerImage>, ServerError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(
                "No snapshot at {}. Starting with an empty image.",
                path.display()
            );
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines = raw.lines();
    let (Some(body), Some(trailer)) = (lines.next(), lines.next()) else {
        return Err(ServerError::Persistence(format!(
            "snapshot {} is truncated",
            path.display()
        )));
    };
    let expected = u64::from_str_radix(trailer.trim(), 16).map_err(|_| {
        ServerError::Persistence(format!("snapshot {} has a malformed checksum", path.display()))
    })?;
    let actual = CHECKSUM_ALGO.checksum(body.as_bytes());
    if expected != actual {
        return Err(ServerError::Persistence(format!(
            "snapshot {} failed its checksum ({expected:016x} != {actual:016x})",
            path.display()
        )));
    }
    let image: ServerImage = serde_json::from_str(body)?;
    info!(
        "Loaded snapshot from {} ({} channels, {} users, {} bans)",
        path.display(),
        image.channels.len(),
        image.users.len(),
        image.bans.len()
    );
    Ok(Some(image))
}
