// src/core/users.rs

//! Registered identities and the super-user credential scheme.

use crate::core::ServerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// User id 0 is the reserved super-user; it never appears in the registry.
pub const SUPER_USER_ID: u32 = 0;
pub const SUPER_USER_NAME: &str = "SuperUser";

const SALT_LEN: usize = 24;

/// A persistent registered identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub name: String,
    /// SHA-1 hex digest of the client certificate. Never empty.
    pub cert_digest: String,
    pub email: String,
    pub texture_hash: Option<String>,
    pub comment_hash: Option<String>,
    /// Channel the user last occupied, restored at login.
    pub last_channel: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

/// The in-memory registry with name and certificate-digest indexes.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<u32, User>,
    by_name: HashMap<String, u32>,
    by_digest: HashMap<String, u32>,
    next_id: u32,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            by_name: HashMap::new(),
            by_digest: HashMap::new(),
            next_id: SUPER_USER_ID + 1,
        }
    }

    /// Rebuilds the registry from persisted users.
    pub fn from_users(list: Vec<User>) -> Self {
        let mut registry = Self::new();
        for user in list {
            registry.next_id = registry.next_id.max(user.id + 1);
            registry.by_name.insert(user.name.clone(), user.id);
            registry
                .by_digest
                .insert(user.cert_digest.clone(), user.id);
            registry.users.insert(user.id, user);
        }
        registry
    }

    /// Registers a new identity. Registration requires a certificate.
    pub fn register(&mut self, name: &str, cert_digest: &str) -> Result<u32, ServerError> {
        if cert_digest.is_empty() {
            return Err(ServerError::Protocol(
                "registration requires a certificate digest".into(),
            ));
        }
        if self.by_name.contains_key(name) {
            return Err(ServerError::Protocol(format!("user name {name:?} is taken")));
        }
        let id = self.next_id;
        self.next_id += 1;
        let user = User {
            id,
            name: name.to_string(),
            cert_digest: cert_digest.to_string(),
            email: String::new(),
            texture_hash: None,
            comment_hash: None,
            last_channel: crate::core::channel::ROOT_ID,
            last_seen: None,
        };
        self.by_name.insert(user.name.clone(), id);
        self.by_digest.insert(user.cert_digest.clone(), id);
        self.users.insert(id, user);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&User> {
        self.by_name.get(name).and_then(|id| self.users.get(id))
    }

    pub fn find_by_digest(&self, digest: &str) -> Option<&User> {
        if digest.is_empty() {
            return None;
        }
        self.by_digest.get(digest).and_then(|id| self.users.get(id))
    }

    /// Renames a user, keeping the name index consistent.
    pub fn rename(&mut self, id: u32, new_name: &str) -> Result<(), ServerError> {
        if let Some(existing) = self.by_name.get(new_name)
            && *existing != id
        {
            return Err(ServerError::Protocol(format!(
                "user name {new_name:?} is taken"
            )));
        }
        let user = self.users.get_mut(&id).ok_or(ServerError::UnknownUser(id))?;
        self.by_name.remove(&user.name);
        user.name = new_name.to_string();
        self.by_name.insert(user.name.clone(), id);
        Ok(())
    }

    /// Applies a closure to a user; index-relevant fields must not be
    /// touched through this path.
    pub fn update(&mut self, id: u32, apply: impl FnOnce(&mut User)) -> Result<(), ServerError> {
        let user = self.users.get_mut(&id).ok_or(ServerError::UnknownUser(id))?;
        apply(user);
        Ok(())
    }

    pub fn remove(&mut self, id: u32) -> Option<User> {
        let user = self.users.remove(&id)?;
        self.by_name.remove(&user.name);
        self.by_digest.remove(&user.cert_digest);
        Some(user)
    }

    /// All users in ascending id order.
    pub fn iter_by_id(&self) -> impl Iterator<Item = &User> {
        let mut ids: Vec<u32> = self.users.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.users.get(&id))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn snapshot_users(&self) -> Vec<User> {
        self.iter_by_id().cloned().collect()
    }
}

/// Produces a `sha1$<hex-salt>$<hex-digest>` credential record from a
/// password, with a fresh 24-byte salt. An RNG failure is fatal upstream.
pub fn hash_super_user_password(password: &str) -> Result<String, ServerError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::fill(&mut salt)?;
    let digest = Sha1::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize();
    Ok(format!("sha1${}${}", hex::encode(salt), hex::encode(digest)))
}

/// Verifies a password against a stored credential record. The digest
/// comparison is constant-time; structural parsing is not secret-dependent.
pub fn verify_super_user_password(record: &str, password: &str) -> bool {
    let mut parts = record.split('$');
    let (Some(scheme), Some(salt_hex), Some(digest_hex), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != "sha1" {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    let digest = Sha1::new()
        .chain_update(&salt)
        .chain_update(password.as_bytes())
        .finalize();
    expected.ct_eq(digest.as_slice()).unwrap_u8() == 1
}
