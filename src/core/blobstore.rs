// src/core/blobstore.rs

//! Content-addressed storage for user comments, textures, and channel
//! descriptions. Blobs are keyed by their SHA-1 hex digest, so identical
//! content is stored once and broadcasts can carry the short digest
//! instead of the payload.

use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// Content below this size is sent inline instead of being stored.
pub const INLINE_LIMIT: usize = 128;

#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: HashMap<String, Bytes>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` and returns its digest key.
    pub fn put(&mut self, data: Bytes) -> String {
        let digest = hex::encode(Sha1::digest(&data));
        self.blobs.entry(digest.clone()).or_insert(data);
        digest
    }

    pub fn get(&self, digest: &str) -> Option<Bytes> {
        self.blobs.get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
