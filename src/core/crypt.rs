// src/core/crypt.rs

//! Per-session voice frame cryptography (OCB2-AES128).
//!
//! Every session owns one `CryptState` shared between the datagram receive
//! task (decrypt) and the serialized datagram sender (encrypt). The wire
//! format prepends a 4-byte header to each frame: one nonce byte and the
//! first three bytes of the authentication tag. The decrypt side keeps a
//! 256-entry nonce history so that late and duplicated frames are detected
//! without any per-frame allocation.

use crate::core::ServerError;
use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use std::time::Instant;
use subtle::ConstantTimeEq;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
/// Nonce byte plus truncated tag.
pub const HEADER_SIZE: usize = 4;

/// How long a decrypt drought must last before a resync may be requested,
/// and the minimum spacing between two resync requests.
const RESYNC_AFTER_SECS: u64 = 5;

pub struct CryptState {
    key: [u8; KEY_SIZE],
    cipher: Aes128,
    encrypt_iv: [u8; BLOCK_SIZE],
    decrypt_iv: [u8; BLOCK_SIZE],
    decrypt_history: [u8; 256],

    /// Local counters, reported to the client in `Ping` replies.
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,

    /// The client's view of the reverse direction, taken from `Ping`.
    pub remote_good: u32,
    pub remote_late: u32,
    pub remote_lost: u32,
    pub remote_resync: u32,

    last_good: Instant,
    last_request: Instant,
}

// Key material stays out of logs; only the counters are interesting.
impl std::fmt::Debug for CryptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptState")
            .field("good", &self.good)
            .field("late", &self.late)
            .field("lost", &self.lost)
            .field("resync", &self.resync)
            .finish_non_exhaustive()
    }
}

impl CryptState {
    /// Creates a state with a freshly generated key and nonce pair.
    /// An RNG failure here is unrecoverable for the process.
    pub fn generate() -> Result<Self, ServerError> {
        let mut key = [0u8; KEY_SIZE];
        let mut encrypt_iv = [0u8; BLOCK_SIZE];
        let mut decrypt_iv = [0u8; BLOCK_SIZE];
        getrandom::fill(&mut key)?;
        getrandom::fill(&mut encrypt_iv)?;
        getrandom::fill(&mut decrypt_iv)?;
        Ok(Self::with_material(key, encrypt_iv, decrypt_iv))
    }

    /// Builds a state from explicit material. Used by tests and by the
    /// resync path, which replaces only the nonces.
    pub fn with_material(
        key: [u8; KEY_SIZE],
        encrypt_iv: [u8; BLOCK_SIZE],
        decrypt_iv: [u8; BLOCK_SIZE],
    ) -> Self {
        let now = Instant::now();
        Self {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
            key,
            encrypt_iv,
            decrypt_iv,
            decrypt_history: [0u8; 256],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
            remote_good: 0,
            remote_late: 0,
            remote_lost: 0,
            remote_resync: 0,
            last_good: now,
            last_request: now,
        }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The nonce the peer must use to decrypt our frames.
    pub fn encrypt_nonce(&self) -> &[u8; BLOCK_SIZE] {
        &self.encrypt_iv
    }

    /// The nonce we use to decrypt the peer's frames.
    pub fn decrypt_nonce(&self) -> &[u8; BLOCK_SIZE] {
        &self.decrypt_iv
    }

    /// Installs a new decrypt nonce received in a `CryptSetup` answer.
    pub fn set_decrypt_nonce(&mut self, nonce: &[u8]) -> bool {
        if nonce.len() != BLOCK_SIZE {
            return false;
        }
        self.decrypt_iv.copy_from_slice(nonce);
        self.resync = self.resync.wrapping_add(1);
        true
    }

    /// True when the decrypt side has been failing long enough that a resync
    /// request should be sent. Rate-limited internally.
    pub fn should_request_resync(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_good).as_secs() > RESYNC_AFTER_SECS
            && now.duration_since(self.last_request).as_secs() > RESYNC_AFTER_SECS
        {
            self.last_request = now;
            return true;
        }
        false
    }

    /// Encrypts `plain` into `dst`. The output is exactly
    /// `plain.len() + HEADER_SIZE` bytes.
    pub fn encrypt(&mut self, plain: &[u8], dst: &mut Vec<u8>) {
        for i in 0..BLOCK_SIZE {
            self.encrypt_iv[i] = self.encrypt_iv[i].wrapping_add(1);
            if self.encrypt_iv[i] != 0 {
                break;
            }
        }

        let mut tag = [0u8; BLOCK_SIZE];
        dst.resize(plain.len() + HEADER_SIZE, 0);
        let nonce = self.encrypt_iv;
        self.ocb_encrypt(plain, &mut dst[HEADER_SIZE..], &nonce, &mut tag);
        dst[0] = self.encrypt_iv[0];
        dst[1..HEADER_SIZE].copy_from_slice(&tag[..HEADER_SIZE - 1]);
    }

    /// Decrypts `source` into `dst`, validating the truncated tag and the
    /// nonce against the replay history. On failure the nonce state is left
    /// exactly as it was.
    pub fn decrypt(&mut self, source: &[u8], dst: &mut Vec<u8>) -> Result<(), ServerError> {
        if source.len() < HEADER_SIZE {
            return Err(ServerError::CryptFailure);
        }
        let plain_len = source.len() - HEADER_SIZE;
        dst.resize(plain_len, 0);

        let saved_iv = self.decrypt_iv;
        let ivbyte = source[0];
        let mut restore = false;
        let mut late = false;
        let mut lost: i32 = 0;

        if self.decrypt_iv[0].wrapping_add(1) == ivbyte {
            // Next frame in sequence.
            if ivbyte > self.decrypt_iv[0] {
                self.decrypt_iv[0] = ivbyte;
            } else {
                // The low byte wrapped; carry into the higher bytes.
                self.decrypt_iv[0] = ivbyte;
                for i in 1..BLOCK_SIZE {
                    self.decrypt_iv[i] = self.decrypt_iv[i].wrapping_add(1);
                    if self.decrypt_iv[i] != 0 {
                        break;
                    }
                }
            }
        } else {
            // Out of order or repeated. Only a window of 30 frames in the
            // past is accepted.
            let mut diff = i32::from(ivbyte) - i32::from(self.decrypt_iv[0]);
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if ivbyte < self.decrypt_iv[0] && (-30..0).contains(&diff) {
                late = true;
                lost = -1;
                self.decrypt_iv[0] = ivbyte;
                restore = true;
            } else if ivbyte > self.decrypt_iv[0] && (-30..0).contains(&diff) {
                // Late frame from before the low byte wrapped; borrow from
                // the higher bytes for the duration of this decrypt.
                late = true;
                lost = -1;
                self.decrypt_iv[0] = ivbyte;
                for i in 1..BLOCK_SIZE {
                    let old = self.decrypt_iv[i];
                    self.decrypt_iv[i] = old.wrapping_sub(1);
                    if old != 0 {
                        break;
                    }
                }
                restore = true;
            } else if ivbyte > self.decrypt_iv[0] && diff > 0 {
                lost = i32::from(ivbyte) - i32::from(self.decrypt_iv[0]) - 1;
                self.decrypt_iv[0] = ivbyte;
            } else if ivbyte < self.decrypt_iv[0] && diff > 0 {
                lost = 256 - i32::from(self.decrypt_iv[0]) + i32::from(ivbyte) - 1;
                self.decrypt_iv[0] = ivbyte;
                for i in 1..BLOCK_SIZE {
                    self.decrypt_iv[i] = self.decrypt_iv[i].wrapping_add(1);
                    if self.decrypt_iv[i] != 0 {
                        break;
                    }
                }
            } else {
                return Err(ServerError::CryptFailure);
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = saved_iv;
                return Err(ServerError::CryptFailure);
            }
        }

        let mut tag = [0u8; BLOCK_SIZE];
        let nonce = self.decrypt_iv;
        self.ocb_decrypt(&source[HEADER_SIZE..], dst, &nonce, &mut tag);

        if tag[..HEADER_SIZE - 1]
            .ct_eq(&source[1..HEADER_SIZE])
            .unwrap_u8()
            == 0
        {
            self.decrypt_iv = saved_iv;
            return Err(ServerError::CryptFailure);
        }
        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if restore {
            self.decrypt_iv = saved_iv;
        }

        self.good = self.good.wrapping_add(1);
        if late {
            self.late = self.late.wrapping_add(1);
        }
        if lost > 0 {
            self.lost = self.lost.wrapping_add(lost as u32);
        } else if lost < 0 {
            self.lost = self.lost.saturating_sub(1);
        }
        self.last_good = Instant::now();
        Ok(())
    }

    fn aes_encrypt(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut b = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut b);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&b);
        out
    }

    fn aes_decrypt(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut b = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut b);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&b);
        out
    }

    fn ocb_encrypt(
        &self,
        plain: &[u8],
        out: &mut [u8],
        nonce: &[u8; BLOCK_SIZE],
        tag: &mut [u8; BLOCK_SIZE],
    ) {
        let mut delta = self.aes_encrypt(nonce);
        let mut checksum = [0u8; BLOCK_SIZE];
        let mut offset = 0;
        let mut remaining = plain.len();

        while remaining > BLOCK_SIZE {
            times2(&mut delta);
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&plain[offset..offset + BLOCK_SIZE]);
            xor_assign(&mut checksum, &block);
            let mut tmp = block;
            xor_assign(&mut tmp, &delta);
            tmp = self.aes_encrypt(&tmp);
            xor_assign(&mut tmp, &delta);
            out[offset..offset + BLOCK_SIZE].copy_from_slice(&tmp);
            offset += BLOCK_SIZE;
            remaining -= BLOCK_SIZE;
        }

        // Final (possibly partial) block: encrypt the bit length under
        // delta to derive a pad, then stream-xor the tail.
        times2(&mut delta);
        let mut tmp = [0u8; BLOCK_SIZE];
        let bits = (remaining as u64) * 8;
        tmp[BLOCK_SIZE - 8..].copy_from_slice(&bits.to_be_bytes());
        xor_assign(&mut tmp, &delta);
        let pad = self.aes_encrypt(&tmp);

        let mut last = [0u8; BLOCK_SIZE];
        last[..remaining].copy_from_slice(&plain[offset..offset + remaining]);
        last[remaining..].copy_from_slice(&pad[remaining..]);
        xor_assign(&mut checksum, &last);
        xor_assign(&mut last, &pad);
        out[offset..offset + remaining].copy_from_slice(&last[..remaining]);

        times3(&mut delta);
        xor_assign(&mut checksum, &delta);
        *tag = self.aes_encrypt(&checksum);
    }

    fn ocb_decrypt(
        &self,
        encrypted: &[u8],
        out: &mut [u8],
        nonce: &[u8; BLOCK_SIZE],
        tag: &mut [u8; BLOCK_SIZE],
    ) {
        let mut delta = self.aes_encrypt(nonce);
        let mut checksum = [0u8; BLOCK_SIZE];
        let mut offset = 0;
        let mut remaining = encrypted.len();

        while remaining > BLOCK_SIZE {
            times2(&mut delta);
            let mut tmp = [0u8; BLOCK_SIZE];
            tmp.copy_from_slice(&encrypted[offset..offset + BLOCK_SIZE]);
            xor_assign(&mut tmp, &delta);
            tmp = self.aes_decrypt(&tmp);
            xor_assign(&mut tmp, &delta);
            xor_assign(&mut checksum, &tmp);
            out[offset..offset + BLOCK_SIZE].copy_from_slice(&tmp);
            offset += BLOCK_SIZE;
            remaining -= BLOCK_SIZE;
        }

        times2(&mut delta);
        let mut tmp = [0u8; BLOCK_SIZE];
        let bits = (remaining as u64) * 8;
        tmp[BLOCK_SIZE - 8..].copy_from_slice(&bits.to_be_bytes());
        xor_assign(&mut tmp, &delta);
        let pad = self.aes_encrypt(&tmp);

        let mut last = [0u8; BLOCK_SIZE];
        last[..remaining].copy_from_slice(&encrypted[offset..offset + remaining]);
        xor_assign(&mut last, &pad);
        xor_assign(&mut checksum, &last);
        out[offset..offset + remaining].copy_from_slice(&last[..remaining]);

        times3(&mut delta);
        xor_assign(&mut checksum, &delta);
        *tag = self.aes_encrypt(&checksum);
    }
}

/// Doubling in GF(2^128) with the OCB reduction polynomial.
fn times2(block: &mut [u8; BLOCK_SIZE]) {
    let carry = block[0] >> 7;
    for i in 0..BLOCK_SIZE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK_SIZE - 1] = (block[BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
}

/// times3(x) = times2(x) ^ x.
fn times3(block: &mut [u8; BLOCK_SIZE]) {
    let mut doubled = *block;
    times2(&mut doubled);
    xor_assign(block, &doubled);
}

fn xor_assign(dst: &mut [u8; BLOCK_SIZE], src: &[u8; BLOCK_SIZE]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}
