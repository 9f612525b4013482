// src/core/protocol/packet.rs

//! Voice datagram framing.
//!
//! A decrypted voice frame starts with one header byte: the top 3 bits are
//! the payload kind, the bottom 5 bits the target selector. The rest is a
//! varint sequence number followed by opaque audio data. When relaying, the
//! server re-emits the header byte and splices the speaker's session id (as
//! a varint) between header and sequence.
//!
//! The 12-byte connectivity probe bypasses this framing entirely.

use crate::core::ServerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the unencrypted server-info probe datagram.
pub const PROBE_LEN: usize = 12;

/// Target selector carried in the low 5 bits of the header byte.
pub const TARGET_CURRENT_CHANNEL: u8 = 0;
pub const TARGET_LOOPBACK: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceKind {
    CeltAlpha = 0,
    Ping = 1,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

impl VoiceKind {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(VoiceKind::CeltAlpha),
            1 => Some(VoiceKind::Ping),
            2 => Some(VoiceKind::Speex),
            3 => Some(VoiceKind::CeltBeta),
            4 => Some(VoiceKind::Opus),
            _ => None,
        }
    }
}

/// A decrypted voice frame as received from a client.
#[derive(Debug, Clone)]
pub struct VoiceFrame {
    pub kind: VoiceKind,
    pub target: u8,
    /// Sequence varint plus audio payload, untouched.
    pub payload: Bytes,
}

impl VoiceFrame {
    /// Parses the plaintext of a decrypted datagram.
    pub fn parse(mut plain: Bytes) -> Result<Self, ServerError> {
        if plain.is_empty() {
            return Err(ServerError::Protocol("empty voice frame".into()));
        }
        let header = plain.get_u8();
        let kind = VoiceKind::from_bits(header >> 5)
            .ok_or_else(|| ServerError::Protocol(format!("voice kind {}", header >> 5)))?;
        Ok(Self {
            kind,
            target: header & 0x1f,
            payload: plain,
        })
    }

    /// Serializes the frame for relay to a listener, splicing in the
    /// speaker's session id after the header byte.
    pub fn relay_bytes(&self, speaker: u32) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + 9 + self.payload.len());
        out.put_u8(((self.kind as u8) << 5) | (self.target & 0x1f));
        put_varint(&mut out, u64::from(speaker));
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    /// Serializes the frame unchanged, for the loopback echo path.
    pub fn echo_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.payload.len());
        out.put_u8(((self.kind as u8) << 5) | (self.target & 0x1f));
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Writes `value` using the Mumble variable-length integer encoding.
pub fn put_varint(dst: &mut BytesMut, value: u64) {
    if value < 0x80 {
        dst.put_u8(value as u8);
    } else if value < 0x4000 {
        dst.put_u8(0x80 | (value >> 8) as u8);
        dst.put_u8(value as u8);
    } else if value < 0x20_0000 {
        dst.put_u8(0xc0 | (value >> 16) as u8);
        dst.put_u8((value >> 8) as u8);
        dst.put_u8(value as u8);
    } else if value < 0x1000_0000 {
        dst.put_u8(0xe0 | (value >> 24) as u8);
        dst.put_u8((value >> 16) as u8);
        dst.put_u8((value >> 8) as u8);
        dst.put_u8(value as u8);
    } else if value <= u64::from(u32::MAX) {
        dst.put_u8(0xf0);
        dst.put_u32(value as u32);
    } else {
        dst.put_u8(0xf4);
        dst.put_u64(value);
    }
}

/// Reads one Mumble varint. Negative encodings are resolved but reported
/// as their two's-complement u64 value.
pub fn get_varint(src: &mut Bytes) -> Result<u64, ServerError> {
    if src.is_empty() {
        return Err(ServerError::IncompleteFrame);
    }
    let first = src.get_u8();
    let need = |src: &Bytes, n: usize| {
        if src.remaining() < n {
            Err(ServerError::IncompleteFrame)
        } else {
            Ok(())
        }
    };
    let value = match first {
        b if b & 0x80 == 0 => u64::from(b),
        b if b & 0xc0 == 0x80 => {
            need(src, 1)?;
            (u64::from(b & 0x3f) << 8) | u64::from(src.get_u8())
        }
        b if b & 0xe0 == 0xc0 => {
            need(src, 2)?;
            (u64::from(b & 0x1f) << 16) | (u64::from(src.get_u8()) << 8) | u64::from(src.get_u8())
        }
        b if b & 0xf0 == 0xe0 => {
            need(src, 3)?;
            (u64::from(b & 0x0f) << 24)
                | (u64::from(src.get_u8()) << 16)
                | (u64::from(src.get_u8()) << 8)
                | u64::from(src.get_u8())
        }
        b if b & 0xfc == 0xf0 => {
            need(src, 4)?;
            u64::from(src.get_u32())
        }
        b if b & 0xfc == 0xf4 => {
            need(src, 8)?;
            src.get_u64()
        }
        b if b & 0xfc == 0xf8 => !get_varint(src)?,
        b => !u64::from(b & 0x03),
    };
    Ok(value)
}

/// Parses a server-info probe: a 12-byte datagram holding a 4-byte request
/// code and the client's 8-byte nonce. Returns the nonce when it matches.
pub fn parse_probe(datagram: &[u8]) -> Option<u64> {
    if datagram.len() != PROBE_LEN {
        return None;
    }
    let mut buf = datagram;
    if buf.get_u32() != 0 {
        return None;
    }
    Some(buf.get_u64())
}

/// Builds the probe reply: version, echoed nonce, then the current and
/// maximum user counts and the bandwidth cap.
pub fn probe_reply(
    version: u32,
    nonce: u64,
    current_users: u32,
    max_users: u32,
    max_bandwidth: u32,
) -> Bytes {
    let mut out = BytesMut::with_capacity(24);
    out.put_u32(version);
    out.put_u64(nonce);
    out.put_u32(current_users);
    out.put_u32(max_users);
    out.put_u32(max_bandwidth);
    out.freeze()
}
