// src/core/protocol/frame.rs

//! Length-prefixed framing for the control channel and the corresponding
//! `Encoder`/`Decoder` pair.
//!
//! Every control frame is `[kind: u16 BE][length: u32 BE][payload]`. The
//! payload is decoded into a typed message by `messages`, keyed on `kind`.

use crate::core::ServerError;
use crate::core::protocol::messages::ControlMessage;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_HEADER_LEN: usize = 6;

// Protocol-level limit to prevent denial-of-service from malicious or
// malformed frames. Generous enough for the largest image message.
const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// A `tokio_util::codec` implementation for control frames.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_LEN];
        let kind = header.get_u16();
        let length = header.get_u32() as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(ServerError::Protocol(format!(
                "frame of {length} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit"
            )));
        }

        if src.len() < FRAME_HEADER_LEN + length {
            // Reserve for the rest of the frame so the next read has room.
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length).freeze();
        ControlMessage::decode(kind, payload).map(Some)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ServerError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        item.encode_payload(&mut payload);
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u16(item.kind());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
