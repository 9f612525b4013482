// src/core/protocol/mod.rs

pub mod frame;
pub mod messages;
pub mod packet;

pub use frame::ControlCodec;
pub use messages::ControlMessage;
pub use packet::{VoiceFrame, VoiceKind};
