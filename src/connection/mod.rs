// src/connection/mod.rs

pub mod handler;
pub mod session;

pub use handler::SessionHandler;
pub use session::{ClientSession, SessionPhase};
