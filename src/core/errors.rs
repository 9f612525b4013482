// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete frame in stream")]
    IncompleteFrame,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("Voice frame failed authentication")]
    CryptFailure,

    #[error("Unknown channel {0}")]
    UnknownChannel(u32),

    #[error("Unknown session {0}")]
    UnknownSession(u32),

    #[error("Unknown user {0}")]
    UnknownUser(u32),

    #[error("Channel tree violation: {0}")]
    TreeViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("System RNG failure: {0}")]
    Rng(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ServerError {
    fn clone(&self) -> Self {
        match self {
            ServerError::Io(e) => ServerError::Io(Arc::clone(e)),
            ServerError::IncompleteFrame => ServerError::IncompleteFrame,
            ServerError::Protocol(s) => ServerError::Protocol(s.clone()),
            ServerError::MalformedMessage(s) => ServerError::MalformedMessage(s),
            ServerError::CryptFailure => ServerError::CryptFailure,
            ServerError::UnknownChannel(id) => ServerError::UnknownChannel(*id),
            ServerError::UnknownSession(id) => ServerError::UnknownSession(*id),
            ServerError::UnknownUser(id) => ServerError::UnknownUser(*id),
            ServerError::TreeViolation(s) => ServerError::TreeViolation(s.clone()),
            ServerError::Config(s) => ServerError::Config(s.clone()),
            ServerError::Persistence(s) => ServerError::Persistence(s.clone()),
            ServerError::Tls(s) => ServerError::Tls(s.clone()),
            ServerError::Rng(s) => ServerError::Rng(s.clone()),
            ServerError::Internal(s) => ServerError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Persistence(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        ServerError::Tls(e.to_string())
    }
}

impl From<getrandom::Error> for ServerError {
    fn from(e: getrandom::Error) -> Self {
        ServerError::Rng(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ServerError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        ServerError::Protocol("invalid UTF-8 in string field".into())
    }
}
