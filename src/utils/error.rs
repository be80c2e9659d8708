//! Error types shared by the wire codec, the server engine and the client.
//!
//! Wire-level failures on the server (`Decode`, `Ownership`, `NotFound`) are
//! logged and dropped by the engine; the same variants are returned directly
//! to callers of the local server API and of the client API.

use thiserror::Error;

use crate::broker::connection::{ConnectionId, PubUid};

#[derive(Debug, Error)]
pub enum Nt4Error {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("topic '{name}' is not owned by connection {requester}")]
    Ownership {
        name: String,
        requester: ConnectionId,
    },

    #[error("invalid topic name: '{0}'")]
    InvalidTopicName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pubuid {0} is not published")]
    NotPublished(PubUid),

    #[error("not connected")]
    NotConnected,

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<serde_json::Error> for Nt4Error {
    fn from(e: serde_json::Error) -> Self {
        Nt4Error::Decode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Nt4Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Nt4Error::Decode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Nt4Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Nt4Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Nt4Error>;
