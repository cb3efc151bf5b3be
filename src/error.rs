//! Error taxonomy for the coordination core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Datagram or stream delivery failed after the retry budget.
    #[error("transport send to {peer_id} failed: {reason}")]
    SendFailed { peer_id: String, reason: String },

    /// Stream could not be opened to the peer.
    #[error("peer {peer_id} unreachable")]
    Unreachable { peer_id: String },

    /// Malformed or unknown message; logged and dropped, never fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
