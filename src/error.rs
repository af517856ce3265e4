use thiserror::Error;

use crate::protocol::kind::UnsupportedMessage;
use crate::protocol::ConnectionReason;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handshake rejected by broker: {0}")]
    HandshakeRejected(ConnectionReason),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedMessage),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;
