//! Error types for mailbox-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Index out of bounds: {index} >= {max}")]
    IndexOutOfBounds { index: u64, max: u64 },

    #[error("Request limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Unknown operation code: {0}")]
    UnknownOpCode(u8),

    #[error("Sealed message could not be opened")]
    SealOpen,

    #[error("Sealing failed")]
    Seal,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Audit share rejected: {0}")]
    InvalidAuditShare(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
