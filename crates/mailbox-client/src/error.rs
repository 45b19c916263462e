//! Client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] mailbox_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Row {index} does not exist ({rows} rows known)")]
    UnknownRow { index: u32, rows: u32 },

    #[error("Payload of {len} bytes exceeds the {max}-byte row size")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("Follower sent data on a NEW_ROW connection")]
    UnexpectedReply,
}

pub type Result<T> = std::result::Result<T, ClientError>;
