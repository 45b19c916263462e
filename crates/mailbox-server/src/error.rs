//! Server error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] mailbox_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Follower unreachable at {addr}: {source}")]
    FollowerUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Query for party {actual} sent to the {expected} role")]
    WrongParty { expected: &'static str, actual: u8 },

    #[error("Query addresses {domain} rows but the table holds {rows}")]
    DomainExceedsTable { domain: u32, rows: usize },

    #[error("Sealing keys not configured")]
    MissingKeys,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Transport faults, as opposed to malformed or rejected requests
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::FollowerUnreachable { .. }
                | ServerError::Protocol(mailbox_core::Error::Io(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
