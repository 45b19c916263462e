//! mailbox-core: Shared primitives for the two-server DPF mailbox
//!
//! A client writes a payload into one of many mailbox rows held by two
//! non-colluding servers (leader and follower). The write is secret-shared
//! with a distributed point function, so neither server learns which row
//! changed or what was written. The two servers then run a secure-sketch
//! audit to catch a client whose query would touch more than one row.
//!
//! # Privacy & Threat Model
//!
//! ## Adversary Model
//!
//! - **Server model**: Two servers, honest-but-curious, non-colluding
//! - **Client model**: Possibly malicious; malformed writes must be detected
//! - **Non-goals**: Server collusion, key provisioning, rate limiting
//!
//! ## What Each Server Learns
//!
//! | Information | Leader | Follower |
//! |-------------|--------|----------|
//! | Target row of a write | NO | NO |
//! | Written payload | NO | NO |
//! | Row count, per-row size | YES | YES |
//! | Client network identity | YES | NO - only talks to the leader |
//! | Audit verdict | YES | YES |
//!
//! The leader relays the follower's DPF key and audit share as sealed
//! blobs it cannot open (see [`seal`]).

mod error;
pub mod audit;
pub mod config;
pub mod dpf;
pub mod field;
pub mod seal;
pub mod wire;

pub use audit::{
    client_audit_shares, compute_follower_answer, compute_leader_answer, setup_proof,
    verify_proof, Answer, AuditSeed, AuditShare, ClientAuditShares, ProofState,
};
pub use config::{AuditPolicy, ClientConfig, Role, ServerConfig, PROTOCOL_VERSION};
pub use dpf::{generate_query_pair, row_address, DpfKey, Evaluation, QueryPair};
pub use error::Error;
pub use field::Fp;
pub use seal::{SealKeys, SealedChannel};
pub use wire::OpCode;

pub type Result<T> = std::result::Result<T, Error>;

/// 16-byte client-chosen row identifier
pub type VirtualKey = [u8; 16];

/// 16-byte row address returned by row creation
pub type RowAddress = [u8; 16];

/// Fixed sizes of the wire and audit contracts
pub mod constants {
    /// Position tag size per row (one field element)
    pub const TAG_SIZE: usize = 16;

    /// Audit seed size
    pub const SEED_SIZE: usize = 16;

    /// Client audit share size (plaintext)
    pub const AUDIT_SHARE_SIZE: usize = 160;

    /// Audit answer size
    pub const ANSWER_SIZE: usize = 96;

    /// Verdict code size in the follower's bundle
    pub const VERDICT_SIZE: usize = 4;

    /// Completion code size sent to the client
    pub const COMPLETION_SIZE: usize = 4;

    /// Sealed channel nonce size (XChaCha20)
    pub const SEAL_NONCE_SIZE: usize = 24;

    /// Sealed channel authentication overhead (Poly1305 tag)
    pub const SEAL_OVERHEAD: usize = 16;

    /// Size of a sealed blob carrying `len` plaintext bytes
    pub const fn sealed_len(len: usize) -> usize {
        SEAL_NONCE_SIZE + len + SEAL_OVERHEAD
    }

    /// Default per-row payload size
    pub const DEFAULT_DATA_SIZE: u32 = 1024;
}
