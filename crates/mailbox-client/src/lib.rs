//! mailbox-client: Client side of the two-server DPF mailbox
//!
//! [`MailboxClient`] dials the servers once per operation. [`ClientSession`]
//! drives a stream of textual commands through a pool of workers.

pub mod client;
pub mod error;
pub mod session;

pub use client::{MailboxClient, WriteOutcome};
pub use error::ClientError;
pub use session::{ClientSession, Command, StatsReport};
