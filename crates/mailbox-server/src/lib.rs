//! mailbox-server: Leader and follower for the two-server DPF mailbox
//!
//! Both roles keep an identical table of secret-shared rows. The leader
//! faces clients and relays the follower's sealed half of every write; the
//! follower only ever talks to the leader (and to clients for row creation).

pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod store;

pub use error::ServerError;
pub use handler::Handler;
pub use server::{MailboxServer, ServerBuilder};
pub use store::{MailboxRow, MailboxStore, SharedStore};
