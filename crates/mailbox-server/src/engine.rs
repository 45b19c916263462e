//! Applying a DPF write across the table

use std::sync::Arc;

use mailbox_core::constants::TAG_SIZE;
use mailbox_core::wire::WriteHeader;
use mailbox_core::{DpfKey, Error, Role};

use crate::error::{Result, ServerError};
use crate::store::MailboxRow;

/// Decode a query and check it against the WRITE header, our role and the table
///
/// The table only grows, so a key that fits `table_rows` also fits any later
/// snapshot.
pub fn parse_query(
    bytes: &[u8],
    header: &WriteHeader,
    role: Role,
    table_rows: usize,
) -> Result<DpfKey> {
    let key = DpfKey::from_bytes(bytes)?;
    if key.data_size() != header.data_size {
        return Err(Error::SizeMismatch {
            what: "query data size",
            expected: header.data_size as usize,
            actual: key.data_size() as usize,
        }
        .into());
    }
    if key.party() != role.party() {
        return Err(ServerError::WrongParty {
            expected: if role.is_leader() { "leader" } else { "follower" },
            actual: key.party(),
        });
    }
    // tags past our last row would be missing from the sketch
    if key.domain_size() as usize > table_rows {
        return Err(ServerError::DomainExceedsTable {
            domain: key.domain_size(),
            rows: table_rows,
        });
    }
    Ok(key)
}

/// XOR the key's share into every row and return the position-tag vector
///
/// The vector holds one 16-byte tag per row of `rows`, in index order.
pub fn apply(key: &DpfKey, rows: &[Arc<MailboxRow>]) -> Vec<u8> {
    let mut tags = Vec::with_capacity(rows.len() * TAG_SIZE);
    for row in rows {
        let eval = key.evaluate(row.index(), row.data_size() as usize);
        if eval.share.iter().any(|&b| b != 0) {
            row.xor_in(&eval.share);
        }
        tags.extend_from_slice(&eval.tag.to_bytes());
    }
    tags
}

/// Undo an earlier [`apply`] of the same key over the same rows
pub fn revert(key: &DpfKey, rows: &[Arc<MailboxRow>]) {
    for row in rows {
        let eval = key.evaluate(row.index(), row.data_size() as usize);
        row.xor_in(&eval.share);
    }
}
