//! Mailbox row table
//!
//! Rows are only ever appended. The table lock serializes growth against
//! snapshots; each row's share bytes sit behind their own mutex, so two
//! writes that land on the same row XOR into it one after the other.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use mailbox_core::wire::RowAssignment;
use mailbox_core::{row_address, RowAddress, VirtualKey};
use rand::RngCore;

/// One secret-shared mailbox slot
#[derive(Debug)]
pub struct MailboxRow {
    index: u32,
    key: VirtualKey,
    address: RowAddress,
    data_size: u32,
    share: Mutex<Vec<u8>>,
}

impl MailboxRow {
    fn new(index: u32, key: VirtualKey, data_size: u32) -> Self {
        Self {
            index,
            key,
            address: row_address(&key),
            data_size,
            share: Mutex::new(vec![0u8; data_size as usize]),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn key(&self) -> &VirtualKey {
        &self.key
    }

    pub fn address(&self) -> &RowAddress {
        &self.address
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Copy of this server's share
    pub fn share(&self) -> Vec<u8> {
        self.share.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// XOR `delta` into the stored share
    pub fn xor_in(&self, delta: &[u8]) {
        let mut share = self.share.lock().unwrap_or_else(PoisonError::into_inner);
        for (byte, d) in share.iter_mut().zip(delta) {
            *byte ^= d;
        }
    }
}

/// Ordered, append-only mailbox table
#[derive(Debug, Default)]
pub struct MailboxStore {
    rows: RwLock<Vec<Arc<MailboxRow>>>,
}

pub type SharedStore = Arc<MailboxStore>;

impl MailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `count` cover rows under random keys
    pub fn with_cover_rows<R: RngCore + ?Sized>(count: u32, data_size: u32, rng: &mut R) -> Self {
        let store = Self::new();
        let keys: Vec<VirtualKey> = (0..count)
            .map(|_| {
                let mut key = [0u8; 16];
                rng.fill_bytes(&mut key);
                key
            })
            .collect();
        store.add_rows(&keys, data_size);
        store
    }

    /// Append one row and return its index and address
    pub fn add_row(&self, key: VirtualKey, data_size: u32) -> (u32, RowAddress) {
        let assigned = self.add_rows(&[key], data_size);
        (assigned[0].index, assigned[0].address)
    }

    /// Append a batch under a single exclusive lock
    ///
    /// Indices in the batch are consecutive; no other batch interleaves.
    pub fn add_rows(&self, keys: &[VirtualKey], data_size: u32) -> Vec<RowAssignment> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        keys.iter()
            .map(|key| {
                let row = Arc::new(MailboxRow::new(rows.len() as u32, *key, data_size));
                let assigned = RowAssignment {
                    index: row.index,
                    address: row.address,
                };
                rows.push(row);
                assigned
            })
            .collect()
    }

    /// Snapshot of the current rows, in index order
    pub fn rows(&self) -> Vec<Arc<MailboxRow>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: u32) -> Option<Arc<MailboxRow>> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index as usize)
            .cloned()
    }

    /// This server's share of row `index`
    pub fn share(&self, index: u32) -> Option<Vec<u8>> {
        self.row(index).map(|row| row.share())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_indices_are_sequential() {
        let store = MailboxStore::new();
        let (first, addr) = store.add_row([1u8; 16], 64);
        let (second, _) = store.add_row([2u8; 16], 64);
        assert_eq!((first, second), (0, 1));
        assert_eq!(addr, row_address(&[1u8; 16]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_same_sequence_gives_same_table() {
        let leader = MailboxStore::with_cover_rows(3, 32, &mut StdRng::seed_from_u64(1));
        let follower = MailboxStore::with_cover_rows(3, 32, &mut StdRng::seed_from_u64(2));

        let keys: Vec<VirtualKey> = (10u8..15).map(|b| [b; 16]).collect();
        let a = leader.add_rows(&keys[..2], 32);
        let b = follower.add_rows(&keys[..2], 32);
        assert_eq!(a, b);
        assert_eq!(leader.add_row(keys[4], 32), follower.add_row(keys[4], 32));

        for (l, f) in leader.rows().iter().zip(follower.rows().iter()).skip(3) {
            assert_eq!(l.index(), f.index());
            assert_eq!(l.key(), f.key());
        }
    }

    #[test]
    fn test_cover_rows_start_zeroed() {
        let store = MailboxStore::with_cover_rows(4, 16, &mut StdRng::seed_from_u64(3));
        assert_eq!(store.len(), 4);
        assert!(store.rows().iter().all(|row| row.share() == vec![0u8; 16]));
        // random keys, not a fixed pattern
        let rows = store.rows();
        assert_ne!(rows[0].key(), rows[1].key());
    }

    #[test]
    fn test_xor_accumulates() {
        let store = MailboxStore::new();
        store.add_row([0u8; 16], 4);
        let row = store.row(0).unwrap();
        row.xor_in(&[0xAA; 4]);
        row.xor_in(&[0xFF; 4]);
        assert_eq!(store.share(0).unwrap(), vec![0x55; 4]);
        assert!(store.share(1).is_none());
    }

    #[test]
    fn test_snapshot_is_stable_while_table_grows() {
        let store = MailboxStore::new();
        store.add_row([0u8; 16], 8);
        let snapshot = store.rows();
        store.add_row([1u8; 16], 8);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }
}
