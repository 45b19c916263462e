//! End-to-end tests: a leader and a follower on ephemeral localhost ports
//!
//! Covers row creation, writes that accumulate by XOR, concurrent writes
//! racing row creation, and a corrupted follower key under both audit
//! policies.

use std::sync::Arc;

use mailbox_client::{ClientSession, MailboxClient};
use mailbox_core::{
    generate_query_pair, row_address, AuditPolicy, ClientConfig, DpfKey, QueryPair, Role,
    SealKeys, ServerConfig,
};
use mailbox_server::{ServerBuilder, SharedStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::BufReader;
use tokio::sync::oneshot;

const DATA_SIZE: u32 = 1024;

/// Offset of the first level correction seed in an encoded key
const FIRST_LEVEL_SEED: usize = 27;

struct Cluster {
    leader: SharedStore,
    follower: SharedStore,
    leader_addr: String,
    follower_addr: String,
    client_keys: SealKeys,
    _shutdown: Vec<oneshot::Sender<()>>,
}

impl Cluster {
    async fn start(policy: AuditPolicy, cover_rows: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(0x6d61696c);
        let (client_keys, follower_keys) = SealKeys::generate_pair(&mut rng);

        let follower_config = ServerConfig::new(Role::Follower)
            .with_addrs("127.0.0.1:0", "127.0.0.1:0")
            .with_rows(cover_rows, DATA_SIZE)
            .with_threads(4)
            .with_audit_policy(policy);
        let follower = ServerBuilder::new(follower_config)
            .channel(follower_keys.channel().unwrap())
            .build()
            .await
            .unwrap();
        let follower_addr = follower.local_addr().unwrap().to_string();

        let leader_config = ServerConfig::new(Role::Leader)
            .with_addrs("127.0.0.1:0", follower_addr.clone())
            .with_rows(cover_rows, DATA_SIZE)
            .with_threads(4)
            .with_audit_policy(policy);
        let leader = ServerBuilder::new(leader_config).build().await.unwrap();
        let leader_addr = leader.local_addr().unwrap().to_string();

        let leader_store = leader.store();
        let follower_store = follower.store();

        let mut shutdown = Vec::new();
        for server in [leader, follower] {
            let (tx, rx) = oneshot::channel::<()>();
            tokio::spawn(server.run_until(async move {
                let _ = rx.await;
            }));
            shutdown.push(tx);
        }

        Self {
            leader: leader_store,
            follower: follower_store,
            leader_addr,
            follower_addr,
            client_keys,
            _shutdown: shutdown,
        }
    }

    fn client(&self) -> MailboxClient {
        MailboxClient::new(
            self.leader_addr.clone(),
            self.follower_addr.clone(),
            DATA_SIZE,
            self.client_keys.channel().unwrap(),
        )
    }

    /// XOR of both servers' shares of row `index`
    fn recombine(&self, index: u32) -> Vec<u8> {
        let a = self.leader.share(index).unwrap();
        let b = self.follower.share(index).unwrap();
        a.iter().zip(&b).map(|(x, y)| x ^ y).collect()
    }

    fn recombine_all(&self) -> Vec<Vec<u8>> {
        (0..self.leader.len() as u32).map(|i| self.recombine(i)).collect()
    }
}

fn corrupt_follower_key(pair: QueryPair) -> QueryPair {
    let mut bytes = pair.b.to_bytes();
    bytes[FIRST_LEVEL_SEED] ^= 0x01;
    QueryPair {
        a: pair.a,
        b: DpfKey::from_bytes(&bytes).unwrap(),
    }
}

#[tokio::test]
async fn test_new_rows_are_assigned_in_order() {
    let cluster = Cluster::start(AuditPolicy::Warn, 0).await;
    let client = cluster.client();

    let first = client.create_row([7u8; 16]).await.unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(first.address, row_address(&[7u8; 16]));

    let second = client.create_row([8u8; 16]).await.unwrap();
    assert_eq!(second.index, 1);

    assert_eq!(cluster.leader.len(), 2);
    assert_eq!(cluster.follower.len(), 2);
    for index in 0..2 {
        let (a, b) = (
            cluster.leader.row(index).unwrap(),
            cluster.follower.row(index).unwrap(),
        );
        assert_eq!(a.key(), b.key());
        assert_eq!(a.address(), b.address());
    }
    assert_eq!(cluster.recombine(0), vec![0u8; DATA_SIZE as usize]);
}

#[tokio::test]
async fn test_writes_accumulate_by_xor() {
    let cluster = Cluster::start(AuditPolicy::Warn, 0).await;
    let client = cluster.client();
    client.create_rows(&[[1u8; 16], [2u8; 16]]).await.unwrap();

    let outcome = client.write(0, &[0xAA; 1024], 2).await.unwrap();
    assert!(outcome.accepted());
    assert_eq!(cluster.recombine(0), vec![0xAA; 1024]);
    assert_eq!(cluster.recombine(1), vec![0u8; 1024]);
    // each server alone holds a pseudorandom share
    assert_ne!(cluster.leader.share(0).unwrap(), vec![0xAA; 1024]);

    let outcome = client.write(0, &[0xFF; 1024], 2).await.unwrap();
    assert!(outcome.accepted());
    assert_eq!(cluster.recombine(0), vec![0x55; 1024]);
    assert_eq!(cluster.recombine(1), vec![0u8; 1024]);
}

#[tokio::test]
async fn test_short_payload_is_zero_padded() {
    let cluster = Cluster::start(AuditPolicy::Warn, 3).await;
    let client = cluster.client();

    let outcome = client.write(2, b"hello", 3).await.unwrap();
    assert!(outcome.accepted());

    let mut expected = vec![0u8; DATA_SIZE as usize];
    expected[..5].copy_from_slice(b"hello");
    assert_eq!(cluster.recombine(2), expected);
}

#[tokio::test]
async fn test_corrupted_write_is_rolled_back() {
    let cluster = Cluster::start(AuditPolicy::Rollback, 4).await;
    let client = cluster.client();

    assert!(client.write(1, &[0x11; 1024], 4).await.unwrap().accepted());
    let before = cluster.recombine_all();
    let leader_before: Vec<_> = (0..4).map(|i| cluster.leader.share(i).unwrap()).collect();

    let pair = generate_query_pair(2, &[0x22; 1024], 4, DATA_SIZE, &mut rand::thread_rng()).unwrap();
    let outcome = client.write_pair(&corrupt_follower_key(pair)).await.unwrap();
    assert!(!outcome.accepted());
    assert_eq!(outcome.completion, 0);

    assert_eq!(cluster.recombine_all(), before);
    let leader_after: Vec<_> = (0..4).map(|i| cluster.leader.share(i).unwrap()).collect();
    assert_eq!(leader_after, leader_before);

    // an honest write still goes through afterwards
    assert!(client.write(2, &[0x22; 1024], 4).await.unwrap().accepted());
    assert_eq!(cluster.recombine(2), vec![0x22; 1024]);
}

#[tokio::test]
async fn test_corrupted_write_is_kept_under_warn() {
    let cluster = Cluster::start(AuditPolicy::Warn, 4).await;
    let client = cluster.client();

    let pair = generate_query_pair(0, &[0x33; 1024], 4, DATA_SIZE, &mut rand::thread_rng()).unwrap();
    let outcome = client.write_pair(&corrupt_follower_key(pair)).await.unwrap();
    assert!(outcome.accepted());

    let zero = vec![0u8; DATA_SIZE as usize];
    let touched = cluster.recombine_all().iter().filter(|row| **row != zero).count();
    assert!(touched > 1, "corrupted key touched {} rows", touched);
}

#[tokio::test]
async fn test_write_past_table_is_refused() {
    let cluster = Cluster::start(AuditPolicy::Rollback, 3).await;
    let client = cluster.client();

    // the client believes in 8 rows, the servers hold 3
    assert!(client.write(1, &[0x44; 1024], 8).await.is_err());
    assert_eq!(cluster.recombine_all(), vec![vec![0u8; DATA_SIZE as usize]; 3]);

    assert!(client.write(1, &[0x44; 1024], 3).await.unwrap().accepted());
    assert_eq!(cluster.recombine(1), vec![0x44; 1024]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_race_row_creation() {
    let cluster = Cluster::start(AuditPolicy::Rollback, 4).await;
    let client = cluster.client();

    let mut writes = Vec::new();
    for i in 0..12u8 {
        let client = client.clone();
        let index = u32::from(i % 4);
        writes.push(tokio::spawn(async move {
            client.write(index, &[i + 1; 1024], 4).await
        }));
    }
    let creator = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut assigned = Vec::new();
            for k in 0..4u8 {
                assigned.push(client.create_row([0xC0 + k; 16]).await?);
            }
            Ok::<_, mailbox_client::ClientError>(assigned)
        })
    };

    for write in writes {
        assert!(write.await.unwrap().unwrap().accepted());
    }
    let assigned = creator.await.unwrap().unwrap();
    let indices: Vec<u32> = assigned.iter().map(|row| row.index).collect();
    assert_eq!(indices, vec![4, 5, 6, 7]);

    assert_eq!(cluster.leader.len(), 8);
    assert_eq!(cluster.follower.len(), 8);
    for index in 0..4u32 {
        let expected = (0..12u8)
            .filter(|i| u32::from(i % 4) == index)
            .fold(0u8, |acc, i| acc ^ (i + 1));
        assert_eq!(cluster.recombine(index), vec![expected; 1024], "row {}", index);
    }
    for index in 4..8u32 {
        assert_eq!(cluster.recombine(index), vec![0u8; DATA_SIZE as usize]);
        let (a, b) = (
            cluster.leader.row(index).unwrap(),
            cluster.follower.row(index).unwrap(),
        );
        assert_eq!(a.key(), b.key());
        assert_eq!(a.address(), b.address());
    }
}

#[tokio::test]
async fn test_session_drives_commands() {
    let cluster = Cluster::start(AuditPolicy::Warn, 3).await;
    let config = ClientConfig {
        num_threads: 1,
        existing_rows: 3,
        run_id: "e2e".into(),
        data_size: DATA_SIZE,
        ..ClientConfig::default()
    }
    .with_addrs(cluster.leader_addr.clone(), cluster.follower_addr.clone());
    let session = Arc::new(ClientSession::new(cluster.client(), &config));

    let script = "0\n0\n1 4 cafe\nnot-a-command\n1 9 00\n2\n1 3 ff\n";
    let report = session
        .clone()
        .run(BufReader::new(script.as_bytes()))
        .await
        .unwrap();

    assert_eq!(report.new_rows, 2);
    assert_eq!(report.writes, 1);
    assert_eq!(report.rejected, 0);
    // index 9 does not exist yet
    assert_eq!(report.failed, 1);
    assert_eq!(session.row_count(), 5);

    assert_eq!(cluster.leader.len(), 5);
    assert_eq!(cluster.follower.len(), 5);
    assert_eq!(&cluster.recombine(4)[..2], &[0xCA, 0xFE]);
    // commands after stop are never run
    assert_eq!(cluster.recombine(3), vec![0u8; DATA_SIZE as usize]);
}
