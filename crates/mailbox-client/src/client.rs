//! Per-operation mailbox client

use mailbox_core::audit::{client_audit_shares, AuditSeed};
use mailbox_core::constants::SEED_SIZE;
use mailbox_core::seal::{PURPOSE_AUDIT, PURPOSE_QUERY};
use mailbox_core::wire::{self, NewRowRequest, RowAssignment, WriteHeader, COMPLETION_OK};
use mailbox_core::{generate_query_pair, ClientConfig, OpCode, QueryPair, SealedChannel, VirtualKey};
use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ClientError, Result};

/// Result of one write as reported by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub completion: u32,
}

impl WriteOutcome {
    /// False only when the servers rejected and reverted the write
    pub fn accepted(&self) -> bool {
        self.completion == COMPLETION_OK
    }
}

/// Dials the leader (and, for row creation, the follower) per operation
#[derive(Debug, Clone)]
pub struct MailboxClient {
    leader_addr: String,
    follower_addr: String,
    data_size: u32,
    channel: SealedChannel,
}

impl MailboxClient {
    pub fn new(
        leader_addr: impl Into<String>,
        follower_addr: impl Into<String>,
        data_size: u32,
        channel: SealedChannel,
    ) -> Self {
        Self {
            leader_addr: leader_addr.into(),
            follower_addr: follower_addr.into(),
            data_size,
            channel,
        }
    }

    pub fn from_config(config: &ClientConfig, channel: SealedChannel) -> Self {
        Self::new(
            config.leader_addr.clone(),
            config.follower_addr.clone(),
            config.data_size,
            channel,
        )
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Create rows on both servers; returns the leader's assignments
    ///
    /// Resolves only after the follower has closed its side, so a caller
    /// that serializes calls also serializes the follower's insertions.
    pub async fn create_rows(&self, keys: &[VirtualKey]) -> Result<Vec<RowAssignment>> {
        let request = NewRowRequest {
            data_size: self.data_size,
            keys: keys.to_vec(),
        };

        let (mut leader, mut follower) = tokio::try_join!(
            Self::connect(&self.leader_addr),
            Self::connect(&self.follower_addr)
        )?;

        let from_leader = async {
            request.write_to(&mut leader).await?;
            let mut assigned = Vec::with_capacity(keys.len());
            for _ in keys {
                assigned.push(RowAssignment::read_from(&mut leader).await?);
            }
            Ok::<_, ClientError>(assigned)
        };
        let from_follower = async {
            request.write_to(&mut follower).await?;
            let mut rest = Vec::new();
            follower.read_to_end(&mut rest).await?;
            if !rest.is_empty() {
                return Err(ClientError::UnexpectedReply);
            }
            Ok::<_, ClientError>(())
        };
        let (assigned, ()) = tokio::try_join!(from_leader, from_follower)?;

        tracing::debug!(rows = assigned.len(), "Rows created");
        Ok(assigned)
    }

    pub async fn create_row(&self, key: VirtualKey) -> Result<RowAssignment> {
        let mut assigned = self.create_rows(&[key]).await?;
        assigned.pop().ok_or(ClientError::UnexpectedReply)
    }

    /// Write `payload` into row `index` of a table of `row_count` rows
    ///
    /// Shorter payloads are zero-padded to the row size.
    pub async fn write(&self, index: u32, payload: &[u8], row_count: u32) -> Result<WriteOutcome> {
        if index >= row_count {
            return Err(ClientError::UnknownRow {
                index,
                rows: row_count,
            });
        }
        if payload.len() > self.data_size as usize {
            return Err(ClientError::PayloadTooLarge {
                len: payload.len(),
                max: self.data_size,
            });
        }

        let pair = generate_query_pair(index, payload, row_count, self.data_size, &mut OsRng)?;
        self.write_pair(&pair).await
    }

    /// Run the write protocol for an already generated key pair
    pub async fn write_pair(&self, pair: &QueryPair) -> Result<WriteOutcome> {
        let query_a = pair.a.to_bytes();
        let query_b = pair.b.to_bytes();
        let sealed_query_b = self.channel.seal(PURPOSE_QUERY, &query_b, &mut OsRng)?;

        let mut msg = Vec::with_capacity(9 + query_a.len() + sealed_query_b.len());
        msg.push(OpCode::Write as u8);
        WriteHeader {
            query_size: query_a.len() as u32,
            data_size: pair.a.data_size(),
        }
        .encode(&mut msg);
        msg.extend_from_slice(&query_a);
        msg.extend_from_slice(&sealed_query_b);

        let mut leader = Self::connect(&self.leader_addr).await?;
        leader.write_all(&msg).await?;
        leader.flush().await?;

        let seed = AuditSeed::from_bytes(wire::read_array::<_, SEED_SIZE>(&mut leader).await?);
        let shares = client_audit_shares(&seed, &pair.b, &mut OsRng);
        let sealed_share_b = self
            .channel
            .seal(PURPOSE_AUDIT, &shares.follower.to_bytes(), &mut OsRng)?;

        let share_a = shares.leader.to_bytes();
        let mut msg = Vec::with_capacity(share_a.len() + sealed_share_b.len());
        msg.extend_from_slice(&share_a);
        msg.extend_from_slice(&sealed_share_b);
        leader.write_all(&msg).await?;
        leader.flush().await?;

        let completion = leader.read_u32_le().await?;
        tracing::debug!(completion, "Write completed");
        Ok(WriteOutcome { completion })
    }
}
