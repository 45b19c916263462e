//! Per-connection operation handlers
//!
//! A connection carries one operation. `NEW_ROW` is served the same way by
//! both roles, except that only the leader answers. A `WRITE` runs the
//! leader or follower half of the write protocol:
//!
//! ```text
//! client            leader                      follower
//!   | header,qA,[qB] ->|                            |
//!   |                  |-- header,seed,[qB] ------->|  (relay)
//!   |<- seed ----------|                            |  apply + sketch
//!   |-- sA,[sB] ------>|  apply + sketch            |
//!   |                  |-- [sB],ansA -------------->|
//!   |                  |<- verdict,ansB ------------|
//!   |<- completion ----|                            |
//! ```
//!
//! `[x]` is sealed for the follower. The relay, the client round and the
//! leader's local apply run concurrently; the leader's answer is computed
//! only after all three have finished.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mailbox_core::audit::{
    compute_follower_answer, compute_leader_answer, setup_proof, verify_proof, Answer, AuditSeed,
    AuditShare, ProofState,
};
use mailbox_core::constants::{ANSWER_SIZE, AUDIT_SHARE_SIZE, SEED_SIZE};
use mailbox_core::seal::{PURPOSE_AUDIT, PURPOSE_QUERY};
use mailbox_core::wire::{
    self, Limits, NewRowRequest, VerdictBundle, WriteHeader, COMPLETION_OK, COMPLETION_REJECTED,
    SEALED_SHARE_SIZE,
};
use mailbox_core::{AuditPolicy, DpfKey, OpCode, Role, SealedChannel, ServerConfig};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine;
use crate::error::{Result, ServerError};
use crate::metrics;
use crate::store::{MailboxRow, SharedStore};

type Applied = (DpfKey, Vec<Arc<MailboxRow>>, ProofState);

/// Serves connections for one server role
pub struct Handler {
    role: Role,
    store: SharedStore,
    follower_addr: String,
    policy: AuditPolicy,
    limits: Limits,
    channel: Option<SealedChannel>,
}

impl Handler {
    pub fn new(config: &ServerConfig, store: SharedStore, channel: Option<SealedChannel>) -> Self {
        Self {
            role: config.role,
            store,
            follower_addr: config.follower_addr.clone(),
            policy: config.audit_policy,
            limits: config.limits(),
            channel,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn role_label(&self) -> &'static str {
        match self.role {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }

    /// Serve one connection to completion
    ///
    /// Errors end this connection only; they are logged here with the
    /// operation and peer, then returned.
    pub async fn handle<S>(&self, mut stream: S, worker: usize, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let op = match wire::read_op(&mut stream).await {
            Ok(op) => op,
            Err(e) => {
                warn!(worker, %peer, error = %e, "Failed to read operation");
                return Err(e.into());
            }
        };

        let start = Instant::now();
        metrics::record_operation_start(op.as_str());
        let result = match (op, self.role) {
            (OpCode::NewRow, _) => self.new_row(&mut stream, worker).await,
            (OpCode::Write, Role::Leader) => self.leader_write(&mut stream, worker).await,
            (OpCode::Write, Role::Follower) => self.follower_write(&mut stream, worker).await,
        };
        metrics::record_operation_end(op.as_str());

        let outcome = match &result {
            Ok(()) => metrics::OUTCOME_OK,
            Err(e) if e.is_transport() => metrics::OUTCOME_TRANSPORT_ERROR,
            Err(_) => metrics::OUTCOME_CLIENT_ERROR,
        };
        metrics::record_operation(op.as_str(), outcome, start.elapsed());

        if let Err(e) = &result {
            error!(worker, op = %op, %peer, role = self.role_label(), error = %e, "Operation failed");
        }
        result
    }

    async fn new_row<S>(&self, stream: &mut S, worker: usize) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = NewRowRequest::read_from(stream, &self.limits).await?;
        let assigned = self.store.add_rows(&request.keys, request.data_size);
        metrics::set_table_rows(self.store.len());

        debug!(
            worker,
            role = self.role_label(),
            rows = assigned.len(),
            first_index = ?assigned.first().map(|a| a.index),
            "NEW_ROW"
        );

        if self.role.is_leader() {
            let mut reply = Vec::with_capacity(20 * assigned.len());
            for row in &assigned {
                row.encode(&mut reply);
            }
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
        Ok(())
    }

    async fn leader_write<S>(&self, client: &mut S, worker: usize) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let header = WriteHeader::read_from(client, &self.limits).await?;
        let query_a = wire::read_vec(client, header.query_size as usize).await?;
        let sealed_query_b = wire::read_vec(client, header.sealed_query_len()).await?;
        let key = engine::parse_query(&query_a, &header, Role::Leader, self.store.len())?;
        let seed = AuditSeed::random(&mut OsRng);

        let mut follower = TcpStream::connect(&self.follower_addr)
            .await
            .map_err(|source| ServerError::FollowerUnreachable {
                addr: self.follower_addr.clone(),
                source,
            })?;

        let local = self.spawn_apply(key, seed);

        let relay = async {
            let mut msg = Vec::with_capacity(1 + 8 + SEED_SIZE + sealed_query_b.len());
            msg.push(OpCode::Write as u8);
            header.encode(&mut msg);
            msg.extend_from_slice(seed.as_bytes());
            msg.extend_from_slice(&sealed_query_b);
            follower.write_all(&msg).await?;
            follower.flush().await?;
            Ok::<_, ServerError>(())
        };
        let client_round = async {
            client.write_all(seed.as_bytes()).await?;
            client.flush().await?;
            let share_a = wire::read_array::<_, AUDIT_SHARE_SIZE>(&mut *client).await?;
            let sealed_share_b = wire::read_vec(&mut *client, SEALED_SHARE_SIZE).await?;
            Ok::<_, ServerError>((share_a, sealed_share_b))
        };
        let exchanged = tokio::try_join!(relay, client_round);

        let (key, rows, state) = join_apply(local).await?;
        let ((), (share_a, sealed_share_b)) = match exchanged {
            Ok(exchanged) => exchanged,
            Err(e) => {
                self.abort(key, rows, worker).await?;
                return Err(e);
            }
        };

        let answer_a = AuditShare::from_bytes(&share_a)
            .and_then(|share| compute_leader_answer(&seed, &state, &share, &mut OsRng));
        let answer_a = match answer_a {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!(worker, error = %e, "Client audit share rejected");
                None
            }
        };

        let accepted = match self
            .exchange_answers(&mut follower, &sealed_share_b, answer_a.as_ref(), worker)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                self.abort(key, rows, worker).await?;
                return Err(e);
            }
        };

        let completion = if accepted {
            COMPLETION_OK
        } else {
            self.settle_rejected(key, rows, worker).await?
        };
        client.write_all(&completion.to_le_bytes()).await?;
        client.flush().await?;

        debug!(worker, accepted, completion, "WRITE done");
        Ok(())
    }

    /// Second leg with the follower; returns the joint verdict
    async fn exchange_answers(
        &self,
        follower: &mut TcpStream,
        sealed_share_b: &[u8],
        answer_a: Option<&Answer>,
        worker: usize,
    ) -> Result<bool> {
        // a rejected client share is forwarded as an all-zero answer, which
        // the follower can never verify
        let answer_bytes = answer_a.map(|a| a.to_bytes()).unwrap_or([0u8; ANSWER_SIZE]);
        let mut msg = Vec::with_capacity(sealed_share_b.len() + ANSWER_SIZE);
        msg.extend_from_slice(sealed_share_b);
        msg.extend_from_slice(&answer_bytes);
        follower.write_all(&msg).await?;
        follower.flush().await?;

        let bundle = VerdictBundle::read_from(follower).await?;
        if !bundle.accepted {
            warn!(worker, "Audit failed on follower");
        }

        let local = match (answer_a, Answer::from_bytes(&bundle.answer)) {
            (Some(a), Ok(b)) => verify_proof(a, &b),
            (_, Err(e)) => {
                warn!(worker, error = %e, "Malformed follower answer");
                false
            }
            (None, Ok(_)) => false,
        };
        if !local {
            warn!(worker, role = "leader", "Audit failed");
        }

        let accepted = local && bundle.accepted;
        metrics::record_audit(
            self.role_label(),
            if accepted { metrics::VERDICT_ACCEPTED } else { metrics::VERDICT_REJECTED },
        );
        Ok(accepted)
    }

    async fn follower_write<S>(&self, leader: &mut S, worker: usize) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let header = WriteHeader::read_from(leader, &self.limits).await?;
        let seed = AuditSeed::from_bytes(wire::read_array::<_, SEED_SIZE>(leader).await?);
        let sealed_query = wire::read_vec(leader, header.sealed_query_len()).await?;

        let channel = self.channel.as_ref().ok_or(ServerError::MissingKeys)?;
        let query = channel.open(PURPOSE_QUERY, &sealed_query)?;
        let key = engine::parse_query(&query, &header, Role::Follower, self.store.len())?;

        let (key, rows, state) = join_apply(self.spawn_apply(key, seed)).await?;

        let (accepted, answer_b) = match self
            .audit_verdict(leader, channel, &seed, &state, worker)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                self.abort(key, rows, worker).await?;
                return Err(e);
            }
        };
        // settle before replying, so the client's completion implies both
        // tables are final
        if !accepted {
            self.settle_rejected(key, rows, worker).await?;
        }

        VerdictBundle {
            accepted,
            answer: answer_b,
        }
        .write_to(leader)
        .await?;
        Ok(())
    }

    async fn audit_verdict<S>(
        &self,
        leader: &mut S,
        channel: &SealedChannel,
        seed: &AuditSeed,
        state: &ProofState,
        worker: usize,
    ) -> Result<(bool, [u8; ANSWER_SIZE])>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let sealed_share = wire::read_vec(leader, SEALED_SHARE_SIZE).await?;
        let answer_a = wire::read_array::<_, ANSWER_SIZE>(leader).await?;
        let share = channel.open(PURPOSE_AUDIT, &sealed_share)?;

        let outcome = AuditShare::from_bytes(&share).and_then(|share| {
            let answer_a = Answer::from_bytes(&answer_a)?;
            let answer_b = compute_follower_answer(seed, state, &share, &answer_a)?;
            Ok((verify_proof(&answer_a, &answer_b), answer_b.to_bytes()))
        });
        let (accepted, answer_b) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(worker, error = %e, "Audit inputs rejected");
                (false, [0u8; ANSWER_SIZE])
            }
        };
        if !accepted {
            warn!(worker, role = "follower", "Audit failed");
        }
        metrics::record_audit(
            self.role_label(),
            if accepted { metrics::VERDICT_ACCEPTED } else { metrics::VERDICT_REJECTED },
        );
        Ok((accepted, answer_b))
    }

    /// Apply the key and sketch the tags on the blocking pool
    fn spawn_apply(&self, key: DpfKey, seed: AuditSeed) -> JoinHandle<Result<Applied>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Applied> {
            let rows = store.rows();
            let tags = engine::apply(&key, &rows);
            let state = setup_proof(&seed, rows.len() as u32, &tags)?;
            Ok((key, rows, state))
        })
    }

    /// Completion code for a write the audit rejected
    async fn settle_rejected(
        &self,
        key: DpfKey,
        rows: Vec<Arc<MailboxRow>>,
        worker: usize,
    ) -> Result<u32> {
        match self.policy {
            AuditPolicy::Warn => Ok(COMPLETION_OK),
            AuditPolicy::Rollback => {
                self.rollback(key, rows, worker).await?;
                Ok(COMPLETION_REJECTED)
            }
        }
    }

    /// A write that failed midway is reverted only under the rollback policy
    async fn abort(&self, key: DpfKey, rows: Vec<Arc<MailboxRow>>, worker: usize) -> Result<()> {
        if self.policy == AuditPolicy::Rollback {
            self.rollback(key, rows, worker).await?;
        }
        Ok(())
    }

    async fn rollback(&self, key: DpfKey, rows: Vec<Arc<MailboxRow>>, worker: usize) -> Result<()> {
        tokio::task::spawn_blocking(move || engine::revert(&key, &rows))
            .await
            .map_err(|e| ServerError::Internal(format!("rollback task failed: {}", e)))?;
        metrics::record_rollback(self.role_label());
        info!(worker, role = self.role_label(), "Rolled back write");
        Ok(())
    }
}

async fn join_apply(handle: JoinHandle<Result<Applied>>) -> Result<Applied> {
    handle
        .await
        .map_err(|e| ServerError::Internal(format!("apply task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MailboxStore;
    use mailbox_core::wire::RowAssignment;
    use mailbox_core::row_address;
    use tokio::io::{duplex, AsyncReadExt};

    fn peer() -> SocketAddr {
        ([127, 0, 0, 1], 9).into()
    }

    fn handler(role: Role) -> Handler {
        let config = ServerConfig::new(role).with_rows(0, 32);
        Handler::new(&config, Arc::new(MailboxStore::new()), None)
    }

    #[tokio::test]
    async fn test_leader_new_row_replies() {
        let handler = handler(Role::Leader);
        let (mut client, server) = duplex(1024);

        let request = NewRowRequest {
            data_size: 32,
            keys: vec![[1u8; 16], [2u8; 16]],
        };
        request.write_to(&mut client).await.unwrap();
        handler.handle(server, 0, peer()).await.unwrap();

        let first = RowAssignment::read_from(&mut client).await.unwrap();
        let second = RowAssignment::read_from(&mut client).await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.address, row_address(&[1u8; 16]));
        assert_eq!(second.index, 1);
        assert_eq!(handler.store().len(), 2);
    }

    #[tokio::test]
    async fn test_follower_new_row_is_silent() {
        let handler = handler(Role::Follower);
        let (mut client, server) = duplex(1024);

        NewRowRequest {
            data_size: 32,
            keys: vec![[1u8; 16]],
        }
        .write_to(&mut client)
        .await
        .unwrap();
        handler.handle(server, 0, peer()).await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(handler.store().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_op_is_an_error() {
        let handler = handler(Role::Leader);
        let (mut client, server) = duplex(16);
        client.write_all(&[9u8]).await.unwrap();
        assert!(handler.handle(server, 0, peer()).await.is_err());
    }

    #[tokio::test]
    async fn test_follower_without_keys_rejects_write() {
        let handler = handler(Role::Follower);
        let (mut leader, server) = duplex(4096);

        let mut msg = vec![OpCode::Write as u8];
        WriteHeader {
            query_size: 100,
            data_size: 32,
        }
        .encode(&mut msg);
        msg.extend_from_slice(&[0u8; SEED_SIZE]);
        msg.extend_from_slice(&vec![0u8; mailbox_core::constants::sealed_len(100)]);
        leader.write_all(&msg).await.unwrap();

        assert!(matches!(
            handler.handle(server, 0, peer()).await,
            Err(ServerError::MissingKeys)
        ));
    }
}
