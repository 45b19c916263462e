//! Connection wire format
//!
//! Every connection carries exactly one operation, announced by its first
//! byte. All integers are little-endian `u32`.
//!
//! | Message | Layout |
//! |---------|--------|
//! | NEW_ROW request | `op | count | data_size | count x key[16]` |
//! | NEW_ROW reply (leader only) | `count x (index u32 | address[16])` |
//! | WRITE, client -> leader | `op | query_size | data_size | query_a | sealed query_b` |
//! | WRITE, leader -> client | `seed[16]`, later `completion u32` |
//! | WRITE, client -> leader | `share_a[160] | sealed share_b[200]` |
//! | WRITE, leader -> follower | `op | query_size | data_size | seed[16] | sealed query_b`, later `sealed share_b | ans_a[96]` |
//! | WRITE, follower -> leader | `verdict u32 | ans_b[96]` |

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{sealed_len, ANSWER_SIZE, AUDIT_SHARE_SIZE};
use crate::dpf::{query_size, MAX_DEPTH};
use crate::{Error, Result, RowAddress, VirtualKey};

/// Completion code for an accepted write
pub const COMPLETION_OK: u32 = 1;

/// Completion code for a write that was rejected and rolled back
pub const COMPLETION_REJECTED: u32 = 0;

/// First byte of every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    NewRow = 0,
    Write = 1,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::NewRow => "new_row",
            OpCode::Write => "write",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::NewRow),
            1 => Ok(OpCode::Write),
            other => Err(Error::UnknownOpCode(other)),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds a server enforces on request headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_rows_per_request: u32,
    pub max_data_size: u32,
}

impl Limits {
    fn check_data_size(&self, data_size: u32) -> Result<()> {
        if data_size > self.max_data_size {
            return Err(Error::LimitExceeded(format!(
                "data size {} exceeds {}",
                data_size, self.max_data_size
            )));
        }
        Ok(())
    }
}

pub async fn read_op<R: AsyncRead + Unpin>(reader: &mut R) -> Result<OpCode> {
    OpCode::try_from(reader.read_u8().await?)
}

pub async fn read_array<R: AsyncRead + Unpin, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn read_vec<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Batch of rows to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRowRequest {
    pub data_size: u32,
    pub keys: Vec<VirtualKey>,
}

impl NewRowRequest {
    /// Read the body that follows the op byte
    ///
    /// The whole batch is read before returning, so callers can take the
    /// table lock without waiting on the network.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, limits: &Limits) -> Result<Self> {
        let count = reader.read_u32_le().await?;
        let data_size = reader.read_u32_le().await?;
        if count > limits.max_rows_per_request {
            return Err(Error::LimitExceeded(format!(
                "{} rows requested, at most {} per request",
                count, limits.max_rows_per_request
            )));
        }
        limits.check_data_size(data_size)?;

        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push(read_array::<_, 16>(reader).await?);
        }
        Ok(Self { data_size, keys })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut msg = Vec::with_capacity(9 + 16 * self.keys.len());
        msg.push(OpCode::NewRow as u8);
        msg.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());
        msg.extend_from_slice(&self.data_size.to_le_bytes());
        for key in &self.keys {
            msg.extend_from_slice(key);
        }
        writer.write_all(&msg).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Leader's reply for one created row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAssignment {
    pub index: u32,
    pub address: RowAddress,
}

impl RowAssignment {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let index = reader.read_u32_le().await?;
        let address = read_array::<_, 16>(reader).await?;
        Ok(Self { index, address })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.address);
    }
}

/// Size prefix of every WRITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHeader {
    pub query_size: u32,
    pub data_size: u32,
}

impl WriteHeader {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, limits: &Limits) -> Result<Self> {
        let query_size = reader.read_u32_le().await?;
        let data_size = reader.read_u32_le().await?;
        limits.check_data_size(data_size)?;

        let max_query = query_size_bound(data_size);
        if query_size as usize > max_query {
            return Err(Error::MalformedQuery(format!(
                "query of {} bytes exceeds {} for data size {}",
                query_size, max_query, data_size
            )));
        }
        Ok(Self {
            query_size,
            data_size,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.query_size.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
    }

    /// Length of the sealed follower query that follows the plain one
    pub fn sealed_query_len(&self) -> usize {
        sealed_len(self.query_size as usize)
    }
}

/// Largest well-formed query for a given data size
fn query_size_bound(data_size: u32) -> usize {
    query_size(MAX_DEPTH, data_size)
}

/// Length of the sealed follower audit share
pub const SEALED_SHARE_SIZE: usize = sealed_len(AUDIT_SHARE_SIZE);

/// Follower's reply to the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictBundle {
    pub accepted: bool,
    pub answer: [u8; ANSWER_SIZE],
}

impl VerdictBundle {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let verdict = reader.read_u32_le().await?;
        let answer = read_array::<_, ANSWER_SIZE>(reader).await?;
        Ok(Self {
            accepted: verdict != 0,
            answer,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut msg = Vec::with_capacity(4 + ANSWER_SIZE);
        msg.extend_from_slice(&u32::from(self.accepted).to_le_bytes());
        msg.extend_from_slice(&self.answer);
        writer.write_all(&msg).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const LIMITS: Limits = Limits {
        max_rows_per_request: 4,
        max_data_size: 64,
    };

    #[test]
    fn test_opcode_from_byte() {
        assert_eq!(OpCode::try_from(0).unwrap(), OpCode::NewRow);
        assert_eq!(OpCode::try_from(1).unwrap(), OpCode::Write);
        assert!(matches!(OpCode::try_from(7), Err(Error::UnknownOpCode(7))));
    }

    #[tokio::test]
    async fn test_new_row_request_over_stream() {
        let (mut client, mut server) = duplex(1024);
        let request = NewRowRequest {
            data_size: 32,
            keys: vec![[1u8; 16], [2u8; 16]],
        };
        request.write_to(&mut client).await.unwrap();

        assert_eq!(read_op(&mut server).await.unwrap(), OpCode::NewRow);
        let received = NewRowRequest::read_from(&mut server, &LIMITS).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_new_row_limits_enforced() {
        let (mut client, mut server) = duplex(1024);
        let request = NewRowRequest {
            data_size: 32,
            keys: vec![[0u8; 16]; 5],
        };
        request.write_to(&mut client).await.unwrap();
        read_op(&mut server).await.unwrap();
        assert!(matches!(
            NewRowRequest::read_from(&mut server, &LIMITS).await,
            Err(Error::LimitExceeded(_))
        ));

        let (mut client, mut server) = duplex(1024);
        let request = NewRowRequest {
            data_size: 65,
            keys: vec![[0u8; 16]],
        };
        request.write_to(&mut client).await.unwrap();
        read_op(&mut server).await.unwrap();
        assert!(NewRowRequest::read_from(&mut server, &LIMITS).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_batch_is_an_io_error() {
        let (mut client, mut server) = duplex(1024);
        let mut msg = Vec::new();
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(&16u32.to_le_bytes());
        msg.extend_from_slice(&[9u8; 20]);
        client.write_all(&msg).await.unwrap();
        drop(client);

        assert!(matches!(
            NewRowRequest::read_from(&mut server, &LIMITS).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_write_header_rejects_oversized_query() {
        let (mut client, mut server) = duplex(64);
        let mut msg = Vec::new();
        WriteHeader {
            query_size: 1 << 20,
            data_size: 16,
        }
        .encode(&mut msg);
        client.write_all(&msg).await.unwrap();

        assert!(matches!(
            WriteHeader::read_from(&mut server, &LIMITS).await,
            Err(Error::MalformedQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_verdict_bundle_over_stream() {
        let (mut follower, mut leader) = duplex(256);
        let bundle = VerdictBundle {
            accepted: true,
            answer: [3u8; ANSWER_SIZE],
        };
        bundle.write_to(&mut follower).await.unwrap();
        assert_eq!(VerdictBundle::read_from(&mut leader).await.unwrap(), bundle);
    }
}
