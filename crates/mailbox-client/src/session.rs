//! Command-driven client session
//!
//! Commands arrive one per line:
//! - `0` create a row under a random key
//! - `1 <index> <hex payload>` write to a row
//! - `2` stop
//!
//! A bounded queue feeds a fixed pool of workers. Stop (or the end of the
//! input) sends one sentinel per worker, so each drains and exits.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mailbox_core::{ClientConfig, VirtualKey};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::client::MailboxClient;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NewRow,
    Write { index: u32, payload: Vec<u8> },
    Stop,
}

impl FromStr for Command {
    type Err = ClientError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["0"] => Ok(Command::NewRow),
            ["2"] => Ok(Command::Stop),
            ["1", index, payload] => {
                let index = index
                    .parse()
                    .map_err(|_| ClientError::InvalidCommand(format!("bad row index {:?}", index)))?;
                let payload = hex::decode(payload.trim_start_matches("0x"))
                    .map_err(|e| ClientError::InvalidCommand(format!("bad payload: {}", e)))?;
                Ok(Command::Write { index, payload })
            }
            ["1", ..] => Err(ClientError::InvalidCommand(
                "write takes a row index and a hex payload".into(),
            )),
            _ => Err(ClientError::InvalidCommand(format!("unknown command {:?}", line))),
        }
    }
}

struct Stats {
    new_rows: AtomicU64,
    writes: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    total_latency_us: AtomicU64,
    min_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            new_rows: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
        }
    }

    fn record_latency(&self, latency_us: u64) {
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.min_latency_us.fetch_min(latency_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    fn record_new_row(&self, latency_us: u64) {
        self.new_rows.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_us);
    }

    fn record_write(&self, accepted: bool, latency_us: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if !accepted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.record_latency(latency_us);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, duration: Duration) -> StatsReport {
        let new_rows = self.new_rows.load(Ordering::Relaxed);
        let writes = self.writes.load(Ordering::Relaxed);
        let completed = new_rows + writes;
        let min = self.min_latency_us.load(Ordering::Relaxed);

        StatsReport {
            new_rows,
            writes,
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duration,
            avg_latency_us: if completed > 0 {
                self.total_latency_us.load(Ordering::Relaxed) / completed
            } else {
                0
            },
            min_latency_us: if min == u64::MAX { 0 } else { min },
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate results of a drained session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub new_rows: u64,
    pub writes: u64,
    /// Writes the servers rejected and reverted
    pub rejected: u64,
    /// Commands that ended in an error
    pub failed: u64,
    pub duration: Duration,
    pub avg_latency_us: u64,
    pub min_latency_us: u64,
    pub max_latency_us: u64,
}

impl StatsReport {
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.new_rows + self.writes) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Drives commands against the servers with a pool of workers
pub struct ClientSession {
    client: MailboxClient,
    run_id: String,
    num_workers: usize,
    queue_depth: usize,
    rows: AtomicU32,
    row_lock: Mutex<()>,
    stats: Stats,
}

impl ClientSession {
    pub fn new(client: MailboxClient, config: &ClientConfig) -> Self {
        Self {
            client,
            run_id: config.run_id.clone(),
            num_workers: config.num_threads.max(1),
            queue_depth: config.queue_depth.max(1),
            rows: AtomicU32::new(config.existing_rows),
            row_lock: Mutex::new(()),
            stats: Stats::new(),
        }
    }

    /// Rows this session believes exist on the servers
    pub fn row_count(&self) -> u32 {
        self.rows.load(Ordering::Acquire)
    }

    /// Run one command on the calling task
    ///
    /// Every row creation of the session is serialized, so both servers
    /// apply them in the same order.
    pub async fn execute(&self, command: Command) -> Result<()> {
        let start = Instant::now();
        match command {
            Command::NewRow => {
                let mut key: VirtualKey = [0u8; 16];
                OsRng.fill_bytes(&mut key);

                let _guard = self.row_lock.lock().await;
                let assigned = self.client.create_row(key).await?;
                self.rows.fetch_max(assigned.index + 1, Ordering::AcqRel);
                self.stats.record_new_row(start.elapsed().as_micros() as u64);
                info!(
                    run_id = %self.run_id,
                    index = assigned.index,
                    address = %hex::encode(assigned.address),
                    "Added mailbox"
                );
            }
            Command::Write { index, payload } => {
                let outcome = self.client.write(index, &payload, self.row_count()).await?;
                self.stats
                    .record_write(outcome.accepted(), start.elapsed().as_micros() as u64);
                if !outcome.accepted() {
                    warn!(run_id = %self.run_id, "Write rejected by the servers");
                }
            }
            Command::Stop => {}
        }
        Ok(())
    }

    /// Feed commands from `source` through the worker pool until stop or EOF
    pub async fn run<R>(self: Arc<Self>, source: R) -> Result<StatsReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let start = Instant::now();
        let (tx, rx) = mpsc::channel::<Command>(self.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<_> = (0..self.num_workers)
            .map(|worker| {
                let session = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move { session.worker_loop(worker, rx).await })
            })
            .collect();

        let mut lines = source.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(Command::Stop) => break,
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(run_id = %self.run_id, error = %e, "Skipping command"),
            }
        }

        for _ in 0..self.num_workers {
            if tx.send(Command::Stop).await.is_err() {
                break;
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(run_id = %self.run_id, error = %e, "Worker task failed");
            }
        }

        let report = self.stats.report(start.elapsed());
        info!(
            run_id = %self.run_id,
            new_rows = report.new_rows,
            writes = report.writes,
            rejected = report.rejected,
            failed = report.failed,
            avg_latency_ms = report.avg_latency_us as f64 / 1000.0,
            throughput = report.throughput(),
            "Session drained"
        );
        Ok(report)
    }

    async fn worker_loop(&self, worker: usize, rx: Arc<Mutex<mpsc::Receiver<Command>>>) {
        loop {
            let next = rx.lock().await.recv().await;
            let command = match next {
                Some(Command::Stop) | None => break,
                Some(command) => command,
            };
            if let Err(e) = self.execute(command).await {
                self.stats.record_failure();
                warn!(run_id = %self.run_id, worker, error = %e, "Command failed");
            }
        }
    }
}
