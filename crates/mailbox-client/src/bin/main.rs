//! mailbox-client binary: runs a command session against both servers
//!
//! ```bash
//! printf '0\n1 0 68656c6c6f\n2\n' | mailbox-client --key-file client-keys.json
//! mailbox-client --key-file client-keys.json --commands run.txt --run-id bench-1
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mailbox_client::{ClientSession, MailboxClient};
use mailbox_core::{ClientConfig, SealKeys};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailbox-client")]
#[command(about = "Create and write private mailboxes")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Leader address (host:port)
    #[arg(long)]
    leader_addr: Option<String>,

    /// Follower address (host:port)
    #[arg(long)]
    follower_addr: Option<String>,

    /// Per-row payload size in bytes
    #[arg(long)]
    data_size: Option<u32>,

    /// Number of session workers
    #[arg(long)]
    num_threads: Option<usize>,

    /// Rows already present on the servers
    #[arg(long)]
    existing_rows: Option<u32>,

    /// Label for this run's log lines
    #[arg(long)]
    run_id: Option<String>,

    /// Sealing keys (client secret and follower public key)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Read commands from this file instead of stdin
    #[arg(long)]
    commands: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(addr) = &self.leader_addr {
            config.leader_addr = addr.clone();
        }
        if let Some(addr) = &self.follower_addr {
            config.follower_addr = addr.clone();
        }
        if let Some(size) = self.data_size {
            config.data_size = size;
        }
        if let Some(threads) = self.num_threads {
            config.num_threads = threads;
        }
        if let Some(rows) = self.existing_rows {
            config.existing_rows = rows;
        }
        if let Some(run_id) = &self.run_id {
            config.run_id = run_id.clone();
        }
        if let Some(path) = &self.key_file {
            config.key_file = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mailbox_client=info".parse()?)
                .add_directive("mailbox_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.config()?;

    let key_file = config
        .key_file
        .as_ref()
        .context("sealing keys are required (--key-file)")?;
    let keys = SealKeys::load(key_file)
        .with_context(|| format!("loading sealing keys from {}", key_file.display()))?;

    tracing::info!(
        leader = %config.leader_addr,
        follower = %config.follower_addr,
        data_size = config.data_size,
        workers = config.num_threads,
        existing_rows = config.existing_rows,
        run_id = %config.run_id,
        "Starting client session"
    );

    let client = MailboxClient::from_config(&config, keys.channel()?);
    let session = Arc::new(ClientSession::new(client, &config));

    let report = match &args.commands {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            session.run(BufReader::new(file)).await?
        }
        None => session.run(BufReader::new(tokio::io::stdin())).await?,
    };

    println!(
        "{} rows created, {} writes ({} rejected), {} failed in {:?} ({:.1} ops/sec)",
        report.new_rows,
        report.writes,
        report.rejected,
        report.failed,
        report.duration,
        report.throughput()
    );
    Ok(())
}
