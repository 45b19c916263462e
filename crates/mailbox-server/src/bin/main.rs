//! mailbox-server binary: leader or follower
//!
//! ```bash
//! mailbox-server --role follower --key-file follower-keys.json
//! mailbox-server --role leader --num-rows 1000 --metrics-port 9100
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mailbox_core::{AuditPolicy, Role, SealKeys, ServerConfig};
use mailbox_server::metrics::init_prometheus_exporter;
use mailbox_server::ServerBuilder;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailbox-server")]
#[command(about = "Leader or follower of the two-server DPF mailbox")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server role (leader or follower)
    #[arg(long)]
    role: Option<Role>,

    /// Leader address (host:port)
    #[arg(long)]
    leader_addr: Option<String>,

    /// Follower address (host:port)
    #[arg(long)]
    follower_addr: Option<String>,

    /// Cover rows to create at startup
    #[arg(long)]
    num_rows: Option<u32>,

    /// Per-row payload size in bytes
    #[arg(long)]
    data_size: Option<u32>,

    /// Number of connection workers
    #[arg(long)]
    num_threads: Option<usize>,

    /// What to do with a write that fails the audit (warn or rollback)
    #[arg(long)]
    audit_policy: Option<AuditPolicy>,

    /// Sealing keys (follower)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(ServerConfig, Option<u16>)> {
        let mut config = match (&self.config, self.role) {
            (Some(path), _) => ServerConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            (None, Some(role)) => ServerConfig::new(role),
            (None, None) => anyhow::bail!("either --config or --role is required"),
        };

        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(addr) = self.leader_addr {
            config.leader_addr = addr;
        }
        if let Some(addr) = self.follower_addr {
            config.follower_addr = addr;
        }
        if let Some(rows) = self.num_rows {
            config.num_rows = rows;
        }
        if let Some(size) = self.data_size {
            config.data_size = size;
        }
        if let Some(threads) = self.num_threads {
            config.num_threads = threads;
        }
        if let Some(policy) = self.audit_policy {
            config.audit_policy = policy;
        }
        if self.key_file.is_some() {
            config.key_file = self.key_file;
        }
        config.validate()?;
        Ok((config, self.metrics_port))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mailbox_server=info".parse()?)
                .add_directive("mailbox_core=info".parse()?),
        )
        .init();

    let (config, metrics_port) = Args::parse().into_config()?;

    if let Some(port) = metrics_port {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        init_prometheus_exporter(addr).context("starting metrics exporter")?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let mut builder = ServerBuilder::new(config.clone());
    match (&config.key_file, config.role) {
        (Some(path), Role::Follower) => {
            let keys = SealKeys::load(path)
                .with_context(|| format!("loading sealing keys from {}", path.display()))?;
            builder = builder.channel(keys.channel()?);
        }
        (None, Role::Follower) => anyhow::bail!("the follower needs --key-file"),
        (_, Role::Leader) => {}
    }

    tracing::info!(
        role = %config.role,
        rows = config.num_rows,
        data_size = config.data_size,
        policy = %config.audit_policy,
        "Starting mailbox server"
    );

    let server = builder.build().await?;
    server.run().await?;
    Ok(())
}
