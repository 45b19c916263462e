//! Accept loop and worker pool

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use mailbox_core::{Role, SealedChannel, ServerConfig, PROTOCOL_VERSION};
use rand::rngs::OsRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Result, ServerError};
use crate::handler::Handler;
use crate::metrics;
use crate::store::{MailboxStore, SharedStore};

type ConnQueue = Arc<Mutex<mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>>>;

/// A bound leader or follower
pub struct MailboxServer {
    handler: Arc<Handler>,
    listener: TcpListener,
    num_threads: usize,
}

impl MailboxServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn role(&self) -> Role {
        self.handler.role()
    }

    /// The table, shared with the workers
    pub fn store(&self) -> SharedStore {
        self.handler.store().clone()
    }

    /// Run until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves
    ///
    /// Stops accepting, then waits for the workers to finish every connection
    /// already accepted, so no write is left applied on one server only.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(
            role = %self.role(),
            %addr,
            workers = self.num_threads,
            rows = self.handler.store().len(),
            version = PROTOCOL_VERSION,
            "Mailbox server listening"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let queue: ConnQueue = Arc::new(Mutex::new(rx));
        let workers: Vec<JoinHandle<()>> = (0..self.num_threads)
            .map(|worker| tokio::spawn(worker_loop(worker, queue.clone(), self.handler.clone())))
            .collect();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        if tx.send((stream, peer)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Worker task failed");
            }
        }
        tracing::info!(role = %self.role(), "Mailbox server stopped");
        Ok(())
    }
}

async fn worker_loop(worker: usize, queue: ConnQueue, handler: Arc<Handler>) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((stream, peer)) = next else {
            break;
        };
        // failures are logged by the handler and end only this connection
        let _ = handler.handle(stream, worker, peer).await;
    }
}

/// Builder for MailboxServer
pub struct ServerBuilder {
    config: ServerConfig,
    channel: Option<SealedChannel>,
    store: Option<SharedStore>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            channel: None,
            store: None,
        }
    }

    /// Sealed channel to the client; required for the follower
    pub fn channel(mut self, channel: SealedChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Use an existing table instead of creating cover rows
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Bind the listener and populate the table
    pub async fn build(self) -> Result<MailboxServer> {
        self.config.validate()?;
        if self.config.role == Role::Follower && self.channel.is_none() {
            return Err(ServerError::MissingKeys);
        }

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MailboxStore::with_cover_rows(
                self.config.num_rows,
                self.config.data_size,
                &mut OsRng,
            )),
        };
        metrics::set_table_rows(store.len());

        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let handler = Handler::new(&self.config, store, self.channel);

        Ok(MailboxServer {
            handler: Arc::new(handler),
            listener,
            num_threads: self.config.num_threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mailbox_core::wire::{NewRowRequest, RowAssignment};
    use mailbox_core::OpCode;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_follower_requires_channel() {
        let config = ServerConfig::follower().with_addrs("127.0.0.1:0", "127.0.0.1:0");
        assert!(matches!(
            ServerBuilder::new(config).build().await,
            Err(ServerError::MissingKeys)
        ));
    }

    #[tokio::test]
    async fn test_cover_rows_then_new_row() {
        let config = ServerConfig::leader()
            .with_addrs("127.0.0.1:0", "127.0.0.1:1")
            .with_rows(3, 16)
            .with_threads(2);
        let server = ServerBuilder::new(config).build().await.unwrap();
        let addr = server.local_addr().unwrap();
        let store = server.store();
        assert_eq!(store.len(), 3);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        NewRowRequest {
            data_size: 16,
            keys: vec![[5u8; 16]],
        }
        .write_to(&mut stream)
        .await
        .unwrap();
        let assigned = RowAssignment::read_from(&mut stream).await.unwrap();
        assert_eq!(assigned.index, 3);
        assert_eq!(store.len(), 4);

        let _ = shutdown_tx.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_connection() {
        let config = ServerConfig::leader()
            .with_addrs("127.0.0.1:0", "127.0.0.1:1")
            .with_rows(0, 16)
            .with_threads(2);
        let server = ServerBuilder::new(config).build().await.unwrap();
        let addr = server.local_addr().unwrap();
        let store = server.store();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        // start a NEW_ROW but hold back the key until after shutdown
        let mut msg = vec![OpCode::NewRow as u8];
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&16u32.to_le_bytes());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _ = shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        stream.write_all(&[6u8; 16]).await.unwrap();
        let assigned = RowAssignment::read_from(&mut stream).await.unwrap();
        assert_eq!(assigned.index, 0);
        assert_eq!(store.len(), 1);
        task.await.unwrap().unwrap();
    }
}
