//! TCP relay server.
//!
//! Binds the configured address, accepts connections and spawns one task per
//! connection. Each task classifies its connection by the first line and hands
//! it to the receiver or sender flow.
//!
//! # Thread Safety
//!
//! The session table is shared via `Arc` and locks per slot. Nothing a single
//! connection does can stop the accept loop; every error is logged and
//! confined to that connection.

use crate::config::ServerConfig;
use crate::protocol::{line_reader, read_role, within, Role};
use crate::relay::RelayEngine;
use crate::rendezvous::Rendezvous;
use crate::session::SessionTable;
use crate::{PairlineError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running relay server. Dropping shuts down the server.
pub struct RelayServerHandle {
    addr: SocketAddr,
    table: Arc<SessionTable>,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RelayServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Connections currently being served, waiting receivers included.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting connections and signal every connection task to finish.
    ///
    /// Waiting receivers release their slots; running relays are aborted.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the accept loop to exit after [`shutdown`](Self::shutdown).
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RelayServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct ConnectionContext {
    rendezvous: Rendezvous,
    handshake_timeout: Option<Duration>,
    chunk_size: usize,
}

/// Relay server entry point.
pub struct RelayServer;

impl RelayServer {
    /// Validate `config`, bind the listener and start accepting in the background.
    pub async fn start(config: ServerConfig) -> Result<RelayServerHandle> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()?).await?;
        let addr = listener.local_addr()?;

        info!(
            max_sessions = config.max_sessions,
            chunk_size = config.chunk_size,
            "Relay server listening on {}",
            addr
        );

        let table = Arc::new(SessionTable::new(config.max_sessions));
        let ctx = Arc::new(ConnectionContext {
            rendezvous: Rendezvous::new(
                Arc::clone(&table),
                RelayEngine::new(config.chunk_size),
                config.pairing_timeout(),
            )
            .with_handshake_timeout(config.handshake_timeout()),
            handshake_timeout: config.handshake_timeout(),
            chunk_size: config.chunk_size,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            ctx,
            shutdown_rx,
            conn_shutdown_rx,
            Arc::clone(&active_connections),
        ));

        Ok(RelayServerHandle {
            addr,
            table,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<ConnectionContext>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Relay server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let ctx = Arc::clone(&ctx);
                            let conns = Arc::clone(&active_connections);
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, peer_addr, &ctx, &mut conn_shutdown).await {
                                    Self::log_connection_error(peer_addr, &e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &ConnectionContext,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = line_reader(read_half, ctx.chunk_size);

        let role = within(ctx.handshake_timeout, "client type", read_role(&mut reader)).await?;
        debug!(%peer, %role, "Classified connection");

        match role {
            Role::Receiver => {
                let exit = ctx
                    .rendezvous
                    .run_receiver(reader, write_half, peer, shutdown)
                    .await?;
                debug!(%peer, ?exit, "Receiver worker finished");
            }
            Role::Sender => {
                ctx.rendezvous
                    .run_sender(&mut reader, &mut write_half, peer, shutdown)
                    .await?;
            }
        }
        Ok(())
    }

    fn log_connection_error(peer: SocketAddr, err: &PairlineError) {
        match err {
            // Classifier failures: nothing else has logged these.
            PairlineError::Protocol { reply: None, .. } => warn!(%peer, "{}", err),
            // Already logged by the flow that produced them.
            PairlineError::Protocol { .. }
            | PairlineError::Relay { .. }
            | PairlineError::Capacity { .. }
            | PairlineError::PairingRejected { .. }
            | PairlineError::ReceiverGone { .. }
            | PairlineError::Timeout(_) => debug!(%peer, "Connection closed: {}", err),
            _ => warn!(%peer, "Connection ended: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    async fn connect(handle: &RelayServerHandle) -> BufReader<TcpStream> {
        BufReader::new(TcpStream::connect(handle.addr()).await.unwrap())
    }

    async fn read_reply(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = RelayServer::start(ServerConfig::local()).await.unwrap();

        assert!(handle.addr().port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_eq!(handle.table().capacity(), 100);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = ServerConfig {
            chunk_size: 0,
            ..ServerConfig::local()
        };
        assert!(matches!(
            RelayServer::start(config).await,
            Err(PairlineError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_role_is_closed_without_reply() {
        let handle = RelayServer::start(ServerConfig::local()).await.unwrap();

        let mut stream = connect(&handle).await;
        stream.write_all(b"HELLO\n").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The listener keeps serving.
        let mut receiver = connect(&handle).await;
        receiver.write_all(b"RECEIVER\n").await.unwrap();
        assert_eq!(read_reply(&mut receiver).await, "0");
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let handle = RelayServer::start(ServerConfig::local()).await.unwrap();

        let mut receiver = connect(&handle).await;
        receiver.write_all(b"RECEIVER\n").await.unwrap();
        let session = read_reply(&mut receiver).await;

        let mut sender = connect(&handle).await;
        sender
            .write_all(format!("SENDER\n{}\n", session).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut sender).await, "READY");
        sender.write_all(b"some file contents").await.unwrap();
        sender.get_mut().shutdown().await.unwrap();

        let mut payload = Vec::new();
        receiver.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"some file contents");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_silent_connection() {
        let config = ServerConfig {
            handshake_timeout_secs: Some(2),
            ..ServerConfig::local()
        };
        let handle = RelayServer::start(config).await.unwrap();

        let mut silent = connect(&handle).await;
        let mut rest = Vec::new();
        silent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
