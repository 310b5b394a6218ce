//! Receiver and sender flows of the rendezvous protocol.
//!
//! A receiver registers, is told its session id, then parks on the one-shot
//! readiness signal. While parked it also watches its own connection, an
//! optional pairing deadline and server shutdown; any of those releases the
//! slot instead of leaving it stuck.
//!
//! A sender names a session id, is matched to the waiting receiver and then
//! drives the relay engine on its own worker.

use crate::config::ProtocolConfig;
use crate::protocol::{read_session_id, within, write_line};
use crate::relay::{RelayEngine, RelayOutcome};
use crate::session::{ReceiverConn, ReceiverWriter, Registration, SessionTable};
use crate::{PairlineError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a parked receiver's wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    /// A sender paired; the relay now owns the receiver's connection.
    Paired,
    /// The slot was reset by someone else while waiting.
    Reset,
    /// The server is shutting down.
    Shutdown,
}

/// Shared state and policy the per-connection flows need.
pub struct Rendezvous {
    table: Arc<SessionTable>,
    engine: RelayEngine,
    pairing_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
}

impl Rendezvous {
    pub fn new(table: Arc<SessionTable>, engine: RelayEngine, pairing_timeout: Option<Duration>) -> Self {
        Self {
            table,
            engine,
            pairing_timeout,
            handshake_timeout: None,
        }
    }

    /// Bound how long a sender may take to name its session.
    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Register a receiver and wait until a sender pairs with it.
    ///
    /// `reader` and `writer` are the two halves of the receiver's connection.
    /// The writer is handed to the session table; the reader is only used to
    /// notice the receiver going away. EOF on the reader counts as leaving, so
    /// a receiver that half-closes its write side before pairing loses its slot.
    pub async fn run_receiver<R, W>(
        &self,
        mut reader: R,
        writer: W,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ReceiverExit>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn: ReceiverConn =
            Arc::new(tokio::sync::Mutex::new(Box::new(writer) as ReceiverWriter));

        // Hold the write side until the id line is out, so a relay can never
        // write payload ahead of it.
        let mut guard = conn.lock().await;
        let registration = match self.table.acquire(Arc::clone(&conn)) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(%peer, "Rejecting receiver: {}", e);
                reply_and_close(&mut **guard, &e).await;
                return Err(e);
            }
        };
        let session = registration.session;

        if let Err(e) = write_line(&mut **guard, &session.to_string()).await {
            self.table.release_waiting(session, registration.generation);
            return Err(e);
        }
        drop(guard);

        info!(session, %peer, "Receiver connected");
        self.wait_for_sender(registration, &mut reader, &conn, shutdown)
            .await
    }

    async fn wait_for_sender<R>(
        &self,
        mut registration: Registration,
        reader: &mut R,
        conn: &ReceiverConn,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ReceiverExit>
    where
        R: AsyncRead + Unpin,
    {
        let session = registration.session;
        let generation = registration.generation;
        let pairing_timeout = self.pairing_timeout;
        let deadline = async {
            match pairing_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let mut probe = [0u8; 256];

        loop {
            tokio::select! {
                ready = &mut registration.ready => {
                    return Ok(match ready {
                        Ok(()) => {
                            debug!(session, "Receiver paired");
                            ReceiverExit::Paired
                        }
                        Err(_) => {
                            debug!(session, "Slot reset while receiver was waiting");
                            ReceiverExit::Reset
                        }
                    });
                }
                read = reader.read(&mut probe) => match read {
                    Ok(0) | Err(_) => {
                        if self.table.release_waiting(session, generation) {
                            info!(session, "Receiver disconnected before pairing; slot released");
                            return Err(PairlineError::ReceiverGone { session });
                        }
                        // A sender won the race; the relay will see the broken connection.
                        return Ok(ReceiverExit::Paired);
                    }
                    Ok(n) => {
                        debug!(session, bytes = n, "Ignoring data from waiting receiver");
                    }
                },
                _ = &mut deadline => {
                    let limit = pairing_timeout.unwrap_or_default();
                    if self.table.release_waiting(session, generation) {
                        info!(session, "No sender within {:?}; slot released", limit);
                        let err = PairlineError::Timeout(limit);
                        let mut writer = conn.lock().await;
                        reply_and_close(&mut **writer, &err).await;
                        return Err(err);
                    }
                    let _ = (&mut registration.ready).await;
                    return Ok(ReceiverExit::Paired);
                }
                _ = shutdown.changed() => {
                    if self.table.release_waiting(session, generation) {
                        return Ok(ReceiverExit::Shutdown);
                    }
                    return Ok(ReceiverExit::Paired);
                }
            }
        }
    }

    /// Pair a sender with its receiver and relay its payload.
    ///
    /// `reader` must be positioned right after the `SENDER` line.
    pub async fn run_sender<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RelayOutcome>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let pairing = match within(self.handshake_timeout, "session id", read_session_id(reader))
            .await
            .and_then(|session| self.table.pair(session, peer))
        {
            Ok(pairing) => pairing,
            Err(e) => {
                warn!(%peer, "Rejecting sender: {}", e);
                reply_and_close(writer, &e).await;
                return Err(e);
            }
        };

        let session = pairing.session;
        if let Err(e) = write_line(writer, ProtocolConfig::READY_RESPONSE).await {
            self.engine.teardown(&self.table, pairing).await;
            return Err(e);
        }
        info!(session, %peer, "Sender connected");

        self.engine
            .run(&self.table, pairing, reader, shutdown)
            .await
    }
}

/// Send the error's response line, if it has one, then shut the write side down.
async fn reply_and_close<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, err: &PairlineError) {
    if let Some(line) = err.response_line() {
        if let Err(e) = write_line(writer, line).await {
            debug!("Failed to send {:?}: {}", line, e);
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::line_reader;
    use crate::session::SlotPhase;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadBuf};

    /// Sender connection that remembers how many bytes each read asked for.
    struct RecordingReader {
        inner: std::io::Cursor<Vec<u8>>,
        requested: Vec<usize>,
    }

    impl AsyncRead for RecordingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = buf.remaining();
            self.requested.push(remaining);
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn rendezvous(capacity: usize, timeout: Option<Duration>) -> Arc<Rendezvous> {
        Arc::new(Rendezvous::new(
            Arc::new(SessionTable::new(capacity)),
            RelayEngine::default(),
            timeout,
        ))
    }

    /// Spawn a receiver flow over an in-memory connection.
    ///
    /// Returns the client's end and the flow's join handle.
    fn spawn_receiver(
        rv: &Arc<Rendezvous>,
        shutdown: watch::Receiver<bool>,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<ReceiverExit>>,
    ) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(server);
        let rv = Arc::clone(rv);
        let handle = tokio::spawn(async move {
            let mut shutdown = shutdown;
            rv.run_receiver(read_half, write_half, peer(1), &mut shutdown)
                .await
        });
        (client, handle)
    }

    async fn read_reply(client: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_receiver_gets_session_id() {
        let rv = rendezvous(4, None);
        let (_tx, shutdown) = watch::channel(false);
        let (client, _handle) = spawn_receiver(&rv, shutdown);
        let mut client = BufReader::new(client);

        assert_eq!(read_reply(&mut client).await, "0");
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::ReceiverWaiting);
    }

    #[tokio::test]
    async fn test_receiver_disconnect_releases_slot() {
        let rv = rendezvous(1, None);
        let (_tx, shutdown) = watch::channel(false);
        let (client, handle) = spawn_receiver(&rv, shutdown);
        let mut client = BufReader::new(client);
        assert_eq!(read_reply(&mut client).await, "0");

        drop(client);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PairlineError::ReceiverGone { session: 0 })));
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::Empty);
        assert_eq!(rv.table().active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_timeout_replies_and_releases() {
        let rv = rendezvous(1, Some(Duration::from_secs(5)));
        let (_tx, shutdown) = watch::channel(false);
        let (client, handle) = spawn_receiver(&rv, shutdown);
        let mut client = BufReader::new(client);
        assert_eq!(read_reply(&mut client).await, "0");

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PairlineError::Timeout(_))));
        assert_eq!(read_reply(&mut client).await, "Timeout");
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::Empty);
    }

    #[tokio::test]
    async fn test_full_table_replies_server_full() {
        let rv = rendezvous(1, None);
        let (_tx, shutdown) = watch::channel(false);
        let (first, _first_handle) = spawn_receiver(&rv, shutdown.clone());
        let mut first = BufReader::new(first);
        assert_eq!(read_reply(&mut first).await, "0");

        let (second, second_handle) = spawn_receiver(&rv, shutdown);
        let mut second = BufReader::new(second);
        assert_eq!(read_reply(&mut second).await, "Server full");
        assert!(matches!(
            second_handle.await.unwrap(),
            Err(PairlineError::Capacity { capacity: 1 })
        ));
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::ReceiverWaiting);
    }

    #[tokio::test]
    async fn test_sender_relays_to_receiver() {
        let rv = rendezvous(2, None);
        let (_tx, shutdown) = watch::channel(false);
        let (receiver, receiver_handle) = spawn_receiver(&rv, shutdown.clone());
        let mut receiver = BufReader::new(receiver);
        let session = read_reply(&mut receiver).await;

        let input = format!("{}\nhello relay", session);
        let mut sender_in = BufReader::new(std::io::Cursor::new(input.into_bytes()));
        let mut sender_out = Vec::new();
        let mut shutdown = shutdown;
        let outcome = rv
            .run_sender(&mut sender_in, &mut sender_out, peer(2), &mut shutdown)
            .await
            .unwrap();

        assert_eq!(sender_out, b"READY\n");
        assert_eq!(outcome.bytes, 11);
        assert_eq!(receiver_handle.await.unwrap().unwrap(), ReceiverExit::Paired);

        let mut payload = Vec::new();
        receiver.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"hello relay");
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::Empty);
    }

    #[tokio::test]
    async fn test_sender_rejections() {
        let rv = rendezvous(3, None);
        let (_tx, mut shutdown) = watch::channel(false);

        for (input, expected) in [
            (&b"abc\n"[..], "Invalid session ID\n"),
            (&b"3\n"[..], "Invalid session ID\n"),
            (&b"-1\n"[..], "Invalid session ID\n"),
            (&b"1\n"[..], "No receiver connected\n"),
        ] {
            let mut reader = BufReader::new(input);
            let mut out = Vec::new();
            assert!(rv
                .run_sender(&mut reader, &mut out, peer(3), &mut shutdown)
                .await
                .is_err());
            assert_eq!(String::from_utf8(out).unwrap(), expected);
        }
        assert!(rv.table().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_receiver() {
        let rv = rendezvous(1, None);
        let (tx, shutdown) = watch::channel(false);
        let (client, handle) = spawn_receiver(&rv, shutdown);
        let mut client = BufReader::new(client);
        assert_eq!(read_reply(&mut client).await, "0");

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), ReceiverExit::Shutdown);
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::Empty);
    }

    #[tokio::test]
    async fn test_sender_reads_at_most_one_chunk_per_read() {
        let rv = rendezvous(1, None);
        let (_tx, shutdown) = watch::channel(false);
        let (receiver, _receiver_handle) = spawn_receiver(&rv, shutdown.clone());
        let mut receiver = BufReader::new(receiver);
        assert_eq!(read_reply(&mut receiver).await, "0");
        let collect = tokio::spawn(async move {
            let mut payload = Vec::new();
            receiver.read_to_end(&mut payload).await.unwrap();
            payload
        });

        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        let mut input = b"0\n".to_vec();
        input.extend_from_slice(&payload);
        let mut sender_in = line_reader(
            RecordingReader {
                inner: std::io::Cursor::new(input),
                requested: Vec::new(),
            },
            4096,
        );
        let mut sender_out = Vec::new();
        let mut shutdown = shutdown;
        let outcome = rv
            .run_sender(&mut sender_in, &mut sender_out, peer(2), &mut shutdown)
            .await
            .unwrap();

        assert_eq!(outcome.bytes, payload.len() as u64);
        let requested = sender_in.into_inner().requested;
        let largest = requested.iter().copied().max().unwrap();
        assert!(largest <= 4096, "read of {largest} bytes from sender");
        assert_eq!(collect.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_reset_wakes_waiting_receiver() {
        let rv = rendezvous(1, None);
        let (_tx, shutdown) = watch::channel(false);
        let (client, handle) = spawn_receiver(&rv, shutdown.clone());
        let mut client = BufReader::new(client);
        assert_eq!(read_reply(&mut client).await, "0");

        rv.table().reset(0);
        assert_eq!(handle.await.unwrap().unwrap(), ReceiverExit::Reset);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(rv.table().active_sessions(), 0);

        let (next, _next_handle) = spawn_receiver(&rv, shutdown);
        let mut next = BufReader::new(next);
        assert_eq!(read_reply(&mut next).await, "0");
    }

    #[tokio::test]
    async fn test_half_closed_receiver_loses_slot() {
        let rv = rendezvous(1, None);
        let (_tx, shutdown) = watch::channel(false);
        let (client, handle) = spawn_receiver(&rv, shutdown);
        let mut client = BufReader::new(client);
        assert_eq!(read_reply(&mut client).await, "0");

        client.get_mut().shutdown().await.unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(PairlineError::ReceiverGone { session: 0 })
        ));
        assert_eq!(rv.table().phase(0).unwrap(), SlotPhase::Empty);
    }
}
