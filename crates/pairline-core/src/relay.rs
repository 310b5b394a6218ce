//! Relay engine: copies the sender's bytes into the receiver's connection.
//!
//! The engine reads one bounded chunk at a time and writes it out before
//! reading the next, so nothing beyond the current chunk is buffered and
//! byte order is preserved. EOF from the sender is the normal end of a
//! transfer. Either way the session is torn down afterwards: the receiver's
//! write side is shut down and the slot goes back to the table.
//!
//! The engine never closes the sender's connection; its worker owns that.

use crate::config::RelayConfig;
use crate::session::{Pairing, SessionTable};
use crate::{PairlineError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Summary of a completed relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub session: usize,
    pub bytes: u64,
    pub chunks: u64,
}

/// Copies payload from sender to receiver for paired sessions.
#[derive(Debug, Clone, Copy)]
pub struct RelayEngine {
    chunk_size: usize,
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(RelayConfig::DEFAULT_CHUNK_SIZE)
    }
}

impl RelayEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Relay until the sender reaches EOF, an I/O error occurs, or `shutdown`
    /// flips to true. Always tears the session down before returning.
    pub async fn run<R>(
        &self,
        table: &SessionTable,
        pairing: Pairing,
        sender: &mut R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RelayOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let session = pairing.session;
        if !pairing.slot.start_relay(pairing.generation) {
            // Reset out from under us between pairing and now.
            self.teardown(table, pairing).await;
            return Err(PairlineError::Relay {
                session,
                relayed: 0,
                message: "session was reset before relay started".to_string(),
                source: None,
            });
        }

        info!(session, sender = %pairing.sender, "Starting relay");
        let result = self.copy_chunks(&pairing, sender, shutdown).await;
        self.teardown(table, pairing).await;

        match &result {
            Ok(outcome) => info!(
                session,
                bytes = outcome.bytes,
                chunks = outcome.chunks,
                "Relay complete"
            ),
            Err(e) => warn!(session, "Relay aborted: {}", e),
        }
        result
    }

    async fn copy_chunks<R>(
        &self,
        pairing: &Pairing,
        sender: &mut R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RelayOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let session = pairing.session;
        let mut receiver = pairing.receiver.lock().await;
        let mut buf = vec![0u8; self.chunk_size];
        let mut outcome = RelayOutcome {
            session,
            bytes: 0,
            chunks: 0,
        };

        loop {
            let n = tokio::select! {
                read = sender.read(&mut buf) => read.map_err(|e| {
                    PairlineError::relay(session, outcome.bytes, "read from sender", e)
                })?,
                _ = shutdown.changed() => {
                    return Err(PairlineError::Relay {
                        session,
                        relayed: outcome.bytes,
                        message: "server shutting down".to_string(),
                        source: None,
                    });
                }
            };

            if n == 0 {
                debug!(session, bytes = outcome.bytes, "Sender finished sending data");
                break;
            }

            receiver
                .write_all(&buf[..n])
                .await
                .map_err(|e| PairlineError::relay(session, outcome.bytes, "write to receiver", e))?;
            outcome.bytes += n as u64;
            outcome.chunks += 1;
            trace!(session, bytes = n, "Relayed chunk to receiver");
        }

        receiver
            .flush()
            .await
            .map_err(|e| PairlineError::relay(session, outcome.bytes, "flush to receiver", e))?;
        Ok(outcome)
    }

    /// Close the receiver's connection and return the slot to the table.
    pub(crate) async fn teardown(&self, table: &SessionTable, pairing: Pairing) {
        {
            let mut receiver = pairing.receiver.lock().await;
            if let Err(e) = receiver.shutdown().await {
                debug!(session = pairing.session, "Receiver shutdown failed: {}", e);
            }
        }
        table.release(pairing.session, pairing.generation);
    }
}
