//! Client side of the rendezvous protocol.
//!
//! Used by the `pairline-send` and `pairline-receive` binaries. A receiver
//! registers and learns its session id; a sender names that id and, once the
//! server answers `READY`, streams its payload and closes.

use crate::config::{ProtocolConfig, RelayConfig};
use crate::error::RejectReason;
use crate::protocol::{parse_session_id, read_line, Role};
use crate::{PairlineError, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Read the server's single reply line, treating a silent close as an error.
async fn read_reply(stream: &mut BufReader<TcpStream>, step: &str) -> Result<String> {
    read_line(stream)
        .await?
        .ok_or_else(|| PairlineError::protocol(format!("server closed the connection before {}", step)))
}

/// A registered receiver, waiting for its payload.
#[derive(Debug)]
pub struct ReceiverSession {
    pub session: usize,
    stream: BufReader<TcpStream>,
}

/// Connect as a receiver and obtain a session id.
pub async fn register_receiver<A: ToSocketAddrs>(addr: A) -> Result<ReceiverSession> {
    let mut stream = BufReader::new(TcpStream::connect(addr).await?);
    stream
        .get_mut()
        .write_all(format!("{}\n", Role::Receiver).as_bytes())
        .await?;

    let reply = read_reply(&mut stream, "assigning a session").await?;
    let session = parse_session_id(&reply)
        .map_err(|_| PairlineError::ServerRejected { response: reply })?;

    debug!(session, "Registered as receiver");
    Ok(ReceiverSession { session, stream })
}

impl ReceiverSession {
    /// Write everything the server relays into `path` until it closes the
    /// connection. The file is only created once the first byte arrives.
    ///
    /// Returns the number of bytes received; zero means no file was created.
    pub async fn receive_to_file(mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let mut file: Option<tokio::fs::File> = None;
        let mut buf = vec![0u8; RelayConfig::DEFAULT_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = match self.stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(session = self.session, "Connection error after {} bytes: {}", total, e);
                    break;
                }
            };

            if file.is_none() {
                let created = tokio::fs::File::create(path)
                    .await
                    .map_err(|e| PairlineError::io_with_path(e, path))?;
                debug!(session = self.session, "Transfer started, writing to {}", path.display());
                file = Some(created);
            }
            if let Some(out) = file.as_mut() {
                out.write_all(&buf[..n])
                    .await
                    .map_err(|e| PairlineError::io_with_path(e, path))?;
            }
            total += n as u64;
        }

        if let Some(mut out) = file {
            out.flush()
                .await
                .map_err(|e| PairlineError::io_with_path(e, path))?;
        }
        Ok(total)
    }

    /// Collect the relayed payload in memory.
    pub async fn receive_to_vec(mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.stream.read_to_end(&mut payload).await?;
        Ok(payload)
    }
}

/// A sender the server has paired and answered `READY`.
#[derive(Debug)]
pub struct SenderSession {
    pub session: usize,
    stream: TcpStream,
}

/// Connect as a sender for `session` and wait for `READY`.
///
/// A rejection from the server comes back as [`PairlineError::PairingRejected`].
pub async fn connect_sender<A: ToSocketAddrs>(addr: A, session: usize) -> Result<SenderSession> {
    let mut stream = BufReader::new(TcpStream::connect(addr).await?);
    stream
        .get_mut()
        .write_all(format!("{}\n{}\n", Role::Sender, session).as_bytes())
        .await?;

    let reply = read_reply(&mut stream, "READY").await?;
    let reason = match reply.as_str() {
        ProtocolConfig::READY_RESPONSE => {
            debug!(session, "Receiver is ready");
            return Ok(SenderSession {
                session,
                stream: stream.into_inner(),
            });
        }
        ProtocolConfig::INVALID_SESSION_RESPONSE => RejectReason::InvalidSessionId,
        ProtocolConfig::NO_RECEIVER_RESPONSE => RejectReason::NoReceiver,
        _ => return Err(PairlineError::ServerRejected { response: reply }),
    };
    Err(PairlineError::PairingRejected { session, reason })
}

impl SenderSession {
    /// Stream `reader` to the receiver in fixed-size chunks, then close.
    pub async fn send_reader<R: AsyncRead + Unpin>(mut self, mut reader: R) -> Result<u64> {
        let mut buf = vec![0u8; RelayConfig::DEFAULT_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.stream.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        self.stream.shutdown().await?;
        debug!(session = self.session, bytes = total, "Payload sent");
        Ok(total)
    }

    /// Stream the contents of the file at `path`, then close.
    pub async fn send_file(self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PairlineError::io_with_path(e, path))?;
        self.send_reader(file).await
    }
}
