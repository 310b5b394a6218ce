//! Line protocol shared by the server and the transfer clients.
//!
//! Control messages are ASCII lines terminated by `\n`. After the handshake the
//! sender's connection carries the raw payload, unframed.
//!
//! ```text
//! receiver: RECEIVER\n            -> <session id>\n | Server full\n
//! sender:   SENDER\n<session>\n   -> READY\n | Invalid session ID\n | No receiver connected\n
//! ```

use crate::config::ProtocolConfig;
use crate::error::RejectReason;
use crate::{PairlineError, Result};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Role announced on the first line of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Sender,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Receiver => ProtocolConfig::RECEIVER_ROLE,
            Role::Sender => ProtocolConfig::SENDER_ROLE,
        }
    }
}

impl FromStr for Role {
    type Err = PairlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ProtocolConfig::RECEIVER_ROLE => Ok(Role::Receiver),
            ProtocolConfig::SENDER_ROLE => Ok(Role::Sender),
            other => Err(PairlineError::protocol(format!(
                "unknown client type: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrap a fresh connection for reading its control lines.
///
/// The same reader later feeds the relay, so its buffer is capped at
/// `chunk_size`: no single read from the socket asks for more than one chunk.
pub fn line_reader<R: AsyncRead>(inner: R, chunk_size: usize) -> BufReader<R> {
    let capacity = (2 * ProtocolConfig::MAX_LINE_LENGTH).min(chunk_size).max(1);
    BufReader::with_capacity(capacity, inner)
}

/// Read one control line, without its terminator.
///
/// Returns `None` on a clean EOF before any byte. A line longer than
/// [`ProtocolConfig::MAX_LINE_LENGTH`], a line cut short by EOF, or non-UTF-8
/// content is a protocol error. A trailing `\r` is tolerated.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(16);
    let limit = ProtocolConfig::MAX_LINE_LENGTH as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(PairlineError::protocol(if n as u64 >= limit {
            format!(
                "control line exceeds {} bytes",
                ProtocolConfig::MAX_LINE_LENGTH
            )
        } else {
            "connection closed mid-line".to_string()
        }));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| PairlineError::protocol("control line is not valid UTF-8"))
}

/// Read the role line of a freshly accepted connection.
pub async fn read_role<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Role> {
    match read_line(reader).await? {
        Some(line) => line.parse(),
        None => Err(PairlineError::protocol(
            "connection closed before client type",
        )),
    }
}

/// Parse a decimal session id. Negative or non-numeric input is rejected.
pub fn parse_session_id(line: &str) -> Result<usize> {
    line.parse::<usize>().map_err(|_| PairlineError::Protocol {
        message: format!("invalid session id: {:?}", line),
        reply: Some(RejectReason::InvalidSessionId),
    })
}

/// Read the sender's session id line.
pub async fn read_session_id<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<usize> {
    match read_line(reader).await? {
        Some(line) => parse_session_id(&line),
        None => Err(PairlineError::protocol(
            "connection closed before session id",
        )),
    }
}

/// Await a handshake step, failing with a protocol error if `limit` elapses first.
pub async fn within<T, F>(limit: Option<Duration>, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PairlineError::protocol(format!("no {} within {:?}", step, limit)))?,
        None => fut.await,
    }
}

/// Write a single `\n`-terminated line and flush it.
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, line: &str) -> Result<()> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
