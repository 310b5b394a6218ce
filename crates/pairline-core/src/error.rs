//! Error types for the relay.
//!
//! Every error here is local to one connection or one session. The accept loop
//! logs them and keeps running.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ProtocolConfig;

/// Why a sender was refused a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The session id is not a number or is outside the table's range.
    InvalidSessionId,
    /// The slot exists but no receiver is waiting in it.
    NoReceiver,
}

impl RejectReason {
    pub fn response_line(&self) -> &'static str {
        match self {
            RejectReason::InvalidSessionId => ProtocolConfig::INVALID_SESSION_RESPONSE,
            RejectReason::NoReceiver => ProtocolConfig::NO_RECEIVER_RESPONSE,
        }
    }
}

/// Main error type for pairline.
#[derive(Debug, Error)]
pub enum PairlineError {
    /// Malformed or unknown role line, or a non-numeric session id.
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        /// Line to send back to the peer, when the protocol step allows one.
        reply: Option<RejectReason>,
    },

    #[error("Server full: all {capacity} sessions are in use")]
    Capacity { capacity: usize },

    #[error("Pairing rejected for session {session}: {}", .reason.response_line())]
    PairingRejected { session: usize, reason: RejectReason },

    /// I/O failure in the middle of a transfer.
    #[error("Relay failed for session {session} after {relayed} bytes: {message}")]
    Relay {
        session: usize,
        relayed: u64,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The waiting receiver closed its connection before a sender arrived.
    #[error("Receiver for session {session} disconnected before pairing")]
    ReceiverGone { session: usize },

    /// A reply from the server that the client cannot proceed with.
    #[error("Server rejected the request: {response}")]
    ServerRejected { response: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error for {field}: {message}")]
    Config { field: String, message: String },
}

/// Result type alias for pairline operations.
pub type Result<T> = std::result::Result<T, PairlineError>;

impl From<std::io::Error> for PairlineError {
    fn from(err: std::io::Error) -> Self {
        PairlineError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PairlineError {
    fn from(err: serde_json::Error) -> Self {
        PairlineError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PairlineError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PairlineError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        PairlineError::Protocol {
            message: message.into(),
            reply: None,
        }
    }

    pub(crate) fn relay(session: usize, relayed: u64, message: &str, err: std::io::Error) -> Self {
        PairlineError::Relay {
            session,
            relayed,
            message: format!("{}: {}", message, err),
            source: Some(err),
        }
    }

    /// The single line the server sends to the peer before closing, if any.
    ///
    /// Relay failures and unknown role lines get no reply: the first happens
    /// mid-stream, the second has no protocol step to answer on.
    pub fn response_line(&self) -> Option<&'static str> {
        match self {
            PairlineError::Protocol { reply, .. } => reply.map(|r| r.response_line()),
            PairlineError::Capacity { .. } => Some(ProtocolConfig::SERVER_FULL_RESPONSE),
            PairlineError::PairingRejected { reason, .. } => Some(reason.response_line()),
            PairlineError::Timeout(_) => Some(ProtocolConfig::TIMEOUT_RESPONSE),
            _ => None,
        }
    }
}
