//! Centralized configuration for pairline.
//!
//! Wire constants live in [`ProtocolConfig`], defaults in [`RelayConfig`].
//! [`ServerConfig`] is the runtime configuration of one server process and can
//! be loaded from a JSON file.

use crate::{PairlineError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Line protocol spoken on the listener.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const RECEIVER_ROLE: &'static str = "RECEIVER";
    pub const SENDER_ROLE: &'static str = "SENDER";

    pub const READY_RESPONSE: &'static str = "READY";
    pub const SERVER_FULL_RESPONSE: &'static str = "Server full";
    pub const INVALID_SESSION_RESPONSE: &'static str = "Invalid session ID";
    pub const NO_RECEIVER_RESPONSE: &'static str = "No receiver connected";
    pub const TIMEOUT_RESPONSE: &'static str = "Timeout";

    /// Longest control line accepted before the connection is dropped.
    pub const MAX_LINE_LENGTH: usize = 64;
}

/// Defaults shared by the server and the transfer CLIs.
pub struct RelayConfig;

impl RelayConfig {
    pub const DEFAULT_HOST: &'static str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_MAX_SESSIONS: usize = 100;
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;
    pub const DEFAULT_RECEIVED_FILE: &'static str = "received_file";
}

/// Runtime configuration for a relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on concurrently registered receivers.
    pub max_sessions: usize,
    /// Read size used by the relay engine.
    pub chunk_size: usize,
    /// How long a receiver may wait for a sender. `None` waits indefinitely.
    pub pairing_timeout_secs: Option<u64>,
    /// How long a fresh connection may take to send its control lines.
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: RelayConfig::DEFAULT_HOST.to_string(),
            port: RelayConfig::DEFAULT_PORT,
            max_sessions: RelayConfig::DEFAULT_MAX_SESSIONS,
            chunk_size: RelayConfig::DEFAULT_CHUNK_SIZE,
            pairing_timeout_secs: None,
            handshake_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Default configuration bound to an OS-assigned port on loopback.
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| PairlineError::io_with_path(e, path))?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(PairlineError::Config {
                field: "max_sessions".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(PairlineError::Config {
                field: "chunk_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("pairing_timeout_secs", self.pairing_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(PairlineError::Config {
                    field: field.to_string(),
                    message: "must be greater than zero when set".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| PairlineError::Config {
                field: "host".to_string(),
                message: format!("invalid bind address {}:{}: {}", self.host, self.port, e),
            })
    }

    pub fn pairing_timeout(&self) -> Option<Duration> {
        self.pairing_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_wire_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.chunk_size, 4096);
        assert!(config.pairing_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9000, "pairing_timeout_secs": 30}}"#).unwrap();

        let config = ServerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_sessions, RelayConfig::DEFAULT_MAX_SESSIONS);
        assert_eq!(config.pairing_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ServerConfig {
            max_sessions: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PairlineError::Config { ref field, .. }) if field == "max_sessions"
        ));

        let config = ServerConfig {
            handshake_timeout_secs: Some(0),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = ServerConfig::from_json_file("/nonexistent/pairline.json").unwrap_err();
        match err {
            PairlineError::Io { path, .. } => {
                assert_eq!(path, Some("/nonexistent/pairline.json".into()))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bind_addr() {
        let addr = ServerConfig::local().bind_addr().unwrap();
        assert_eq!(addr.port(), 0);
        assert!(addr.ip().is_loopback());

        let bad = ServerConfig {
            host: "not a host".to_string(),
            ..ServerConfig::default()
        };
        assert!(bad.bind_addr().is_err());
    }
}
