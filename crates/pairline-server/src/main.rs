//! Pairline relay server.
//!
//! Listens for receivers and senders, pairs them by session id and relays each
//! sender's payload to its receiver. Runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use pairline_core::{RelayServer, ServerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "pairline-server")]
#[command(about = "Rendezvous relay that streams a sender's bytes to a waiting receiver")]
struct Args {
    /// Port to listen on [default: 8080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to [default: 0.0.0.0]
    #[arg(long)]
    host: Option<String>,

    /// Maximum number of concurrently registered receivers [default: 100]
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Relay read size in bytes [default: 4096]
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Seconds a receiver may wait for its sender before the slot is released
    #[arg(long)]
    pairing_timeout: Option<u64>,

    /// Seconds a new connection may take to send its control lines
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// JSON configuration file; command-line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if self.pairing_timeout.is_some() {
            config.pairing_timeout_secs = self.pairing_timeout;
        }
        if self.handshake_timeout.is_some() {
            config.handshake_timeout_secs = self.handshake_timeout;
        }

        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json);

    let config = args.server_config()?;
    info!("Starting pairline relay server");

    let mut handle = RelayServer::start(config)
        .await
        .context("Failed to start relay server")?;

    tokio::signal::ctrl_c().await?;
    info!(
        active_sessions = handle.table().active_sessions(),
        "Shutdown signal received, stopping"
    );
    handle.shutdown();
    handle.join().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pairline-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).server_config().unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_sessions, 100);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9000, "max_sessions": 5, "pairing_timeout_secs": 30}}"#).unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["--config", path, "--port", "9100"])
            .server_config()
            .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.pairing_timeout_secs, Some(30));
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        assert!(parse(&["--max-sessions", "0"]).server_config().is_err());
        assert!(parse(&["--pairing-timeout", "0"]).server_config().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = parse(&["--config", "/nonexistent/pairline.json"])
            .server_config()
            .unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}
