//! Shared plumbing for the `pairline-send` and `pairline-receive` binaries.
//!
//! Progress for the operator goes to stdout; diagnostics go through `tracing`
//! to stderr.

use clap::Args;
use pairline_core::RelayConfig;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Options every transfer CLI accepts.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Relay server port
    #[arg(short, long, default_value_t = RelayConfig::DEFAULT_PORT)]
    pub port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl CommonArgs {
    /// `host:port` for the relay server.
    pub fn server_addr(&self, host: &str) -> String {
        format!("{}:{}", host, self.port)
    }

    pub fn init_logging(&self) {
        let default_level = if self.debug { "debug" } else { "warn" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false);
        if self.json {
            builder.json().init();
        } else {
            builder.compact().init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_default_port() {
        let cli = Cli::try_parse_from(["pairline-send"]).unwrap();
        assert_eq!(cli.common.port, 8080);
        assert_eq!(cli.common.server_addr("10.0.0.2"), "10.0.0.2:8080");
    }

    #[test]
    fn test_port_override() {
        let cli = Cli::try_parse_from(["pairline-send", "--port", "9001"]).unwrap();
        assert_eq!(cli.common.server_addr("localhost"), "localhost:9001");
    }
}
