//! Register with a pairline relay and save whatever the paired sender streams.
//!
//! Usage: `pairline-receive [server] [--output received_file]`

use anyhow::{Context, Result};
use clap::Parser;
use pairline_core::{client, RelayConfig};
use pairline_transfer::CommonArgs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "pairline-receive")]
#[command(about = "Obtain a session id and write the relayed payload to a file")]
struct Args {
    /// Relay server host or IP address
    #[arg(default_value = "127.0.0.1")]
    server: String,

    /// Where to write the received payload
    #[arg(short, long, default_value = RelayConfig::DEFAULT_RECEIVED_FILE)]
    output: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.common.init_logging();

    let addr = args.common.server_addr(&args.server);
    debug!("Connecting to relay at {}", addr);

    let session = client::register_receiver(addr.as_str())
        .await
        .context("Could not register with the relay")?;
    println!("Session ID: {}", session.session);
    println!("Waiting for sender...");

    let total = session
        .receive_to_file(&args.output)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    if total == 0 {
        println!("No data received");
    } else {
        println!(
            "File received successfully ({} bytes) and saved to {}",
            total,
            args.output.display()
        );
    }
    Ok(())
}
