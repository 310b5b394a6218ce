//! Send a file to a receiver waiting on a pairline relay.
//!
//! Usage: `pairline-send <server> <session_id> <file>`

use anyhow::{Context, Result};
use clap::Parser;
use pairline_core::client;
use pairline_transfer::CommonArgs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "pairline-send")]
#[command(about = "Stream a file to the receiver registered under a session id")]
struct Args {
    /// Relay server host or IP address
    server: String,

    /// Session id printed by the receiver
    session_id: usize,

    /// File to send
    file: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.common.init_logging();

    let addr = args.common.server_addr(&args.server);
    debug!("Connecting to relay at {}", addr);

    // Fail on a missing file before taking the receiver's slot.
    tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("Cannot read {}", args.file.display()))?;

    let session = client::connect_sender(addr.as_str(), args.session_id)
        .await
        .with_context(|| format!("Could not pair with session {}", args.session_id))?;
    println!("Receiver ready, sending {}", args.file.display());

    let total = session
        .send_file(&args.file)
        .await
        .context("Transfer failed")?;
    println!("File sent successfully ({} bytes)", total);

    Ok(())
}
