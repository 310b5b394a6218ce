//! Pairline Core - rendezvous and relay for one-shot TCP transfers.
//!
//! A receiver connects and is handed a session id. A sender connects later,
//! names that id, and everything it writes is streamed to the receiver. The
//! server never stores the payload.
//!
//! The binaries in `pairline-server` and `pairline-transfer` are thin wrappers
//! around this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use pairline_core::{client, RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> pairline_core::Result<()> {
//!     let server = RelayServer::start(ServerConfig::local()).await?;
//!
//!     let receiver = client::register_receiver(server.addr()).await?;
//!     let session = receiver.session;
//!     let received = tokio::spawn(receiver.receive_to_vec());
//!
//!     let sender = client::connect_sender(server.addr(), session).await?;
//!     sender.send_reader(&b"hello"[..]).await?;
//!
//!     assert_eq!(received.await.unwrap()?, b"hello");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod rendezvous;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use client::{connect_sender, register_receiver, ReceiverSession, SenderSession};
pub use config::{ProtocolConfig, RelayConfig, ServerConfig};
pub use error::{PairlineError, RejectReason, Result};
pub use protocol::Role;
pub use relay::{RelayEngine, RelayOutcome};
pub use rendezvous::{ReceiverExit, Rendezvous};
pub use server::{RelayServer, RelayServerHandle};
pub use session::{SessionTable, SlotPhase, SlotSnapshot};
