//! QShare Core - LAN file transfer engine
//!
//! Hosts find each other through UDP announcements (see the `discovery`
//! crate) and push files over a single TCP connection per batch: a
//! plaintext metadata line per file, followed by its AES-256-CTR encrypted
//! payload.

pub mod cipher;
pub mod config;
pub mod error;
pub mod keys;
pub mod node;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

// Re-export commonly used types
pub use config::QShareConfig;
pub use discovery::{Peer, PeerRegistry};
pub use error::TransferError;
pub use keys::TransferKey;
pub use node::{Node, ServeHandle};
pub use receiver::{cancellation, CancelHandle, CancellationSignal, Receiver};
pub use sender::{FileOutcome, Sender, SkipReason, TransferSummary};
