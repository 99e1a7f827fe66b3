use std::net::SocketAddr;
use thiserror::Error;

/// Errors that end a whole send or serve operation. Per-file problems are
/// logged and reported in the transfer summary instead.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("unknown peer '{0}'")]
    PeerUnknown(String),
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("save directory unavailable: {0:#}")]
    Storage(anyhow::Error),
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}
