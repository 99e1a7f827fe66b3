//! LAN peer discovery.
//!
//! Every host periodically broadcasts its display name over UDP and listens
//! for the names of others. Received names are kept in a [`PeerRegistry`]
//! keyed by name, pointing at the address the datagram came from.

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;
pub mod registry;

pub use announce::Broadcaster;
pub use discover::Listener;
pub use model::{Announcement, Peer};
pub use registry::PeerRegistry;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Well-known UDP port announcements are sent to.
pub const DISCOVERY_PORT: u16 = 50000;

/// Default time between two announcements.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("display name is empty")]
    EmptyName,
    #[error("display name is {0} bytes, announcements are limited to 1024")]
    NameTooLong(usize),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Name announced to other hosts.
    pub name: String,
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Address announcements are sent to.
    pub broadcast_addr: SocketAddr,
    pub interval: Duration,
    pub reuse_port: bool,
}

impl DiscoveryConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            broadcast_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            interval: BROADCAST_INTERVAL,
            reuse_port: true,
        }
    }
}

/// Owns the broadcaster and listener tasks. Both stop when the handle is
/// shut down or dropped.
pub struct DiscoveryHandle {
    listen_addr: SocketAddr,
    broadcaster: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl DiscoveryHandle {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.broadcaster.abort();
        self.listener.abort();
    }
}

/// Bind both sockets and spawn the broadcaster and listener tasks.
///
/// Binding errors are returned; once running, neither task ever fails.
pub async fn start(
    cfg: &DiscoveryConfig,
    registry: PeerRegistry,
) -> Result<DiscoveryHandle, DiscoveryError> {
    let announcement = Announcement::new(cfg.name.clone())?;

    let listener = Listener::bind(cfg.listen_addr, cfg.reuse_port, registry)?;
    let listen_addr = listener
        .local_addr()
        .map_err(|source| DiscoveryError::Bind {
            addr: cfg.listen_addr,
            source,
        })?;
    let broadcaster = Broadcaster::bind(announcement, cfg.broadcast_addr, cfg.interval).await?;

    Ok(DiscoveryHandle {
        listen_addr,
        broadcaster: tokio::spawn(broadcaster.run()),
        listener: tokio::spawn(listener.run()),
    })
}
