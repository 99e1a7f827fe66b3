use crate::model::{Announcement, MAX_ANNOUNCEMENT_LEN};
use crate::registry::PeerRegistry;
use crate::{net, DiscoveryError};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Receives announcements and records their source address in the registry.
pub struct Listener {
    socket: UdpSocket,
    registry: PeerRegistry,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        reuse_port: bool,
        registry: PeerRegistry,
    ) -> Result<Self, DiscoveryError> {
        let socket =
            net::bind_udp(addr, reuse_port).map_err(|source| DiscoveryError::Bind { addr, source })?;
        Ok(Self { socket, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Listen forever. Receive errors are logged and do not stop the loop.
    pub async fn run(self) {
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!("Listening for announcements on {}", addr);
        }

        let mut buf = vec![0u8; MAX_ANNOUNCEMENT_LEN];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Discovery receive error: {}", e);
                    continue;
                }
            };

            match Announcement::decode(&buf[..n]) {
                Some(ann) => {
                    tracing::debug!("Announcement '{}' from {}", ann.name(), src);
                    self.registry.upsert(ann.name(), src.ip());
                }
                None => tracing::debug!("Ignoring empty announcement from {}", src),
            }
        }
    }
}
