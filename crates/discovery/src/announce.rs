use crate::model::Announcement;
use crate::{net, DiscoveryError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Periodically sends this host's display name to the discovery address.
pub struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    announcement: Announcement,
    interval: Duration,
}

impl Broadcaster {
    pub async fn bind(
        announcement: Announcement,
        target: SocketAddr,
        interval: Duration,
    ) -> Result<Self, DiscoveryError> {
        let socket = net::bind_broadcast(target)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: target,
                source,
            })?;

        Ok(Self {
            socket,
            target,
            announcement,
            interval,
        })
    }

    pub async fn announce_once(&self) -> std::io::Result<()> {
        self.socket
            .send_to(self.announcement.as_bytes(), self.target)
            .await?;
        Ok(())
    }

    /// Announce forever. A failed send is logged and retried on the next tick.
    pub async fn run(self) {
        tracing::info!(
            "Announcing '{}' to {} every {:?}",
            self.announcement.name(),
            self.target,
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.announce_once().await {
                Ok(()) => tracing::trace!("Announcement sent to {}", self.target),
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", self.target, e),
            }
        }
    }
}
