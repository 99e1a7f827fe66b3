//! Front-end facing entry point tying discovery, sending and receiving
//! together.

use crate::config::QShareConfig;
use crate::error::TransferError;
use crate::receiver::{self, CancelHandle, CancellationSignal, Receiver};
use crate::sender::{Sender, TransferSummary};
use discovery::{DiscoveryConfig, DiscoveryHandle, Peer, PeerRegistry};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use storage::LocalStorage;
use tokio::task::JoinHandle;

/// How often `wait_for_peer` re-checks the registry.
const PEER_POLL: Duration = Duration::from_millis(100);

pub struct Node {
    config: QShareConfig,
    registry: PeerRegistry,
    sender: Sender,
    discovery: Option<DiscoveryHandle>,
}

impl Node {
    /// A node without discovery tasks. Its registry stays empty, so only
    /// `serve` is useful on it.
    pub fn new(config: QShareConfig) -> Self {
        let registry = PeerRegistry::new();
        let sender = Sender::new(registry.clone(), config.key(), config.transfer_port)
            .with_chunk_size(config.chunk_size);
        Self {
            config,
            registry,
            sender,
            discovery: None,
        }
    }

    /// Start announcing and listening with the settings from `config`.
    pub async fn start(config: QShareConfig) -> Result<Self, TransferError> {
        let discovery = config.discovery();
        Self::start_with(config, &discovery).await
    }

    pub async fn start_with(
        config: QShareConfig,
        discovery: &DiscoveryConfig,
    ) -> Result<Self, TransferError> {
        let mut node = Self::new(config);
        let handle = discovery::start(discovery, node.registry.clone()).await?;
        tracing::info!(
            "Discovery running as '{}' on {}",
            discovery.name,
            handle.listen_addr()
        );
        node.discovery = Some(handle);
        Ok(node)
    }

    pub fn config(&self) -> &QShareConfig {
        &self.config
    }

    /// Peers heard from so far, ordered by name.
    pub fn discover(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    /// Poll the registry until `name` shows up or `timeout` passes.
    pub async fn wait_for_peer(&self, name: &str, timeout: Duration) -> Option<IpAddr> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(addr) = self.registry.get(name) {
                return Some(addr);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(PEER_POLL).await;
        }
    }

    pub async fn send<P: AsRef<Path>>(
        &self,
        paths: &[P],
        target: &str,
    ) -> Result<TransferSummary, TransferError> {
        self.sender.send(paths, target).await
    }

    /// Receive into `save_dir` until `cancellation` resolves.
    pub async fn serve(
        &self,
        save_dir: &Path,
        cancellation: CancellationSignal,
    ) -> Result<(), TransferError> {
        self.bind_receiver(save_dir).await?.serve(cancellation).await
    }

    /// Bind now and serve on a background task. Bind errors are returned
    /// here rather than from the task.
    pub async fn spawn_serve(&self, save_dir: &Path) -> Result<ServeHandle, TransferError> {
        let receiver = self.bind_receiver(save_dir).await?;
        let local_addr = receiver.local_addr()?;
        let (cancel, signal) = receiver::cancellation();
        let task = tokio::spawn(receiver.serve(signal));
        Ok(ServeHandle {
            local_addr,
            cancel,
            task,
        })
    }

    async fn bind_receiver(&self, save_dir: &Path) -> Result<Receiver<LocalStorage>, TransferError> {
        let storage = LocalStorage::new(save_dir.to_path_buf()).map_err(TransferError::Storage)?;
        tracing::info!("Files will be saved in {}", storage.save_dir().display());
        Receiver::bind(self.config.transfer_addr(), storage, self.config.key()).await
    }

    /// Stop the discovery tasks.
    pub fn shutdown(mut self) {
        if let Some(handle) = self.discovery.take() {
            handle.shutdown();
        }
    }
}

/// A `serve` running in the background.
pub struct ServeHandle {
    local_addr: SocketAddr,
    cancel: CancelHandle,
    task: JoinHandle<Result<(), TransferError>>,
}

impl ServeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, wait for open connections to finish, and return the
    /// serve result.
    pub async fn cancel_serve(self) -> Result<(), TransferError> {
        self.cancel.cancel();
        self.task.await.map_err(std::io::Error::other)?
    }
}
