//! Shared name -> address table filled in by the discovery listener.
//!
//! Entries never expire: a name keeps pointing at the last address it was
//! announced from until a newer announcement overwrites it.

use crate::model::Peer;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Clonable handle to the peer table. All clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeMap<String, IpAddr>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the address for `name`. Returns the previous
    /// address if the peer was already known.
    pub fn upsert(&self, name: impl Into<String>, addr: IpAddr) -> Option<IpAddr> {
        let name = name.into();
        let previous = self.peers.write().insert(name.clone(), addr);
        match previous {
            None => tracing::info!("Discovered peer {} at {}", name, addr),
            Some(old) if old != addr => {
                tracing::info!("Peer {} moved from {} to {}", name, old, addr)
            }
            Some(_) => {}
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<IpAddr> {
        self.peers.read().get(name).copied()
    }

    /// Copy of the table, ordered by name.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .iter()
            .map(|(name, addr)| Peer {
                name: name.clone(),
                addr: *addr,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
