use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::DiscoveryError;

/// Largest announcement payload a listener will accept.
pub const MAX_ANNOUNCEMENT_LEN: usize = 1024;

/// The payload of one discovery datagram: the display name of the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    name: String,
}

impl Announcement {
    pub fn new(name: impl Into<String>) -> Result<Self, DiscoveryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DiscoveryError::EmptyName);
        }
        if name.len() > MAX_ANNOUNCEMENT_LEN {
            return Err(DiscoveryError::NameTooLong(name.len()));
        }
        Ok(Self { name })
    }

    /// Decode a received datagram. Invalid UTF-8 is replaced rather than
    /// rejected; surrounding whitespace is dropped. Returns `None` when
    /// nothing is left.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let name = String::from_utf8_lossy(payload).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(Self { name })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.name.as_bytes()
    }
}

/// One entry of a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub addr: IpAddr,
}
