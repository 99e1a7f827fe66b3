use crate::keys::{TransferKey, DEFAULT_PASSPHRASE};
use crate::protocol::{CHUNK_SIZE, TRANSFER_PORT};
use anyhow::{Context, Result};
use discovery::{DiscoveryConfig, DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QShareConfig {
    /// Name announced to the other hosts on the network
    pub device_name: String,

    /// Where received files are written
    pub save_dir: PathBuf,

    /// UDP port for announcements
    pub discovery_port: u16,

    /// TCP port for transfers
    pub transfer_port: u16,

    /// Seconds between two announcements
    pub broadcast_interval_secs: u64,

    /// Passphrase the transfer key is derived from; must match on both ends
    pub passphrase: String,

    /// Payload chunk size in bytes
    pub chunk_size: usize,

    /// Share the discovery port with other processes on this host
    pub reuse_port: bool,
}

impl Default for QShareConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            save_dir: default_save_dir(),
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            broadcast_interval_secs: 2,
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            chunk_size: CHUNK_SIZE,
            reuse_port: true,
        }
    }
}

impl QShareConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    pub fn key(&self) -> TransferKey {
        TransferKey::for_passphrase(&self.passphrase)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.transfer_port))
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        let mut cfg = DiscoveryConfig::new(self.device_name.clone(), self.discovery_port);
        cfg.interval = self.broadcast_interval();
        cfg.reuse_port = self.reuse_port;
        cfg
    }
}

/// `~/Downloads/QShare`, or `./QShare` without a home directory.
pub fn default_save_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("QShare")
}

/// The OS hostname, or `qshare` when it cannot be read.
fn default_device_name() -> String {
    os_hostname().unwrap_or_else(|| "qshare".to_string())
}

fn os_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_use_well_known_ports() {
        let cfg = QShareConfig::default();
        assert_eq!(cfg.discovery_port, 50000);
        assert_eq!(cfg.transfer_port, 50001);
        assert_eq!(cfg.key(), *TransferKey::shared());
        assert!(cfg.save_dir.ends_with("QShare"));
    }

    #[test]
    fn default_name_is_the_os_hostname() {
        let cfg = QShareConfig::default();
        match os_hostname() {
            Some(host) => assert_eq!(cfg.device_name, host),
            None => assert_eq!(cfg.device_name, "qshare"),
        }
    }

    #[test]
    fn partial_file_fills_in_defaults() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{ "device_name": "laptop", "transfer_port": 6000 }"#)?;

        let cfg = QShareConfig::load_or_default(&path)?;
        assert_eq!(cfg.device_name, "laptop");
        assert_eq!(cfg.transfer_port, 6000);
        assert_eq!(cfg.discovery_port, DISCOVERY_PORT);
        Ok(())
    }

    #[test]
    fn save_then_load() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("nested").join("config.json");
        let mut cfg = QShareConfig::default();
        cfg.passphrase = "other".to_string();
        cfg.save(&path)?;

        let loaded = QShareConfig::load(&path)?;
        assert_eq!(loaded, cfg);
        assert_ne!(loaded.key(), *TransferKey::shared());
        Ok(())
    }

    #[test]
    fn discovery_settings_follow_config() {
        let mut cfg = QShareConfig::default();
        cfg.device_name = "desk".to_string();
        cfg.discovery_port = 41000;
        cfg.broadcast_interval_secs = 5;

        let d = cfg.discovery();
        assert_eq!(d.name, "desk");
        assert_eq!(d.listen_addr.port(), 41000);
        assert_eq!(d.broadcast_addr.port(), 41000);
        assert_eq!(d.interval, Duration::from_secs(5));
    }
}
