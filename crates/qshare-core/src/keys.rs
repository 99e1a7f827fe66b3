use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Passphrase every peer derives the transfer key from.
pub const DEFAULT_PASSPHRASE: &str = "qshare";

pub const KEY_LEN: usize = 32;

static DEFAULT_KEY: LazyLock<TransferKey> =
    LazyLock::new(|| TransferKey::derive(DEFAULT_PASSPHRASE));

/// 32-byte AES-256 key shared by both ends of a transfer.
///
/// NOTE: every peer using the same passphrase ends up with the same key and
/// the same keystream; this is obfuscation, not authenticated encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransferKey([u8; KEY_LEN]);

impl TransferKey {
    /// SHA-256 of the passphrase bytes.
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Key for [`DEFAULT_PASSPHRASE`], computed once per process.
    pub fn shared() -> &'static TransferKey {
        &DEFAULT_KEY
    }

    /// Key for `passphrase`, reusing the process-wide key for the default.
    pub fn for_passphrase(passphrase: &str) -> TransferKey {
        if passphrase == DEFAULT_PASSPHRASE {
            Self::shared().clone()
        } else {
            Self::derive(passphrase)
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short fingerprint for logs (first 8 hex chars).
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransferKey").field(&self.fingerprint()).finish()
    }
}

impl PartialEq for TransferKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TransferKey {}
