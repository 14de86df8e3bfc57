#![forbid(unsafe_code)]

use std::sync::RwLock;

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Error type for key access operations.
///
/// Key material is guarded by a lock; if a thread panics while holding it,
/// the key becomes inaccessible (lock poisoning) as a safety measure.
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Lock was poisoned (a thread panicked while holding it)
    #[error("key lock was poisoned")]
    LockPoisoned,

    /// The supplied key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Master key pair for vault operations.
///
/// Holds the AES encryption key and the MAC authentication key, each 256 bits,
/// for a total of 512 bits of key material.
///
/// # Security
///
/// Keys are stored in [`Zeroizing`] buffers so the material is securely wiped
/// when the key is dropped. Access goes through scoped callbacks
/// ([`with_aes_key`](Self::with_aes_key), [`with_siv_key`](Self::with_siv_key))
/// so the raw bytes never escape this module; temporary combined buffers are
/// zeroed as soon as the callback returns.
///
/// # Thread Safety
///
/// `MasterKey` is `Send + Sync` and is typically shared via `Arc<MasterKey>`.
pub struct MasterKey {
    aes_master_key: RwLock<Zeroizing<[u8; 32]>>,
    mac_master_key: RwLock<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("aes_master_key", &"[REDACTED]")
            .field("mac_master_key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    /// Generate a new random master key pair using a cryptographically secure RNG.
    pub fn random() -> Self {
        let mut aes_master_key = [0u8; 32];
        let mut mac_master_key = [0u8; 32];
        rand::rng().fill_bytes(&mut aes_master_key);
        rand::rng().fill_bytes(&mut mac_master_key);
        let key = Self::new(aes_master_key, mac_master_key);
        aes_master_key.zeroize();
        mac_master_key.zeroize();
        key
    }

    /// Create a master key pair from raw key material.
    ///
    /// The arrays are copied into zeroizing containers; the caller is
    /// responsible for wiping its own copies.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        MasterKey {
            aes_master_key: RwLock::new(Zeroizing::new(aes_key)),
            mac_master_key: RwLock::new(Zeroizing::new(mac_key)),
        }
    }

    /// Create a master key pair from a combined 64-byte buffer
    /// (AES key followed by MAC key).
    pub fn from_raw(raw: &[u8]) -> Result<Self, KeyAccessError> {
        if raw.len() != 64 {
            return Err(KeyAccessError::InvalidKeyLength {
                expected: 64,
                actual: raw.len(),
            });
        }
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        aes_key.copy_from_slice(&raw[..32]);
        mac_key.copy_from_slice(&raw[32..]);
        let key = Self::new(aes_key, mac_key);
        aes_key.zeroize();
        mac_key.zeroize();
        Ok(key)
    }

    /// Clone the key pair, propagating lock poisoning as an error.
    pub fn try_clone(&self) -> Result<Self, KeyAccessError> {
        let aes = self
            .aes_master_key
            .read()
            .map_err(|_| KeyAccessError::LockPoisoned)?;
        let mac = self
            .mac_master_key
            .read()
            .map_err(|_| KeyAccessError::LockPoisoned)?;
        Ok(Self::new(**aes, **mac))
    }

    /// Execute a function with access to the 256-bit AES key.
    ///
    /// The key material never escapes the callback.
    pub fn with_aes_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let guard = self
            .aes_master_key
            .read()
            .map_err(|_| KeyAccessError::LockPoisoned)?;
        Ok(f(&guard))
    }

    /// Execute a function with access to the 512-bit SIV key.
    ///
    /// AES-SIV expects the key layout `[MAC key || AES key]`; the combined
    /// buffer is assembled on the stack and zeroed when the callback returns.
    pub fn with_siv_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 64]) -> R,
    {
        struct ZeroOnDrop([u8; 64]);
        impl Drop for ZeroOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroOnDrop([0u8; 64]);
        {
            let mac = self
                .mac_master_key
                .read()
                .map_err(|_| KeyAccessError::LockPoisoned)?;
            key.0[..32].copy_from_slice(&**mac);
        }
        {
            let aes = self
                .aes_master_key
                .read()
                .map_err(|_| KeyAccessError::LockPoisoned)?;
            key.0[32..].copy_from_slice(&**aes);
        }
        Ok(f(&key.0))
    }
}

/// Capability supplying the vault's master key.
///
/// Password handling, key derivation, and masterkey-file parsing live behind
/// this trait; the filesystem core only ever sees the resulting [`MasterKey`].
pub trait MasterkeyLoader: Send + Sync {
    fn load_masterkey(&self) -> Result<MasterKey, KeyAccessError>;
}

/// A loader that hands out copies of a key held in memory.
///
/// Intended for tests and for callers that already performed the unlock
/// elsewhere.
pub struct StaticMasterkeyLoader {
    key: MasterKey,
}

impl StaticMasterkeyLoader {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }
}

impl MasterkeyLoader for StaticMasterkeyLoader {
    fn load_masterkey(&self) -> Result<MasterKey, KeyAccessError> {
        self.key.try_clone()
    }
}
