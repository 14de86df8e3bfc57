//! Cryptographic primitives for vault operations.

pub mod cryptor;
pub mod keys;

pub use cryptor::{
    CHUNK_CIPHERTEXT_SIZE, CHUNK_OVERHEAD, CHUNK_PAYLOAD_SIZE, ContentCryptoError, Cryptor,
    FileHeader, HEADER_SIZE, NameError,
};
pub use keys::{KeyAccessError, MasterKey, MasterkeyLoader, StaticMasterkeyLoader};
