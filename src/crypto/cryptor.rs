//! Cryptographic facade for the vault core.
//!
//! The [`Cryptor`] bundles every primitive the filesystem needs: file header
//! encryption, chunk AEAD, deterministic filename encryption, and directory
//! ID hashing. Everything above this module works in terms of cleartext
//! bytes and names; everything below is AES-GCM / AES-SIV plumbing.
//!
//! # Ciphertext file layout
//!
//! ```text
//! header (68 B) || chunk_0 (≤ 32796 B) || chunk_1 || …
//! ```
//!
//! The header is `12 B nonce || 40 B ciphertext || 16 B tag`, where the
//! payload is 8 reserved bytes (0xFF) followed by the 32-byte content key.
//! Each chunk is `12 B nonce || ≤ 32768 B ciphertext || 16 B tag`, with
//! `chunk number (8 B BE) || header nonce (12 B)` as associated data, so
//! chunks cannot be reordered or transplanted between files.

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use aes_siv::siv::Aes256Siv;
use base64::{Engine as _, engine::general_purpose};
use data_encoding::BASE32;
use rand::RngCore;
use ring::digest;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use super::keys::{KeyAccessError, MasterKey};

/// Size of the encrypted file header in bytes.
pub const HEADER_SIZE: usize = 68;

/// Size of the header nonce in bytes.
pub const HEADER_NONCE_SIZE: usize = 12;

/// Cleartext payload of one chunk (32 KiB).
pub const CHUNK_PAYLOAD_SIZE: usize = 32 * 1024;

/// Per-chunk overhead: 12-byte nonce + 16-byte GCM tag.
pub const CHUNK_OVERHEAD: usize = 28;

/// Ciphertext size of one full chunk.
pub const CHUNK_CIPHERTEXT_SIZE: usize = CHUNK_PAYLOAD_SIZE + CHUNK_OVERHEAD;

/// Errors from file header and chunk cryptography.
///
/// Authentication failures indicate **integrity violations**: the ciphertext
/// was tampered with, truncated, or encrypted under a different key. They
/// are never silently recovered.
#[derive(Error, Debug)]
pub enum ContentCryptoError {
    /// Header authentication failed.
    #[error("file header authentication failed - possible tampering or wrong key")]
    HeaderAuthFailed,

    /// Chunk authentication failed.
    #[error("chunk {chunk} authentication failed - possible tampering or wrong key")]
    ChunkAuthFailed { chunk: u64 },

    /// The header bytes have the wrong shape.
    #[error("invalid file header: {reason}")]
    InvalidHeader { reason: String },

    /// A ciphertext chunk is shorter than nonce + tag.
    #[error("incomplete chunk {chunk}: expected at least {CHUNK_OVERHEAD} bytes, got {actual}")]
    IncompleteChunk { chunk: u64, actual: usize },

    /// Encryption failed unexpectedly (programming error).
    #[error("encryption failure: {reason}")]
    EncryptionFailed { reason: String },

    /// Key access failed.
    #[error("key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Errors from filename encryption and decryption.
#[derive(Error, Debug)]
pub enum NameError {
    /// AES-SIV authentication failed - the name was tampered with, belongs to
    /// a different directory, or was encrypted under a different key.
    #[error(
        "filename authentication failed - possible tampering, wrong key, or a name moved between directories"
    )]
    DecryptionFailed,

    /// The encrypted name is not valid base64url.
    #[error("invalid base64 in encrypted name: {reason}")]
    Base64Decode { reason: String },

    /// The decrypted bytes are not valid UTF-8.
    #[error("decrypted name is not valid UTF-8: {reason}")]
    Utf8Decode { reason: String },

    /// Encryption failed unexpectedly (programming error).
    #[error("unexpected filename encryption failure")]
    EncryptionFailed,

    /// Key access failed.
    #[error("key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Decrypted file header: the random nonce and the per-file content key.
///
/// The content key is wrapped in [`Zeroizing`] so it is wiped on drop, and
/// `Debug` redacts it.
pub struct FileHeader {
    nonce: [u8; HEADER_NONCE_SIZE],
    content_key: Zeroizing<[u8; 32]>,
}

impl FileHeader {
    pub fn nonce(&self) -> &[u8; HEADER_NONCE_SIZE] {
        &self.nonce
    }
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

/// Cryptographic capability consumed by the filesystem core.
///
/// A `Cryptor` is cheap to share (`Arc` inside) and all operations are
/// `&self`; the underlying [`MasterKey`] handles its own synchronization.
#[derive(Clone)]
pub struct Cryptor {
    master_key: Arc<MasterKey>,
}

impl fmt::Debug for Cryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cryptor").finish_non_exhaustive()
    }
}

impl Cryptor {
    pub fn new(master_key: Arc<MasterKey>) -> Self {
        Self { master_key }
    }

    /// Cleartext chunk size exposed to callers computing offsets.
    #[inline]
    pub fn cleartext_chunk_size(&self) -> usize {
        CHUNK_PAYLOAD_SIZE
    }

    /// Ciphertext chunk size exposed to callers computing offsets.
    #[inline]
    pub fn ciphertext_chunk_size(&self) -> usize {
        CHUNK_CIPHERTEXT_SIZE
    }

    /// Header size exposed to callers computing offsets.
    #[inline]
    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    // ========================================================================
    // File headers
    // ========================================================================

    /// Create a fresh header with a random nonce and content key.
    pub fn new_header(&self) -> FileHeader {
        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(content_key.as_mut());
        FileHeader { nonce, content_key }
    }

    /// Encrypt a header into its 68-byte on-disk form.
    pub fn encrypt_header(&self, header: &FileHeader) -> Result<Vec<u8>, ContentCryptoError> {
        self.master_key.with_aes_key(|aes_key| {
            let key: &Key<Aes256Gcm> = aes_key.into();
            let cipher = Aes256Gcm::new(key);

            let mut plaintext = Zeroizing::new(vec![0xFF; 8]);
            plaintext.extend_from_slice(header.content_key.as_ref());

            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&header.nonce), plaintext.as_slice())
                .map_err(|e| ContentCryptoError::EncryptionFailed {
                    reason: e.to_string(),
                })?;

            let mut encrypted = Vec::with_capacity(HEADER_SIZE);
            encrypted.extend_from_slice(&header.nonce);
            encrypted.extend_from_slice(&ciphertext);
            Ok(encrypted)
        })?
    }

    /// Decrypt a 68-byte on-disk header.
    pub fn decrypt_header(&self, encrypted: &[u8]) -> Result<FileHeader, ContentCryptoError> {
        if encrypted.len() != HEADER_SIZE {
            warn!(actual_size = encrypted.len(), "invalid header size");
            return Err(ContentCryptoError::InvalidHeader {
                reason: format!("expected {HEADER_SIZE} bytes, got {}", encrypted.len()),
            });
        }

        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        nonce.copy_from_slice(&encrypted[..HEADER_NONCE_SIZE]);

        self.master_key.with_aes_key(|aes_key| {
            let key: &Key<Aes256Gcm> = aes_key.into();
            let cipher = Aes256Gcm::new(key);

            let decrypted = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    &encrypted[HEADER_NONCE_SIZE..HEADER_SIZE],
                )
                .map_err(|_| {
                    warn!("header decryption failed - authentication tag mismatch");
                    ContentCryptoError::HeaderAuthFailed
                })?;
            let decrypted = Zeroizing::new(decrypted);

            if decrypted.len() != 40 {
                return Err(ContentCryptoError::InvalidHeader {
                    reason: format!("decrypted header has {} bytes, expected 40", decrypted.len()),
                });
            }

            // The first 8 bytes are reserved. They are not validated, for
            // forward compatibility; unexpected values are only logged.
            if decrypted[..8] != [0xFF; 8] {
                debug!(
                    reserved = %hex::encode(&decrypted[..8]),
                    "header has non-standard reserved bytes"
                );
            }

            let mut content_key = Zeroizing::new([0u8; 32]);
            content_key.copy_from_slice(&decrypted[8..40]);
            Ok(FileHeader { nonce, content_key })
        })?
    }

    // ========================================================================
    // Content chunks
    // ========================================================================

    /// Encrypt one cleartext chunk under the file's content key.
    ///
    /// The chunk number and the header nonce go into the associated data,
    /// binding the chunk to its position in this particular file.
    pub fn encrypt_chunk(
        &self,
        header: &FileHeader,
        chunk_number: u64,
        cleartext: &[u8],
    ) -> Result<Vec<u8>, ContentCryptoError> {
        debug_assert!(cleartext.len() <= CHUNK_PAYLOAD_SIZE);

        let key = Key::<Aes256Gcm>::from_slice(header.content_key.as_ref());
        let cipher = Aes256Gcm::new(key);

        let mut chunk_nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut chunk_nonce);

        let mut aad = [0u8; 20];
        aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
        aad[8..].copy_from_slice(&header.nonce);

        let payload = Payload {
            msg: cleartext,
            aad: &aad,
        };

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&chunk_nonce), payload)
            .map_err(|e| ContentCryptoError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        let mut out = Vec::with_capacity(CHUNK_OVERHEAD + cleartext.len());
        out.extend_from_slice(&chunk_nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt and authenticate one ciphertext chunk.
    pub fn decrypt_chunk(
        &self,
        header: &FileHeader,
        chunk_number: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ContentCryptoError> {
        if ciphertext.len() < CHUNK_OVERHEAD {
            warn!(
                chunk = chunk_number,
                actual_size = ciphertext.len(),
                "incomplete chunk"
            );
            return Err(ContentCryptoError::IncompleteChunk {
                chunk: chunk_number,
                actual: ciphertext.len(),
            });
        }

        let key = Key::<Aes256Gcm>::from_slice(header.content_key.as_ref());
        let cipher = Aes256Gcm::new(key);

        let chunk_nonce = Nonce::from_slice(&ciphertext[..12]);

        let mut aad = [0u8; 20];
        aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
        aad[8..].copy_from_slice(&header.nonce);

        let payload = Payload {
            msg: &ciphertext[12..],
            aad: &aad,
        };

        cipher.decrypt(chunk_nonce, payload).map_err(|_| {
            warn!(
                chunk = chunk_number,
                "chunk decryption failed - authentication tag mismatch"
            );
            ContentCryptoError::ChunkAuthFailed {
                chunk: chunk_number,
            }
        })
    }

    // ========================================================================
    // Filenames
    // ========================================================================

    /// Encrypt a filename using AES-SIV with the parent directory ID as
    /// associated data.
    ///
    /// The name is normalized to NFC before encryption so that NFD input
    /// (macOS) and NFC input (Linux, Windows) map to the same ciphertext.
    /// Returns base64url **without** the `.c9r` suffix; the codec layer adds
    /// extensions.
    pub fn encrypt_name(&self, name: &str, parent_dir_id: &str) -> Result<String, NameError> {
        let normalized: String = name.nfc().collect();

        self.master_key.with_siv_key(|key| {
            let mut cipher =
                Aes256Siv::new_from_slice(key).map_err(|_| NameError::EncryptionFailed)?;

            let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
            let encrypted = cipher
                .encrypt(associated_data, normalized.as_bytes())
                .map_err(|_| NameError::EncryptionFailed)?;

            Ok(general_purpose::URL_SAFE.encode(&encrypted))
        })?
    }

    /// Decrypt a filename using AES-SIV with the parent directory ID as
    /// associated data.
    ///
    /// Accepts both padded and unpadded base64url and tolerates a trailing
    /// `.c9r` suffix, so callers can pass names exactly as found on disk.
    pub fn decrypt_name(
        &self,
        encrypted_name: &str,
        parent_dir_id: &str,
    ) -> Result<String, NameError> {
        let without_extension = encrypted_name.trim_end_matches(".c9r");

        let decoded = general_purpose::URL_SAFE
            .decode(without_extension.as_bytes())
            .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(without_extension.as_bytes()))
            .map_err(|e| NameError::Base64Decode {
                reason: e.to_string(),
            })?;

        self.master_key.with_siv_key(|key| {
            let mut cipher =
                Aes256Siv::new_from_slice(key).map_err(|_| NameError::EncryptionFailed)?;

            let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
            let decrypted = cipher
                .decrypt(associated_data, &decoded)
                .map_err(|_| NameError::DecryptionFailed)?;

            String::from_utf8(decrypted).map_err(|e| NameError::Utf8Decode {
                reason: e.to_string(),
            })
        })?
    }

    // ========================================================================
    // Directory IDs
    // ========================================================================

    /// Hash a directory ID into its storage location name.
    ///
    /// The ID is encrypted with AES-SIV (no associated data), hashed with
    /// SHA-1, and Base32-encoded, yielding 32 uppercase characters that are
    /// split `2/30` to form the `d/XX/YYY…` path.
    pub fn hash_dir_id(&self, dir_id: &str) -> Result<String, NameError> {
        self.master_key.with_siv_key(|key| {
            let mut cipher =
                Aes256Siv::new_from_slice(key).map_err(|_| NameError::EncryptionFailed)?;

            let associated_data: &[&[u8]] = &[];
            let encrypted = cipher
                .encrypt(associated_data, dir_id.as_bytes())
                .map_err(|_| NameError::EncryptionFailed)?;

            let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
            Ok(BASE32.encode(hashed.as_ref()))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cryptor() -> Cryptor {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        for i in 0..32 {
            aes_key[i] = i as u8;
            mac_key[i] = (32 + i) as u8;
        }
        Cryptor::new(Arc::new(MasterKey::new(aes_key, mac_key)))
    }

    fn other_cryptor() -> Cryptor {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        for i in 0..32 {
            aes_key[i] = (i + 100) as u8;
            mac_key[i] = (i + 200) as u8;
        }
        Cryptor::new(Arc::new(MasterKey::new(aes_key, mac_key)))
    }

    #[test]
    fn header_roundtrip() {
        let cryptor = test_cryptor();
        let header = cryptor.new_header();
        let encrypted = cryptor.encrypt_header(&header).unwrap();
        assert_eq!(encrypted.len(), HEADER_SIZE);

        let decrypted = cryptor.decrypt_header(&encrypted).unwrap();
        assert_eq!(decrypted.nonce, header.nonce);
        assert_eq!(*decrypted.content_key, *header.content_key);
    }

    #[test]
    fn header_wrong_key_fails() {
        let cryptor = test_cryptor();
        let encrypted = cryptor.encrypt_header(&cryptor.new_header()).unwrap();
        let err = other_cryptor().decrypt_header(&encrypted).unwrap_err();
        assert!(matches!(err, ContentCryptoError::HeaderAuthFailed));
    }

    #[test]
    fn header_wrong_size_fails() {
        let cryptor = test_cryptor();
        let err = cryptor.decrypt_header(&[0u8; 42]).unwrap_err();
        assert!(matches!(err, ContentCryptoError::InvalidHeader { .. }));
    }

    #[test]
    fn header_tampering_detected() {
        let cryptor = test_cryptor();
        let mut encrypted = cryptor.encrypt_header(&cryptor.new_header()).unwrap();
        encrypted[20] ^= 0xFF;
        let err = cryptor.decrypt_header(&encrypted).unwrap_err();
        assert!(matches!(err, ContentCryptoError::HeaderAuthFailed));
    }

    #[test]
    fn chunk_roundtrip() {
        let cryptor = test_cryptor();
        let header = cryptor.new_header();

        for payload in [&b""[..], b"hello", &[0xAB; CHUNK_PAYLOAD_SIZE]] {
            let ct = cryptor.encrypt_chunk(&header, 3, payload).unwrap();
            assert_eq!(ct.len(), payload.len() + CHUNK_OVERHEAD);
            let pt = cryptor.decrypt_chunk(&header, 3, &ct).unwrap();
            assert_eq!(pt, payload);
        }
    }

    #[test]
    fn chunk_number_is_authenticated() {
        let cryptor = test_cryptor();
        let header = cryptor.new_header();
        let ct = cryptor.encrypt_chunk(&header, 0, b"payload").unwrap();

        let err = cryptor.decrypt_chunk(&header, 1, &ct).unwrap_err();
        assert!(matches!(
            err,
            ContentCryptoError::ChunkAuthFailed { chunk: 1 }
        ));
    }

    #[test]
    fn chunk_bound_to_header_nonce() {
        let cryptor = test_cryptor();
        let header_a = cryptor.new_header();
        let mut header_b = cryptor.new_header();
        header_b.content_key = header_a.content_key.clone();

        let ct = cryptor.encrypt_chunk(&header_a, 0, b"payload").unwrap();
        let err = cryptor.decrypt_chunk(&header_b, 0, &ct).unwrap_err();
        assert!(matches!(err, ContentCryptoError::ChunkAuthFailed { .. }));
    }

    #[test]
    fn short_chunk_rejected() {
        let cryptor = test_cryptor();
        let header = cryptor.new_header();
        let err = cryptor.decrypt_chunk(&header, 0, &[0u8; 27]).unwrap_err();
        assert!(matches!(
            err,
            ContentCryptoError::IncompleteChunk {
                chunk: 0,
                actual: 27
            }
        ));
    }

    #[test]
    fn name_encryption_is_deterministic() {
        let cryptor = test_cryptor();
        let a = cryptor.encrypt_name("report.txt", "some-dir-id").unwrap();
        let b = cryptor.encrypt_name("report.txt", "some-dir-id").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn name_roundtrip() {
        let cryptor = test_cryptor();
        for name in [
            "simple.txt",
            "file with spaces.doc",
            "unicode-caf\u{00E9}.txt",
            ".hidden",
            "file.with.multiple.dots",
        ] {
            let encrypted = cryptor.encrypt_name(name, "").unwrap();
            let decrypted = cryptor.decrypt_name(&encrypted, "").unwrap();
            assert_eq!(decrypted, name);
        }
    }

    #[test]
    fn name_bound_to_parent_dir_id() {
        let cryptor = test_cryptor();
        let encrypted = cryptor.encrypt_name("test.txt", "parent-a").unwrap();

        assert_ne!(
            encrypted,
            cryptor.encrypt_name("test.txt", "parent-b").unwrap()
        );

        let err = cryptor.decrypt_name(&encrypted, "parent-b").unwrap_err();
        assert!(matches!(err, NameError::DecryptionFailed));
    }

    #[test]
    fn name_decrypt_accepts_suffix_and_unpadded() {
        let cryptor = test_cryptor();
        let encrypted = cryptor.encrypt_name("document.pdf", "").unwrap();

        let with_suffix = format!("{encrypted}.c9r");
        assert_eq!(cryptor.decrypt_name(&with_suffix, "").unwrap(), "document.pdf");

        let unpadded = encrypted.trim_end_matches('=');
        assert_eq!(cryptor.decrypt_name(unpadded, "").unwrap(), "document.pdf");
    }

    #[test]
    fn nfd_input_normalizes_to_nfc() {
        let cryptor = test_cryptor();
        let nfd = "cafe\u{0301}.txt";
        let nfc = "caf\u{00E9}.txt";
        assert_ne!(nfd.as_bytes(), nfc.as_bytes());

        let from_nfd = cryptor.encrypt_name(nfd, "").unwrap();
        let from_nfc = cryptor.encrypt_name(nfc, "").unwrap();
        assert_eq!(from_nfd, from_nfc);

        assert_eq!(cryptor.decrypt_name(&from_nfd, "").unwrap(), nfc);
    }

    #[test]
    fn invalid_base64_rejected() {
        let cryptor = test_cryptor();
        let err = cryptor.decrypt_name("not base64!.c9r", "").unwrap_err();
        assert!(matches!(err, NameError::Base64Decode { .. }));
    }

    #[test]
    fn dir_id_hash_format() {
        let cryptor = test_cryptor();
        let hash = cryptor.hash_dir_id("").unwrap();
        assert_eq!(hash.len(), 32, "Base32 of SHA-1 is 32 characters");
        for ch in hash.chars() {
            assert!(ch.is_ascii_uppercase() || ('2'..='7').contains(&ch));
        }
    }

    #[test]
    fn dir_id_hash_deterministic_and_distinct() {
        let cryptor = test_cryptor();
        let root = cryptor.hash_dir_id("").unwrap();
        assert_eq!(root, cryptor.hash_dir_id("").unwrap());

        let other = cryptor
            .hash_dir_id("e9250eb8-078d-4fc0-8835-be92a313360c")
            .unwrap();
        assert_ne!(root, other);
    }

    #[test]
    fn dir_id_hash_depends_on_key() {
        let a = test_cryptor().hash_dir_id("dir").unwrap();
        let b = other_cryptor().hash_dir_id("dir").unwrap();
        assert_ne!(a, b);
    }
}
