//! Symlink target encryption.
//!
//! A symlink is stored as an entry directory containing a `symlink.c9r` file
//! whose payload is the cleartext target path, encrypted with the same
//! header + chunk scheme as regular file bodies. The target is an opaque
//! string; it is never passed through path translation.

use thiserror::Error;

use crate::crypto::{ContentCryptoError, Cryptor, HEADER_SIZE};

/// Errors from symlink target encryption and decryption.
#[derive(Error, Debug)]
pub enum SymlinkError {
    /// The `symlink.c9r` file is too small to contain a header.
    #[error("symlink file is too small: {size} bytes, minimum {HEADER_SIZE}")]
    TooSmall { size: usize },

    /// Header or content authentication failed.
    #[error("symlink target decryption failed: {0}")]
    Crypto(#[from] ContentCryptoError),

    /// The decrypted target is not valid UTF-8.
    #[error("symlink target is not valid UTF-8: {reason}")]
    Utf8Decode { reason: String },
}

/// Encrypt a symlink target into `symlink.c9r` file contents.
///
/// A fresh header (and therefore a fresh content key) is generated per call,
/// so encrypting the same target twice yields different ciphertext.
pub fn encrypt_symlink_target(cryptor: &Cryptor, target: &str) -> Result<Vec<u8>, SymlinkError> {
    let header = cryptor.new_header();
    let mut out = cryptor.encrypt_header(&header)?;

    let payload = target.as_bytes();
    // Symlink targets fit one chunk by construction (paths are far below
    // 32 KiB); chunk the payload anyway so oversized targets stay valid.
    for (chunk_number, chunk) in chunks_including_empty(payload).enumerate() {
        let encrypted = cryptor.encrypt_chunk(&header, chunk_number as u64, chunk)?;
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

/// Decrypt `symlink.c9r` file contents back into the target path.
pub fn decrypt_symlink_target(cryptor: &Cryptor, encrypted: &[u8]) -> Result<String, SymlinkError> {
    if encrypted.len() < HEADER_SIZE {
        return Err(SymlinkError::TooSmall {
            size: encrypted.len(),
        });
    }

    let header = cryptor.decrypt_header(&encrypted[..HEADER_SIZE])?;

    let mut target = Vec::new();
    for (chunk_number, chunk) in encrypted[HEADER_SIZE..]
        .chunks(crate::crypto::CHUNK_CIPHERTEXT_SIZE)
        .enumerate()
    {
        let decrypted = cryptor.decrypt_chunk(&header, chunk_number as u64, chunk)?;
        target.extend_from_slice(&decrypted);
    }

    String::from_utf8(target).map_err(|e| SymlinkError::Utf8Decode {
        reason: e.to_string(),
    })
}

/// Like `chunks()` but yields one empty chunk for empty input, so even an
/// empty target gets an authenticated body.
fn chunks_including_empty(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(crate::crypto::CHUNK_PAYLOAD_SIZE).collect()
    };
    chunks.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use std::sync::Arc;

    fn test_cryptor() -> Cryptor {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        for i in 0..32 {
            aes_key[i] = i as u8;
            mac_key[i] = (32 + i) as u8;
        }
        Cryptor::new(Arc::new(MasterKey::new(aes_key, mac_key)))
    }

    #[test]
    fn target_roundtrip() {
        let cryptor = test_cryptor();
        for target in [
            "../other_file.txt",
            "/absolute/path/to/file",
            "relative/path",
            ".",
            "..",
            "file with spaces.txt",
            "",
        ] {
            let encrypted = encrypt_symlink_target(&cryptor, target).unwrap();
            let decrypted = decrypt_symlink_target(&cryptor, &encrypted).unwrap();
            assert_eq!(decrypted, target, "roundtrip failed for {target:?}");
        }
    }

    #[test]
    fn encryption_is_randomized() {
        let cryptor = test_cryptor();
        let a = encrypt_symlink_target(&cryptor, "../linked.txt").unwrap();
        let b = encrypt_symlink_target(&cryptor, "../linked.txt").unwrap();
        assert_ne!(a, b, "fresh header per call");
        assert_eq!(
            decrypt_symlink_target(&cryptor, &a).unwrap(),
            decrypt_symlink_target(&cryptor, &b).unwrap()
        );
    }

    #[test]
    fn tampered_target_detected() {
        let cryptor = test_cryptor();
        let mut encrypted = encrypt_symlink_target(&cryptor, "../linked.txt").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(matches!(
            decrypt_symlink_target(&cryptor, &encrypted),
            Err(SymlinkError::Crypto(_))
        ));
    }

    #[test]
    fn truncated_file_rejected() {
        let cryptor = test_cryptor();
        assert!(matches!(
            decrypt_symlink_target(&cryptor, &[0u8; 50]),
            Err(SymlinkError::TooSmall { size: 50 })
        ));
    }

    #[test]
    fn long_target_roundtrip() {
        let cryptor = test_cryptor();
        let target = format!("/very/long/path/{}", "a".repeat(500));
        let encrypted = encrypt_symlink_target(&cryptor, &target).unwrap();
        assert_eq!(decrypt_symlink_target(&cryptor, &encrypted).unwrap(), target);
    }
}
