//! Filename codec: `.c9r` encoding, `.c9s` shortening, and name validation.
//!
//! Encrypted names carry a `.c9r` suffix on disk. When the full ciphertext
//! name (including the suffix) exceeds the configured shortening threshold,
//! the entry is stored under `base64url(sha1(fullName)).c9s` instead, with a
//! `name.c9s` sidecar inside the wrapper directory holding the full name.

use base64::{Engine as _, engine::general_purpose};
use ring::digest;
use thiserror::Error;

use crate::crypto::{Cryptor, NameError};

/// Default threshold above which ciphertext names are shortened.
pub const DEFAULT_SHORTENING_THRESHOLD: usize = 220;

/// Marker file inside a `.c9r`/`.c9s` directory indicating a directory entry.
pub const DIR_MARKER: &str = "dir.c9r";

/// Marker file inside a `.c9r`/`.c9s` directory indicating a symlink entry.
pub const SYMLINK_MARKER: &str = "symlink.c9r";

/// Content file inside a `.c9s` wrapper for shortened regular files.
pub const CONTENTS_FILE: &str = "contents.c9r";

/// Sidecar inside a `.c9s` wrapper storing the full encrypted name.
pub const NAME_FILE: &str = "name.c9s";

/// Encrypted backup of a directory's own ID, stored inside its content dir.
pub const DIR_ID_BACKUP_FILE: &str = "dirid.c9r";

/// Errors from cleartext name validation.
#[derive(Error, Debug)]
pub enum InvalidNameError {
    #[error("name is empty")]
    Empty,

    #[error("'{0}' is a reserved name")]
    Reserved(String),

    #[error("name contains forbidden character {0:?}")]
    ForbiddenCharacter(char),

    #[error("name is {actual} characters long, limit is {limit}")]
    TooLong { actual: usize, limit: usize },
}

/// The on-disk form of one encrypted name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextName {
    /// Full encrypted filename including the `.c9r` suffix.
    pub full_name: String,
    /// The name the entry is stored under: `full_name` itself, or the
    /// `<hash>.c9s` shortform when the full name exceeds the threshold.
    pub disk_name: String,
    /// Whether `disk_name` is a `.c9s` shortform needing a sidecar.
    pub shortened: bool,
}

/// Validate a cleartext filename.
///
/// Rejects empty names, `.` and `..`, path separators, NUL, and names longer
/// than `max_length` characters (when a limit is configured).
pub fn validate_cleartext_name(
    name: &str,
    max_length: Option<usize>,
) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if name == "." || name == ".." {
        return Err(InvalidNameError::Reserved(name.to_string()));
    }
    for ch in name.chars() {
        if ch == '/' || ch == '\0' {
            return Err(InvalidNameError::ForbiddenCharacter(ch));
        }
    }
    if let Some(limit) = max_length {
        let actual = name.chars().count();
        if actual > limit {
            return Err(InvalidNameError::TooLong { actual, limit });
        }
    }
    Ok(())
}

/// Encrypt a cleartext name for storage under the given parent directory.
///
/// Deterministic: the same (name, parent DirId) pair always yields the same
/// ciphertext name, and therefore the same shortform.
pub fn encrypt_name(
    cryptor: &Cryptor,
    name: &str,
    parent_dir_id: &str,
    shortening_threshold: usize,
) -> Result<CiphertextName, NameError> {
    let encrypted = cryptor.encrypt_name(name, parent_dir_id)?;
    let full_name = format!("{encrypted}.c9r");

    if full_name.len() > shortening_threshold {
        let disk_name = format!("{}.c9s", shorten_name(&full_name));
        Ok(CiphertextName {
            full_name,
            disk_name,
            shortened: true,
        })
    } else {
        Ok(CiphertextName {
            disk_name: full_name.clone(),
            full_name,
            shortened: false,
        })
    }
}

/// Compute the SHA-1 based shortform of a full encrypted name.
///
/// Base64url with padding over the full 20-byte digest, matching the sidecar
/// scheme: the shortform is pure hash, the sidecar restores the name.
pub fn shorten_name(full_encrypted_name: &str) -> String {
    let hash = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY,
        full_encrypted_name.as_bytes(),
    );
    general_purpose::URL_SAFE.encode(hash.as_ref())
}

/// Classification of a directory entry by its on-disk extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    /// Regular encrypted entry (`.c9r`).
    Regular,
    /// Shortened entry (`.c9s`), name exceeded the threshold.
    Shortened,
}

/// Classify an on-disk entry name and strip its extension.
///
/// Returns `None` for names without a recognized vault extension.
pub fn classify_entry(disk_name: &str) -> Option<(EntryFormat, &str)> {
    if let Some(base) = disk_name.strip_suffix(".c9r") {
        Some((EntryFormat::Regular, base))
    } else if let Some(base) = disk_name.strip_suffix(".c9s") {
        Some((EntryFormat::Shortened, base))
    } else {
        None
    }
}
