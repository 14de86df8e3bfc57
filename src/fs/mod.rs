//! Filesystem-level primitives: the filename codec and symlink payloads.

pub mod name;
pub mod symlink;

pub use name::{
    CONTENTS_FILE, CiphertextName, DEFAULT_SHORTENING_THRESHOLD, DIR_ID_BACKUP_FILE, DIR_MARKER,
    EntryFormat, InvalidNameError, NAME_FILE, SYMLINK_MARKER, classify_entry, encrypt_name,
    shorten_name, validate_cleartext_name,
};
pub use symlink::{SymlinkError, decrypt_symlink_target, encrypt_symlink_target};
