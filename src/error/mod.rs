//! Error types, re-exported from their home modules.

pub use crate::crypto::cryptor::{ContentCryptoError, NameError};
pub use crate::crypto::keys::KeyAccessError;
pub use crate::fs::name::InvalidNameError;
pub use crate::fs::symlink::SymlinkError;
pub use crate::vault::chunks::SizeFormulaError;
pub use crate::vault::filesystem::FsError;
