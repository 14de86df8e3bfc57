//! Type-safe path handling for the vault.
//!
//! Two distinct types prevent confusion between the opaque directory
//! identifiers used on disk and the user-facing cleartext paths:
//! [`DirId`] addresses a directory's ciphertext location independent of its
//! parent path; [`VaultPath`] is the logical path an application sees.

use relative_path::{RelativePath, RelativePathBuf};
use std::fmt;

/// Opaque directory identifier.
///
/// Directory IDs are 36-character UUID strings stored in `dir.c9r` files.
/// They serve as associated data for filename encryption, binding each
/// filename to its parent directory. The root directory has the fixed empty
/// ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(String);

impl DirId {
    /// The root directory (empty string ID).
    #[inline]
    pub fn root() -> Self {
        DirId(String::new())
    }

    /// Create a `DirId` from a raw string, e.g. the contents of a `dir.c9r`
    /// file. Not for user-provided paths.
    #[inline]
    pub fn from_raw(id: impl Into<String>) -> Self {
        DirId(id.into())
    }

    /// Generate a fresh random directory ID.
    pub fn generate() -> Self {
        DirId(uuid::Uuid::new_v4().to_string())
    }

    /// Check if this is the root directory.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw string representation, as stored on disk.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DirId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// User-facing cleartext path within the vault.
///
/// Vault paths use `/` as the separator regardless of the host OS and are
/// normalized on construction (leading slashes stripped). They describe the
/// logical tree, never the encrypted on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultPath(RelativePathBuf);

impl VaultPath {
    /// The root path (empty).
    #[inline]
    pub fn root() -> Self {
        VaultPath(RelativePathBuf::new())
    }

    /// Create a vault path from a string; leading slashes are stripped.
    pub fn new(path: impl AsRef<str>) -> Self {
        let s = path.as_ref().trim_start_matches('/');
        VaultPath(RelativePathBuf::from(s))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[inline]
    pub fn as_relative_path(&self) -> &RelativePath {
        &self.0
    }

    /// Join this path with a child component.
    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VaultPath(self.0.join(component.as_ref()))
    }

    /// The parent path; `None` for the root.
    pub fn parent(&self) -> Option<VaultPath> {
        self.0.parent().map(|p| VaultPath(p.to_relative_path_buf()))
    }

    /// The final component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    /// Iterate over path components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Split into (parent, final component); `None` for the root.
    pub fn split(&self) -> Option<(VaultPath, &str)> {
        let parent = self.parent()?;
        let name = self.file_name()?;
        Some((parent, name))
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &VaultPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        let s = self.as_str();
        let a = ancestor.as_str();
        s == a || (s.starts_with(a) && s.as_bytes().get(a.len()) == Some(&b'/'))
    }
}

impl AsRef<str> for VaultPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "/{}", self.0)
        }
    }
}

impl From<&str> for VaultPath {
    fn from(s: &str) -> Self {
        VaultPath::new(s)
    }
}

impl From<String> for VaultPath {
    fn from(s: String) -> Self {
        VaultPath::new(s)
    }
}
