//! Cleartext → ciphertext path translation.
//!
//! The mapper walks a cleartext path component by component: it looks up the
//! parent directory's ID, encrypts the child name under it, and probes the
//! host filesystem to classify what exists there. Node kinds are a tagged
//! variant, distinguished on disk by marker files: an entry directory
//! containing `dir.c9r` is a subdirectory, one containing `symlink.c9r` is a
//! symlink, a plain `.c9r` file is a regular file, and a `.c9s` wrapper is
//! the shortened form of any of the three.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::crypto::Cryptor;
use crate::fs::name::{self, CiphertextName, CONTENTS_FILE, DIR_MARKER, SYMLINK_MARKER};
use crate::vault::dir_id::DirIdStore;
use crate::vault::filesystem::FsError;
use crate::vault::path::{DirId, VaultPath};

/// Kind of a resolved vault node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// A resolved ciphertext node.
#[derive(Debug, Clone)]
pub(crate) struct CiphertextNode {
    pub kind: NodeKind,
    /// The on-disk entry: a `.c9r` file, or a `.c9r`/`.c9s` directory.
    pub entry_path: PathBuf,
    /// The payload location: the file body, `dir.c9r`, or `symlink.c9r`.
    pub content_path: PathBuf,
    /// Whether the entry is stored under a `.c9s` shortform.
    pub shortened: bool,
    /// For directories: the directory's own ID.
    pub dir_id: Option<DirId>,
    /// For directories: where the directory's children live (`d/XX/YYY…`).
    pub dir_storage: Option<PathBuf>,
}

/// Location of a (possibly not yet existing) child inside its parent.
#[derive(Debug, Clone)]
pub(crate) struct ParentLocation {
    /// The parent directory's ID.
    pub dir_id: DirId,
    /// The parent's ciphertext storage directory.
    pub storage_dir: PathBuf,
    /// Cleartext name of the final component.
    pub child_name: String,
}

/// Translates cleartext vault paths to ciphertext host paths.
#[derive(Debug)]
pub(crate) struct CryptoPathMapper {
    cryptor: Arc<Cryptor>,
    dir_ids: Arc<DirIdStore>,
    vault_root: PathBuf,
    shortening_threshold: usize,
}

impl CryptoPathMapper {
    pub fn new(
        cryptor: Arc<Cryptor>,
        dir_ids: Arc<DirIdStore>,
        vault_root: PathBuf,
        shortening_threshold: usize,
    ) -> Self {
        CryptoPathMapper {
            cryptor,
            dir_ids,
            vault_root,
            shortening_threshold,
        }
    }

    pub fn dir_ids(&self) -> &Arc<DirIdStore> {
        &self.dir_ids
    }

    /// Ciphertext storage directory for a DirId: `<vault>/d/XX/YYY…`.
    pub fn storage_dir(&self, dir_id: &DirId) -> Result<PathBuf, FsError> {
        let hashed = self
            .cryptor
            .hash_dir_id(dir_id.as_str())
            .map_err(|e| FsError::Internal {
                reason: format!("directory id hashing failed: {e}"),
            })?;
        Ok(self
            .vault_root
            .join("d")
            .join(&hashed[..2])
            .join(&hashed[2..]))
    }

    /// Encrypt a child name under its parent directory's ID.
    pub fn ciphertext_name(
        &self,
        name: &str,
        parent_dir_id: &DirId,
    ) -> Result<CiphertextName, FsError> {
        name::encrypt_name(
            &self.cryptor,
            name,
            parent_dir_id.as_str(),
            self.shortening_threshold,
        )
        .map_err(|e| FsError::Internal {
            reason: format!("filename encryption failed: {e}"),
        })
    }

    /// Resolve a cleartext path to its ciphertext node, or `None` if the
    /// terminal component does not exist.
    ///
    /// Intermediate components must exist and be directories; otherwise this
    /// fails with not-found or not-a-directory.
    pub fn resolve(&self, path: &VaultPath) -> Result<Option<CiphertextNode>, FsError> {
        if path.is_root() {
            let storage = self.storage_dir(&DirId::root())?;
            return Ok(Some(CiphertextNode {
                kind: NodeKind::Directory,
                entry_path: storage.clone(),
                content_path: storage.clone(),
                shortened: false,
                dir_id: Some(DirId::root()),
                dir_storage: Some(storage),
            }));
        }

        let parent = self.resolve_parent(path)?;
        let cname = self.ciphertext_name(&parent.child_name, &parent.dir_id)?;
        self.probe_child(&parent.storage_dir, &cname)
    }

    /// Resolve everything but the terminal component.
    ///
    /// This is the entry point for create and delete operations where the
    /// terminal may not (or must not) exist yet.
    pub fn resolve_parent(&self, path: &VaultPath) -> Result<ParentLocation, FsError> {
        let Some((parent, child_name)) = path.split() else {
            return Err(FsError::InvalidName {
                name: "/".to_string(),
                reason: "the root has no parent".to_string(),
            });
        };
        let dir_id = self.directory_dir_id(&parent)?;
        let storage_dir = self.storage_dir(&dir_id)?;
        // The DirId may have come from the cache; a dir.c9r (or cached
        // mapping) pointing at a missing storage directory is corruption.
        if !storage_dir.is_dir() {
            self.dir_ids.invalidate_subtree(&parent);
            return Err(FsError::CorruptedDirectory {
                path: parent.to_string(),
                reason: format!(
                    "directory id points at missing storage directory {}",
                    storage_dir.display()
                ),
            });
        }
        Ok(ParentLocation {
            dir_id,
            storage_dir,
            child_name: child_name.to_string(),
        })
    }

    /// DirId of a cleartext directory path, walking ancestors as needed and
    /// consulting the bounded cache.
    pub fn directory_dir_id(&self, path: &VaultPath) -> Result<DirId, FsError> {
        if path.is_root() {
            return Ok(DirId::root());
        }
        if let Some(cached) = self.dir_ids.cached(path) {
            trace!(path = %path, "dir id cache hit");
            return Ok(cached);
        }

        let (parent, child_name) = path
            .split()
            .expect("non-root path always splits");
        let parent_id = self.directory_dir_id(&parent)?;
        let storage = self.storage_dir(&parent_id)?;
        let cname = self.ciphertext_name(child_name, &parent_id)?;

        match self.probe_child(&storage, &cname)? {
            None => Err(FsError::NotFound {
                path: path.to_string(),
            }),
            Some(node) => match node.kind {
                NodeKind::Directory => {
                    let dir_id = node
                        .dir_id
                        .expect("directory nodes carry their dir id");
                    self.dir_ids.remember(path, dir_id.clone());
                    Ok(dir_id)
                }
                NodeKind::File | NodeKind::Symlink => Err(FsError::NotADirectory {
                    path: path.to_string(),
                }),
            },
        }
    }

    /// Probe what exists on disk for an encrypted child name.
    fn probe_child(
        &self,
        storage_dir: &Path,
        cname: &CiphertextName,
    ) -> Result<Option<CiphertextNode>, FsError> {
        let entry_path = storage_dir.join(&cname.disk_name);
        let metadata = match fs::symlink_metadata(&entry_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::io(entry_path.display().to_string(), e)),
        };

        if !cname.shortened && metadata.is_file() {
            return Ok(Some(CiphertextNode {
                kind: NodeKind::File,
                content_path: entry_path.clone(),
                entry_path,
                shortened: false,
                dir_id: None,
                dir_storage: None,
            }));
        }

        if !metadata.is_dir() {
            warn!(entry = %entry_path.display(), "vault entry has unexpected file type");
            return Ok(None);
        }

        let dir_marker = entry_path.join(DIR_MARKER);
        if dir_marker.is_file() {
            let dir_id = DirIdStore::read_dir_file(&dir_marker)?;
            let dir_storage = self.storage_dir(&dir_id)?;
            if !dir_storage.is_dir() {
                return Err(FsError::CorruptedDirectory {
                    path: entry_path.display().to_string(),
                    reason: format!(
                        "dir.c9r points at missing storage directory {}",
                        dir_storage.display()
                    ),
                });
            }
            return Ok(Some(CiphertextNode {
                kind: NodeKind::Directory,
                content_path: dir_marker,
                entry_path,
                shortened: cname.shortened,
                dir_id: Some(dir_id),
                dir_storage: Some(dir_storage),
            }));
        }

        let symlink_marker = entry_path.join(SYMLINK_MARKER);
        if symlink_marker.is_file() {
            return Ok(Some(CiphertextNode {
                kind: NodeKind::Symlink,
                content_path: symlink_marker,
                entry_path,
                shortened: cname.shortened,
                dir_id: None,
                dir_storage: None,
            }));
        }

        if cname.shortened {
            let contents = entry_path.join(CONTENTS_FILE);
            if contents.is_file() {
                return Ok(Some(CiphertextNode {
                    kind: NodeKind::File,
                    content_path: contents,
                    entry_path,
                    shortened: true,
                    dir_id: None,
                    dir_storage: None,
                }));
            }
        }

        warn!(entry = %entry_path.display(), "vault entry directory has no recognizable marker");
        Ok(None)
    }
}
