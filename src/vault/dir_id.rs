//! Directory ID persistence and caching.
//!
//! Every cleartext directory owns a [`DirId`] stored as plain text in the
//! `dir.c9r` file inside its ciphertext entry. The ID, not the parent path,
//! addresses the directory's contents under `d/XX/YYY…`, so renaming a
//! directory never moves its contents. A bounded LRU caches the
//! cleartext-path → DirId mapping; any mutation of an ancestor invalidates
//! the whole affected subtree.

use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use tracing::{debug, trace};

use crate::crypto::Cryptor;
use crate::vault::filesystem::FsError;
use crate::vault::path::{DirId, VaultPath};

/// Default capacity of the path → DirId cache.
pub const DEFAULT_DIR_ID_CACHE_CAPACITY: usize = 1024;

/// `dir.c9r` files larger than this are considered corrupted.
const MAX_DIR_FILE_LEN: u64 = 1000;

/// Cache of cleartext directory paths to their directory IDs.
///
/// Reads and writes of the underlying `dir.c9r` files are associated
/// functions; only the cache itself is stateful.
pub(crate) struct DirIdStore {
    cache: Mutex<LruCache<String, DirId>>,
}

impl std::fmt::Debug for DirIdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("DirIdStore").field("cached", &len).finish()
    }
}

impl DirIdStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        DirIdStore {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached DirId for a cleartext directory path, if any.
    pub fn cached(&self, path: &VaultPath) -> Option<DirId> {
        let mut cache = self.cache.lock().ok()?;
        cache.get(path.as_str()).cloned()
    }

    /// Remember a resolved mapping.
    pub fn remember(&self, path: &VaultPath, dir_id: DirId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(path.as_str().to_string(), dir_id);
        }
    }

    /// Drop every cached mapping at or below the given path.
    ///
    /// Called on rename, move, or delete; descendants resolved through the
    /// old path must not survive.
    pub fn invalidate_subtree(&self, path: &VaultPath) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if path.is_root() {
            cache.clear();
            return;
        }
        let doomed: Vec<String> = cache
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| VaultPath::new(k.as_str()).starts_with(path))
            .collect();
        for key in &doomed {
            cache.pop(key);
        }
        if !doomed.is_empty() {
            trace!(path = %path, invalidated = doomed.len(), "invalidated dir id cache subtree");
        }
    }

    /// Read and validate a `dir.c9r` file.
    pub fn read_dir_file(dir_file: &Path) -> Result<DirId, FsError> {
        let metadata =
            fs::metadata(dir_file).map_err(|e| FsError::io(dir_file.display().to_string(), e))?;
        if metadata.len() > MAX_DIR_FILE_LEN {
            return Err(FsError::CorruptedDirectory {
                path: dir_file.display().to_string(),
                reason: format!("dir.c9r is {} bytes, limit {MAX_DIR_FILE_LEN}", metadata.len()),
            });
        }
        let raw =
            fs::read(dir_file).map_err(|e| FsError::io(dir_file.display().to_string(), e))?;
        if raw.is_empty() {
            return Err(FsError::CorruptedDirectory {
                path: dir_file.display().to_string(),
                reason: "dir.c9r is empty".to_string(),
            });
        }
        let id = String::from_utf8(raw).map_err(|_| FsError::CorruptedDirectory {
            path: dir_file.display().to_string(),
            reason: "dir.c9r is not valid UTF-8".to_string(),
        })?;
        Ok(DirId::from_raw(id))
    }

    /// Write a `dir.c9r` file.
    pub fn write_dir_file(dir_file: &Path, dir_id: &DirId) -> Result<(), FsError> {
        fs::write(dir_file, dir_id.as_str())
            .map_err(|e| FsError::io(dir_file.display().to_string(), e))
    }

    /// Write the encrypted `dirid.c9r` backup inside a directory's content
    /// dir. The backup holds the directory's own ID, encrypted like regular
    /// file content, and enables offline recovery of the tree structure.
    pub fn write_dir_id_backup(
        cryptor: &Cryptor,
        content_dir: &Path,
        dir_id: &DirId,
    ) -> Result<(), FsError> {
        let backup_path = content_dir.join(crate::fs::name::DIR_ID_BACKUP_FILE);

        let header = cryptor.new_header();
        let mut payload = cryptor
            .encrypt_header(&header)
            .map_err(|e| FsError::corrupted_file(backup_path.display().to_string(), e))?;
        let chunk = cryptor
            .encrypt_chunk(&header, 0, dir_id.as_str().as_bytes())
            .map_err(|e| FsError::corrupted_file(backup_path.display().to_string(), e))?;
        payload.extend_from_slice(&chunk);

        debug!(path = %backup_path.display(), "writing dir id backup");
        fs::write(&backup_path, payload)
            .map_err(|e| FsError::io(backup_path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use std::sync::Arc;

    fn store() -> DirIdStore {
        DirIdStore::new(16)
    }

    #[test]
    fn cache_roundtrip() {
        let store = store();
        let path = VaultPath::new("a/b");
        assert!(store.cached(&path).is_none());

        let id = DirId::generate();
        store.remember(&path, id.clone());
        assert_eq!(store.cached(&path), Some(id));
    }

    #[test]
    fn invalidate_subtree_drops_descendants_only() {
        let store = store();
        for p in ["a", "a/b", "a/b/c", "ab", "z"] {
            store.remember(&VaultPath::new(p), DirId::generate());
        }

        store.invalidate_subtree(&VaultPath::new("a"));

        assert!(store.cached(&VaultPath::new("a")).is_none());
        assert!(store.cached(&VaultPath::new("a/b")).is_none());
        assert!(store.cached(&VaultPath::new("a/b/c")).is_none());
        assert!(store.cached(&VaultPath::new("ab")).is_some(), "sibling survives");
        assert!(store.cached(&VaultPath::new("z")).is_some());
    }

    #[test]
    fn invalidate_root_clears_everything() {
        let store = store();
        store.remember(&VaultPath::new("a"), DirId::generate());
        store.remember(&VaultPath::new("b"), DirId::generate());
        store.invalidate_subtree(&VaultPath::root());
        assert!(store.cached(&VaultPath::new("a")).is_none());
        assert!(store.cached(&VaultPath::new("b")).is_none());
    }

    #[test]
    fn bounded_capacity_evicts() {
        let store = DirIdStore::new(2);
        store.remember(&VaultPath::new("a"), DirId::generate());
        store.remember(&VaultPath::new("b"), DirId::generate());
        store.remember(&VaultPath::new("c"), DirId::generate());
        let cached = ["a", "b", "c"]
            .iter()
            .filter(|p| store.cached(&VaultPath::new(**p)).is_some())
            .count();
        assert_eq!(cached, 2);
    }

    #[test]
    fn dir_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dir_file = dir.path().join("dir.c9r");
        let id = DirId::generate();

        DirIdStore::write_dir_file(&dir_file, &id).unwrap();
        assert_eq!(DirIdStore::read_dir_file(&dir_file).unwrap(), id);
    }

    #[test]
    fn empty_dir_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let dir_file = dir.path().join("dir.c9r");
        std::fs::write(&dir_file, b"").unwrap();
        assert!(matches!(
            DirIdStore::read_dir_file(&dir_file),
            Err(FsError::CorruptedDirectory { .. })
        ));
    }

    #[test]
    fn oversized_dir_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let dir_file = dir.path().join("dir.c9r");
        std::fs::write(&dir_file, vec![b'x'; 1001]).unwrap();
        assert!(matches!(
            DirIdStore::read_dir_file(&dir_file),
            Err(FsError::CorruptedDirectory { .. })
        ));
    }

    #[test]
    fn missing_dir_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirIdStore::read_dir_file(&dir.path().join("dir.c9r")),
            Err(FsError::Io { .. })
        ));
    }

    #[test]
    fn backup_is_written_and_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let cryptor = Cryptor::new(Arc::new(MasterKey::random()));
        let id = DirId::generate();

        DirIdStore::write_dir_id_backup(&cryptor, dir.path(), &id).unwrap();

        let raw = std::fs::read(dir.path().join("dirid.c9r")).unwrap();
        assert!(raw.len() > crate::crypto::HEADER_SIZE);
        // The raw id must not appear in the ciphertext.
        assert!(!raw.windows(36).any(|w| w == id.as_str().as_bytes()));
    }
}
