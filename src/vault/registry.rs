//! Registry of open files.
//!
//! Maps each live ciphertext path to its single [`OpenCryptoFile`]. The
//! whole registry is serialized behind one lock: `get_or_create`, channel
//! release, and path re-keying on move are atomic with respect to one
//! another, so racing opens of the same path always land on the same
//! instance and a close can never evict a file that a concurrent open just
//! acquired.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::crypto::Cryptor;
use crate::vault::filesystem::FsError;
use crate::vault::open_file::OpenCryptoFile;
use crate::vault::stats::CryptoFsStats;

#[derive(Debug)]
struct Entry {
    file: Arc<OpenCryptoFile>,
    /// Number of live channels on this file.
    channels: usize,
}

/// Process-wide map of ciphertext path → open file.
#[derive(Debug)]
pub(crate) struct OpenCryptoFiles {
    entries: Mutex<HashMap<PathBuf, Entry>>,
    cryptor: Arc<Cryptor>,
    stats: Arc<CryptoFsStats>,
    chunk_cache_capacity: usize,
}

impl OpenCryptoFiles {
    pub fn new(
        cryptor: Arc<Cryptor>,
        stats: Arc<CryptoFsStats>,
        chunk_cache_capacity: usize,
    ) -> Self {
        OpenCryptoFiles {
            entries: Mutex::new(HashMap::new()),
            cryptor,
            stats,
            chunk_cache_capacity,
        }
    }

    /// Get the open file for a ciphertext path, opening it if necessary, and
    /// account for one new channel.
    ///
    /// Linearizable: concurrent callers for the same path receive the same
    /// instance.
    pub fn get_or_create(
        &self,
        path: &Path,
        create: bool,
        writable: bool,
    ) -> Result<Arc<OpenCryptoFile>, FsError> {
        let mut entries = self.entries.lock().map_err(|_| FsError::poisoned())?;
        if let Some(entry) = entries.get_mut(path) {
            entry.channels += 1;
            return Ok(Arc::clone(&entry.file));
        }

        let file = OpenCryptoFile::open(
            path,
            create,
            writable,
            self.chunk_cache_capacity,
            Arc::clone(&self.cryptor),
            Arc::clone(&self.stats),
        )?;
        entries.insert(
            path.to_path_buf(),
            Entry {
                file: Arc::clone(&file),
                channels: 1,
            },
        );
        debug!(path = %path.display(), "opened ciphertext file");
        Ok(file)
    }

    /// Look up an open file without accounting for a channel. Used by the
    /// attributes view, where the open file's size supersedes the ciphertext
    /// length.
    pub fn find(&self, path: &Path) -> Option<Arc<OpenCryptoFile>> {
        let entries = self.entries.lock().ok()?;
        entries.get(path).map(|e| Arc::clone(&e.file))
    }

    /// Release one channel; the last release flushes and drops the entry.
    ///
    /// The registry lock is held across finalization so a racing
    /// `get_or_create` on the same path cannot observe a half-closed file.
    pub fn release(&self, file: &Arc<OpenCryptoFile>) -> Result<(), FsError> {
        let mut entries = self.entries.lock().map_err(|_| FsError::poisoned())?;
        let key = file.current_path();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.channels -= 1;
                if entry.channels == 0 {
                    entries.remove(&key);
                    debug!(path = %key.display(), "last channel closed, finalizing");
                    file.finalize()?;
                }
                Ok(())
            }
            None => {
                // The filesystem was closed underneath this channel; the
                // file has already been finalized.
                file.finalize()
            }
        }
    }

    /// Atomically re-key an open file when its ciphertext path changes.
    /// Fails if another open file already occupies the destination.
    pub fn prepare_move(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        let mut entries = self.entries.lock().map_err(|_| FsError::poisoned())?;
        if entries.contains_key(dst) {
            return Err(FsError::AlreadyExists {
                path: dst.display().to_string(),
            });
        }
        if let Some(entry) = entries.remove(src) {
            entry.file.set_current_path(dst.to_path_buf());
            entries.insert(dst.to_path_buf(), entry);
            debug!(src = %src.display(), dst = %dst.display(), "re-keyed open file");
        }
        Ok(())
    }

    /// Number of currently open files.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Finalize every open file. Used on filesystem close; channels that are
    /// still alive afterwards fail with a closed error.
    pub fn close_all(&self) -> Result<(), FsError> {
        let mut entries = self.entries.lock().map_err(|_| FsError::poisoned())?;
        let mut first_error = None;
        for (path, entry) in entries.drain() {
            if let Err(e) = entry.file.finalize() {
                warn!(path = %path.display(), error = %e, "failed to finalize open file");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
