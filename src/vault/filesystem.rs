//! The encrypting filesystem facade.
//!
//! [`CryptoFileSystem`] ties the subsystems together: the path translator,
//! the directory ID store, the open-file registry, and the stats collector.
//! Applications address everything by cleartext path; nothing below this
//! module ever sees one.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{Cryptor, MasterkeyLoader};
use crate::fs::name::{
    self, CONTENTS_FILE, DIR_ID_BACKUP_FILE, DIR_MARKER, EntryFormat, NAME_FILE, SYMLINK_MARKER,
};
use crate::fs::symlink;
use crate::vault::chunks::{self, DEFAULT_CHUNK_CACHE_CAPACITY};
use crate::vault::dir_id::{DEFAULT_DIR_ID_CACHE_CAPACITY, DirIdStore};
use crate::vault::mapper::{CiphertextNode, CryptoPathMapper, NodeKind};
use crate::vault::open_file::CleartextFileChannel;
use crate::vault::path::{DirId, VaultPath};
use crate::vault::registry::OpenCryptoFiles;
use crate::vault::stats::CryptoFsStats;

/// Errors surfaced by filesystem operations.
///
/// Authentication failures from the cipher layer are never recovered; they
/// surface as [`CorruptedFile`](FsError::CorruptedFile) or
/// [`CorruptedDirectory`](FsError::CorruptedDirectory). Host I/O errors pass
/// through with path context.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("corrupted file at {path}: {reason}")]
    CorruptedFile { path: String, reason: String },

    #[error("corrupted directory at {path}: {reason}")]
    CorruptedDirectory { path: String, reason: String },

    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    #[error("filesystem is closed")]
    Closed,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl FsError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted_file(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FsError::CorruptedFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn poisoned() -> Self {
        FsError::Internal {
            reason: "lock poisoned by a panicked thread".to_string(),
        }
    }
}

/// Configuration of one mounted filesystem.
#[derive(Debug, Clone)]
pub struct CryptoFsOptions {
    /// Ciphertext names longer than this are stored in shortened form.
    pub shortening_threshold: usize,
    /// Hard cap on cleartext filename length, in characters. `None` leaves
    /// length handling entirely to the shortening machinery.
    pub max_cleartext_name_length: Option<usize>,
    /// Decrypted chunks cached per open file.
    pub chunk_cache_capacity: usize,
    /// Cached cleartext-path → DirId mappings.
    pub dir_id_cache_capacity: usize,
    /// Reject every mutating operation.
    pub readonly: bool,
}

impl Default for CryptoFsOptions {
    fn default() -> Self {
        CryptoFsOptions {
            shortening_threshold: name::DEFAULT_SHORTENING_THRESHOLD,
            max_cleartext_name_length: None,
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
            dir_id_cache_capacity: DEFAULT_DIR_ID_CACHE_CAPACITY,
            readonly: false,
        }
    }
}

impl CryptoFsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shortening_threshold(mut self, threshold: usize) -> Self {
        self.shortening_threshold = threshold;
        self
    }

    pub fn max_cleartext_name_length(mut self, limit: usize) -> Self {
        self.max_cleartext_name_length = Some(limit);
        self
    }

    pub fn chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.chunk_cache_capacity = capacity;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

/// How to open a file. Positional channels have no append mode; writers
/// name their offsets.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read: true,
            write: false,
            create: false,
            create_new: false,
            truncate: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    fn wants_write(self) -> bool {
        self.write || self.create || self.create_new || self.truncate
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Cleartext attributes of a vault node.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub kind: NodeKind,
    /// Cleartext size. Directories report 0; symlinks report the target
    /// length.
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// An encrypting virtual filesystem over a host-backed vault.
///
/// All operations take cleartext paths with `/` separators. The instance is
/// `Send + Sync`; share it via `Arc` and call from any thread.
pub struct CryptoFileSystem {
    cryptor: Arc<Cryptor>,
    mapper: CryptoPathMapper,
    open_files: Arc<OpenCryptoFiles>,
    stats: Arc<CryptoFsStats>,
    options: CryptoFsOptions,
    open: AtomicBool,
}

impl std::fmt::Debug for CryptoFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoFileSystem")
            .field("options", &self.options)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CryptoFileSystem {
    /// Open a vault rooted at `vault_root`.
    ///
    /// The masterkey comes from the injected loader. On a writable mount the
    /// root storage directory is created if absent, so a fresh empty vault
    /// is usable immediately.
    #[instrument(level = "info", skip_all, fields(vault_root = %vault_root.as_ref().display()))]
    pub fn open(
        vault_root: impl AsRef<Path>,
        loader: &dyn MasterkeyLoader,
        options: CryptoFsOptions,
    ) -> Result<Self, FsError> {
        let master_key = loader.load_masterkey().map_err(|e| FsError::Internal {
            reason: format!("masterkey loading failed: {e}"),
        })?;
        let cryptor = Arc::new(Cryptor::new(Arc::new(master_key)));
        let stats = Arc::new(CryptoFsStats::new());
        let dir_ids = Arc::new(DirIdStore::new(options.dir_id_cache_capacity));
        let mapper = CryptoPathMapper::new(
            Arc::clone(&cryptor),
            Arc::clone(&dir_ids),
            vault_root.as_ref().to_path_buf(),
            options.shortening_threshold,
        );

        let root_storage = mapper.storage_dir(&DirId::root())?;
        if options.readonly {
            if !root_storage.is_dir() {
                return Err(FsError::CorruptedDirectory {
                    path: root_storage.display().to_string(),
                    reason: "root storage directory is missing".to_string(),
                });
            }
        } else {
            fs::create_dir_all(&root_storage)
                .map_err(|e| FsError::io(root_storage.display().to_string(), e))?;
        }

        info!(readonly = options.readonly, "filesystem opened");
        Ok(CryptoFileSystem {
            open_files: Arc::new(OpenCryptoFiles::new(
                Arc::clone(&cryptor),
                Arc::clone(&stats),
                options.chunk_cache_capacity,
            )),
            cryptor,
            mapper,
            stats,
            options,
            open: AtomicBool::new(true),
        })
    }

    /// The statistics collector of this filesystem instance.
    pub fn stats(&self) -> &CryptoFsStats {
        &self.stats
    }

    /// Number of currently open files.
    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    /// Close the filesystem: flush and release every open file. New
    /// operations are rejected afterwards. Idempotent.
    pub fn close(&self) -> Result<(), FsError> {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("closing filesystem");
            self.open_files.close_all()?;
        }
        Ok(())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Open a cleartext channel on a file.
    #[instrument(level = "debug", skip(self))]
    pub fn open_file(
        &self,
        path: &str,
        options: OpenOptions,
    ) -> Result<CleartextFileChannel, FsError> {
        self.check_open()?;
        if options.wants_write() {
            self.check_writable()?;
        }
        let vpath = VaultPath::new(path);

        let (content_path, create) = match self.mapper.resolve(&vpath)? {
            Some(node) => match node.kind {
                NodeKind::File => {
                    if options.create_new {
                        return Err(FsError::AlreadyExists {
                            path: vpath.to_string(),
                        });
                    }
                    (node.content_path, false)
                }
                NodeKind::Directory => {
                    return Err(FsError::IsADirectory {
                        path: vpath.to_string(),
                    });
                }
                NodeKind::Symlink => {
                    return Err(FsError::io(
                        vpath.to_string(),
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "symlinks cannot be opened as regular files",
                        ),
                    ));
                }
            },
            None => {
                if !options.create && !options.create_new {
                    return Err(FsError::NotFound {
                        path: vpath.to_string(),
                    });
                }
                let parent = self.mapper.resolve_parent(&vpath)?;
                self.validate_name(&parent.child_name)?;
                let cname = self.mapper.ciphertext_name(&parent.child_name, &parent.dir_id)?;
                let entry_path = parent.storage_dir.join(&cname.disk_name);
                let content_path = if cname.shortened {
                    fs::create_dir_all(&entry_path)
                        .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
                    fs::write(entry_path.join(NAME_FILE), &cname.full_name)
                        .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
                    entry_path.join(CONTENTS_FILE)
                } else {
                    entry_path
                };
                (content_path, true)
            }
        };

        let file =
            self.open_files
                .get_or_create(&content_path, create, !self.options.readonly)?;
        if options.truncate && file.size() > 0 {
            if let Err(e) = file.truncate(0) {
                let _ = self.open_files.release(&file);
                return Err(e);
            }
        }
        Ok(CleartextFileChannel::new(
            file,
            Arc::clone(&self.open_files),
            options.read,
            options.write,
        ))
    }

    /// Convenience: write a whole file, creating or replacing it.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let channel = self.open_file(
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        channel.write_at(0, data)?;
        channel.close()
    }

    /// Convenience: read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let channel = self.open_file(path, OpenOptions::new())?;
        let size = channel.size();
        let mut data = vec![
            0u8;
            usize::try_from(size).map_err(|_| FsError::Internal {
                reason: format!("file of {size} bytes does not fit in memory"),
            })?
        ];
        let mut filled = 0usize;
        while filled < data.len() {
            let n = channel.read_at(filled as u64, &mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        channel.close()?;
        Ok(data)
    }

    /// Delete a file or symlink.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_file(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let vpath = VaultPath::new(path);
        let node = self.require(&vpath)?;
        match node.kind {
            NodeKind::Directory => Err(FsError::IsADirectory {
                path: vpath.to_string(),
            }),
            NodeKind::File if !node.shortened => fs::remove_file(&node.entry_path)
                .map_err(|e| FsError::io(node.entry_path.display().to_string(), e)),
            // Shortened files, and symlinks of either form, live in wrapper
            // directories together with their sidecars.
            NodeKind::File | NodeKind::Symlink => fs::remove_dir_all(&node.entry_path)
                .map_err(|e| FsError::io(node.entry_path.display().to_string(), e)),
        }
    }

    /// Copy file contents across the crypto boundary.
    ///
    /// Always a content copy through cleartext channels: the destination
    /// gets its own header and nonces, never the source's ciphertext.
    #[instrument(level = "debug", skip(self))]
    pub fn copy_file(&self, src: &str, dst: &str, replace_existing: bool) -> Result<(), FsError> {
        self.check_writable()?;
        if VaultPath::new(src) == VaultPath::new(dst) {
            return Ok(());
        }

        let reader = self.open_file(src, OpenOptions::new())?;
        let mut dst_options = OpenOptions::new().write(true).create(true).truncate(true);
        if !replace_existing {
            dst_options = dst_options.create_new(true);
        }
        let writer = self.open_file(dst, dst_options)?;

        let mut buf = vec![0u8; crate::crypto::CHUNK_PAYLOAD_SIZE];
        let mut pos = 0u64;
        loop {
            let n = reader.read_at(pos, &mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_at(pos, &buf[..n])?;
            pos += n as u64;
        }
        writer.close()?;
        reader.close()
    }

    // ========================================================================
    // Directories
    // ========================================================================

    /// Create a directory.
    #[instrument(level = "debug", skip(self))]
    pub fn create_directory(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let vpath = VaultPath::new(path);
        if self.mapper.resolve(&vpath)?.is_some() {
            return Err(FsError::AlreadyExists {
                path: vpath.to_string(),
            });
        }
        let parent = self.mapper.resolve_parent(&vpath)?;
        self.validate_name(&parent.child_name)?;
        let cname = self.mapper.ciphertext_name(&parent.child_name, &parent.dir_id)?;

        let dir_id = DirId::generate();
        let storage = self.mapper.storage_dir(&dir_id)?;

        // Content dir first: a dir.c9r must never point at a missing storage
        // directory. A stray storage dir after a crash is ignorable.
        fs::create_dir_all(&storage).map_err(|e| FsError::io(storage.display().to_string(), e))?;

        let entry_path = parent.storage_dir.join(&cname.disk_name);
        fs::create_dir_all(&entry_path)
            .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
        if cname.shortened {
            fs::write(entry_path.join(NAME_FILE), &cname.full_name)
                .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
        }
        DirIdStore::write_dir_file(&entry_path.join(DIR_MARKER), &dir_id)?;
        DirIdStore::write_dir_id_backup(&self.cryptor, &storage, &dir_id)?;

        self.mapper.dir_ids().remember(&vpath, dir_id);
        debug!(path = %vpath, "created directory");
        Ok(())
    }

    /// Delete an empty directory.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_directory(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let vpath = VaultPath::new(path);
        if vpath.is_root() {
            return Err(FsError::io(
                vpath.to_string(),
                io::Error::new(io::ErrorKind::InvalidInput, "cannot remove the root directory"),
            ));
        }
        let node = self.require(&vpath)?;
        let NodeKind::Directory = node.kind else {
            return Err(FsError::NotADirectory {
                path: vpath.to_string(),
            });
        };
        let storage = node
            .dir_storage
            .as_ref()
            .ok_or_else(FsError::poisoned)?;

        if !self.storage_dir_is_empty(storage)? {
            return Err(FsError::NotEmpty {
                path: vpath.to_string(),
            });
        }

        // Deletion order matters: dir.c9r first, so a partial failure leaves
        // an ignorable stray storage dir rather than a marker pointing into
        // the void.
        fs::remove_file(&node.content_path)
            .map_err(|e| FsError::io(node.content_path.display().to_string(), e))?;
        fs::remove_dir_all(storage).map_err(|e| FsError::io(storage.display().to_string(), e))?;
        fs::remove_dir_all(&node.entry_path)
            .map_err(|e| FsError::io(node.entry_path.display().to_string(), e))?;

        self.mapper.dir_ids().invalidate_subtree(&vpath);
        debug!(path = %vpath, "removed directory");
        Ok(())
    }

    /// List a directory's entries with decrypted names.
    ///
    /// Entries whose names fail to decrypt are logged and skipped rather
    /// than failing the whole listing.
    #[instrument(level = "debug", skip(self))]
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.check_open()?;
        let vpath = VaultPath::new(path);
        let node = self.require(&vpath)?;
        let NodeKind::Directory = node.kind else {
            return Err(FsError::NotADirectory {
                path: vpath.to_string(),
            });
        };
        let dir_id = node.dir_id.as_ref().ok_or_else(FsError::poisoned)?;
        let storage = node.dir_storage.as_ref().ok_or_else(FsError::poisoned)?;

        let mut entries = Vec::new();
        let read_dir =
            fs::read_dir(storage).map_err(|e| FsError::io(storage.display().to_string(), e))?;
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| FsError::io(storage.display().to_string(), e))?;
            let file_name = dirent.file_name();
            let Some(disk_name) = file_name.to_str() else {
                warn!(entry = ?file_name, "skipping non-UTF-8 vault entry");
                continue;
            };
            if disk_name == DIR_ID_BACKUP_FILE {
                continue;
            }
            let Some((format, _)) = name::classify_entry(disk_name) else {
                continue;
            };
            let entry_path = dirent.path();

            let full_name = match format {
                EntryFormat::Regular => disk_name.to_string(),
                EntryFormat::Shortened => {
                    match fs::read_to_string(entry_path.join(NAME_FILE)) {
                        Ok(n) => n.trim_end().to_string(),
                        Err(e) => {
                            warn!(entry = %entry_path.display(), error = %e, "shortened entry without readable name sidecar");
                            continue;
                        }
                    }
                }
            };

            let kind = if entry_path.is_file() {
                NodeKind::File
            } else if entry_path.join(DIR_MARKER).is_file() {
                NodeKind::Directory
            } else if entry_path.join(SYMLINK_MARKER).is_file() {
                NodeKind::Symlink
            } else if entry_path.join(CONTENTS_FILE).is_file() {
                NodeKind::File
            } else {
                warn!(entry = %entry_path.display(), "skipping entry without recognizable marker");
                continue;
            };

            match self.cryptor.decrypt_name(&full_name, dir_id.as_str()) {
                Ok(cleartext) => entries.push(DirEntry {
                    name: cleartext,
                    kind,
                }),
                Err(e) => {
                    warn!(entry = %entry_path.display(), error = %e, "skipping undecryptable entry name");
                }
            }
        }
        Ok(entries)
    }

    // ========================================================================
    // Moves
    // ========================================================================

    /// Rename or move a node. Source and destination kinds must match; with
    /// `replace_existing` an existing file target is deleted first and an
    /// existing directory target must be empty.
    ///
    /// Moving onto an existing symlink is not supported and fails with
    /// already-exists.
    #[instrument(level = "debug", skip(self))]
    pub fn rename(&self, src: &str, dst: &str, replace_existing: bool) -> Result<(), FsError> {
        self.check_writable()?;
        let src_path = VaultPath::new(src);
        let dst_path = VaultPath::new(dst);
        if src_path == dst_path {
            return Ok(());
        }
        if src_path.is_root() {
            return Err(FsError::io(
                src_path.to_string(),
                io::Error::new(io::ErrorKind::InvalidInput, "cannot move the root directory"),
            ));
        }
        if dst_path.starts_with(&src_path) {
            return Err(FsError::io(
                dst_path.to_string(),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot move a node into its own subtree",
                ),
            ));
        }

        let src_node = self.require(&src_path)?;

        if let Some(dst_node) = self.mapper.resolve(&dst_path)? {
            if !replace_existing {
                return Err(FsError::AlreadyExists {
                    path: dst_path.to_string(),
                });
            }
            match (src_node.kind, dst_node.kind) {
                // Replacement-move onto a symlink is deliberately
                // unsupported; the semantics are not defined for this vault
                // format.
                (_, NodeKind::Symlink) | (NodeKind::Symlink, _) => {
                    return Err(FsError::AlreadyExists {
                        path: dst_path.to_string(),
                    });
                }
                (NodeKind::File, NodeKind::File) => self.remove_file(dst)?,
                (NodeKind::Directory, NodeKind::Directory) => self.remove_directory(dst)?,
                (NodeKind::File, NodeKind::Directory) => {
                    return Err(FsError::IsADirectory {
                        path: dst_path.to_string(),
                    });
                }
                (NodeKind::Directory, NodeKind::File) => {
                    return Err(FsError::NotADirectory {
                        path: dst_path.to_string(),
                    });
                }
            }
        }

        let dst_parent = self.mapper.resolve_parent(&dst_path)?;
        self.validate_name(&dst_parent.child_name)?;
        let dst_cname = self
            .mapper
            .ciphertext_name(&dst_parent.child_name, &dst_parent.dir_id)?;
        let dst_entry = dst_parent.storage_dir.join(&dst_cname.disk_name);

        match src_node.kind {
            NodeKind::File => {
                self.move_file_entry(&src_node, &dst_entry, &dst_cname.full_name, dst_cname.shortened)?;
            }
            NodeKind::Directory | NodeKind::Symlink => {
                // Entry wrappers move wholesale; directory contents are
                // addressed by DirId and stay put.
                fs::rename(&src_node.entry_path, &dst_entry)
                    .map_err(|e| FsError::io(dst_entry.display().to_string(), e))?;
                self.fix_name_sidecar(&dst_entry, &dst_cname.full_name, dst_cname.shortened)?;
            }
        }

        self.mapper.dir_ids().invalidate_subtree(&src_path);
        self.mapper.dir_ids().invalidate_subtree(&dst_path);
        debug!(src = %src_path, dst = %dst_path, "renamed");
        Ok(())
    }

    /// Move a regular-file entry between its four on-disk shapes
    /// (plain ↔ shortened), re-keying any open file.
    fn move_file_entry(
        &self,
        src_node: &CiphertextNode,
        dst_entry: &Path,
        dst_full_name: &str,
        dst_shortened: bool,
    ) -> Result<(), FsError> {
        let dst_content = if dst_shortened {
            dst_entry.join(CONTENTS_FILE)
        } else {
            dst_entry.to_path_buf()
        };

        self.open_files
            .prepare_move(&src_node.content_path, &dst_content)?;

        let result: Result<(), FsError> = (|| {
            if dst_shortened {
                fs::create_dir_all(dst_entry)
                    .map_err(|e| FsError::io(dst_entry.display().to_string(), e))?;
                fs::write(dst_entry.join(NAME_FILE), dst_full_name)
                    .map_err(|e| FsError::io(dst_entry.display().to_string(), e))?;
            }
            fs::rename(&src_node.content_path, &dst_content)
                .map_err(|e| FsError::io(dst_content.display().to_string(), e))?;
            if src_node.shortened {
                fs::remove_dir_all(&src_node.entry_path)
                    .map_err(|e| FsError::io(src_node.entry_path.display().to_string(), e))?;
            }
            Ok(())
        })();

        if result.is_err() {
            // Roll the registry key back; the host rename did not happen.
            let _ = self
                .open_files
                .prepare_move(&dst_content, &src_node.content_path);
        }
        result
    }

    /// After moving a wrapper entry, make its `name.c9s` sidecar match the
    /// destination shape.
    fn fix_name_sidecar(
        &self,
        entry: &Path,
        full_name: &str,
        shortened: bool,
    ) -> Result<(), FsError> {
        let sidecar = entry.join(NAME_FILE);
        if shortened {
            fs::write(&sidecar, full_name)
                .map_err(|e| FsError::io(sidecar.display().to_string(), e))
        } else {
            match fs::remove_file(&sidecar) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(FsError::io(sidecar.display().to_string(), e)),
            }
        }
    }

    // ========================================================================
    // Symlinks
    // ========================================================================

    /// Create a symlink whose payload is the cleartext target path. The
    /// target is stored opaquely; it is not resolved or validated.
    #[instrument(level = "debug", skip(self))]
    pub fn create_symlink(&self, path: &str, target: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let vpath = VaultPath::new(path);
        if self.mapper.resolve(&vpath)?.is_some() {
            return Err(FsError::AlreadyExists {
                path: vpath.to_string(),
            });
        }
        let parent = self.mapper.resolve_parent(&vpath)?;
        self.validate_name(&parent.child_name)?;
        let cname = self.mapper.ciphertext_name(&parent.child_name, &parent.dir_id)?;

        let entry_path = parent.storage_dir.join(&cname.disk_name);
        fs::create_dir_all(&entry_path)
            .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
        if cname.shortened {
            fs::write(entry_path.join(NAME_FILE), &cname.full_name)
                .map_err(|e| FsError::io(entry_path.display().to_string(), e))?;
        }

        let payload = symlink::encrypt_symlink_target(&self.cryptor, target)
            .map_err(|e| FsError::Internal {
                reason: format!("symlink target encryption failed: {e}"),
            })?;
        let marker = entry_path.join(SYMLINK_MARKER);
        fs::write(&marker, payload).map_err(|e| FsError::io(marker.display().to_string(), e))
    }

    /// Read a symlink's cleartext target.
    #[instrument(level = "debug", skip(self))]
    pub fn read_symlink(&self, path: &str) -> Result<String, FsError> {
        self.check_open()?;
        let vpath = VaultPath::new(path);
        let node = self.require(&vpath)?;
        let NodeKind::Symlink = node.kind else {
            return Err(FsError::io(
                vpath.to_string(),
                io::Error::new(io::ErrorKind::InvalidInput, "not a symlink"),
            ));
        };
        let encrypted = fs::read(&node.content_path)
            .map_err(|e| FsError::io(node.content_path.display().to_string(), e))?;
        symlink::decrypt_symlink_target(&self.cryptor, &encrypted)
            .map_err(|e| FsError::corrupted_file(node.content_path.display().to_string(), e))
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Cleartext attributes of a node.
    ///
    /// For an open file the registry's authoritative size and tracked mtime
    /// win over anything derivable from the ciphertext.
    #[instrument(level = "debug", skip(self))]
    pub fn attributes(&self, path: &str) -> Result<FileAttributes, FsError> {
        self.check_open()?;
        let vpath = VaultPath::new(path);
        let node = self.require(&vpath)?;

        match node.kind {
            NodeKind::Directory => {
                let storage = node.dir_storage.as_ref().ok_or_else(FsError::poisoned)?;
                let modified = fs::metadata(storage).and_then(|m| m.modified()).ok();
                Ok(FileAttributes {
                    kind: NodeKind::Directory,
                    size: 0,
                    modified,
                })
            }
            NodeKind::Symlink => {
                let target = self.read_symlink(path)?;
                let modified = fs::metadata(&node.content_path)
                    .and_then(|m| m.modified())
                    .ok();
                Ok(FileAttributes {
                    kind: NodeKind::Symlink,
                    size: target.len() as u64,
                    modified,
                })
            }
            NodeKind::File => {
                if let Some(open) = self.open_files.find(&node.content_path) {
                    return Ok(FileAttributes {
                        kind: NodeKind::File,
                        size: open.size(),
                        modified: Some(open.modified()),
                    });
                }
                let metadata = fs::metadata(&node.content_path)
                    .map_err(|e| FsError::io(node.content_path.display().to_string(), e))?;
                let size = chunks::cleartext_size(metadata.len())
                    .map_err(|e| FsError::corrupted_file(node.content_path.display().to_string(), e))?;
                Ok(FileAttributes {
                    kind: NodeKind::File,
                    size,
                    modified: metadata.modified().ok(),
                })
            }
        }
    }

    /// Whether a node exists at the given path.
    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.check_open()?;
        Ok(self.mapper.resolve(&VaultPath::new(path))?.is_some())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require(&self, path: &VaultPath) -> Result<CiphertextNode, FsError> {
        self.mapper
            .resolve(path)?
            .ok_or_else(|| FsError::NotFound {
                path: path.to_string(),
            })
    }

    fn validate_name(&self, child_name: &str) -> Result<(), FsError> {
        name::validate_cleartext_name(child_name, self.options.max_cleartext_name_length).map_err(
            |e| FsError::InvalidName {
                name: child_name.to_string(),
                reason: e.to_string(),
            },
        )
    }

    /// A directory counts as empty when its storage dir holds nothing but
    /// the `dirid.c9r` backup.
    fn storage_dir_is_empty(&self, storage: &Path) -> Result<bool, FsError> {
        let read_dir =
            fs::read_dir(storage).map_err(|e| FsError::io(storage.display().to_string(), e))?;
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| FsError::io(storage.display().to_string(), e))?;
            if dirent.file_name() != DIR_ID_BACKUP_FILE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_open(&self) -> Result<(), FsError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), FsError> {
        self.check_open()?;
        if self.options.readonly {
            return Err(FsError::ReadOnlyFilesystem);
        }
        Ok(())
    }
}

impl Drop for CryptoFileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing filesystem on drop");
        }
    }
}
