//! Open-file state and cleartext channels.
//!
//! An [`OpenCryptoFile`] owns everything one live ciphertext file needs: the
//! decrypted header, the authoritative cleartext size, the tracked mtime, the
//! read/write lock that linearizes channel operations, and the chunk cache.
//! While a file is open, its size in here supersedes anything derivable from
//! the ciphertext length on disk.
//!
//! Channels are thin positional views handed out by the registry; the last
//! channel to close flushes the file, fixes the host file length, and writes
//! the tracked mtime back.

use std::fs::{File, OpenOptions as HostOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, trace};

use crate::crypto::{CHUNK_PAYLOAD_SIZE, Cryptor, FileHeader, HEADER_SIZE};
use crate::vault::chunks::{
    Chunk, ChunkCache, PAYLOAD_LEN, chunk_count, chunk_offset, ciphertext_size, cleartext_size,
};
use crate::vault::filesystem::FsError;
use crate::vault::registry::OpenCryptoFiles;
use crate::vault::stats::CryptoFsStats;

/// State of one open ciphertext file, shared by all its channels.
#[derive(Debug)]
pub(crate) struct OpenCryptoFile {
    /// Ciphertext path; swapped atomically when the file is moved.
    current_path: Mutex<PathBuf>,
    /// Authoritative cleartext size while the file is open.
    size: AtomicU64,
    /// Tracked modification time, nanoseconds since the epoch.
    mtime_nanos: AtomicI64,
    /// Set once the file has been flushed out and released.
    finalized: AtomicBool,
    /// Linearizes reads against writes; writers are exclusive.
    rw: RwLock<()>,
    inner: Mutex<FileInner>,
    writable: bool,
}

/// Mutable file state guarded by [`OpenCryptoFile::inner`].
#[derive(Debug)]
struct FileInner {
    host: File,
    header: FileHeader,
    header_dirty: bool,
    /// The cleartext size changed since the last flush, so the host file
    /// length needs fixing.
    content_dirty: bool,
    chunks: ChunkCache,
    cryptor: Arc<Cryptor>,
    stats: Arc<CryptoFsStats>,
    /// Error-context copy of the path this file was opened under.
    opened_path: PathBuf,
    writable: bool,
}

impl OpenCryptoFile {
    /// Open (or create) the ciphertext file at `path` and initialize header
    /// and size.
    ///
    /// A zero-length host file is a brand-new file: a fresh header is
    /// generated and persisted on the next flush. An existing file shorter
    /// than the header is corrupted.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), create))]
    pub fn open(
        path: &Path,
        create: bool,
        writable: bool,
        chunk_cache_capacity: usize,
        cryptor: Arc<Cryptor>,
        stats: Arc<CryptoFsStats>,
    ) -> Result<Arc<Self>, FsError> {
        let mut host = HostOpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)
            .map_err(|e| FsError::io(path.display().to_string(), e))?;

        let host_len = host
            .metadata()
            .map_err(|e| FsError::io(path.display().to_string(), e))?
            .len();

        let (header, header_dirty, size) = if host_len == 0 {
            debug!("new file, generating header");
            (cryptor.new_header(), true, 0)
        } else {
            if host_len < HEADER_SIZE as u64 {
                return Err(FsError::CorruptedFile {
                    path: path.display().to_string(),
                    reason: format!("{host_len} bytes is shorter than the file header"),
                });
            }
            let mut encrypted_header = [0u8; HEADER_SIZE];
            host.seek(SeekFrom::Start(0))
                .and_then(|_| host.read_exact(&mut encrypted_header))
                .map_err(|e| FsError::io(path.display().to_string(), e))?;
            stats.add_bytes_read(HEADER_SIZE as u64);

            let header = cryptor
                .decrypt_header(&encrypted_header)
                .map_err(|e| FsError::corrupted_file(path.display().to_string(), e))?;
            let size = cleartext_size(host_len)
                .map_err(|e| FsError::corrupted_file(path.display().to_string(), e))?;
            (header, false, size)
        };

        let mtime = host
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or_else(SystemTime::now);

        Ok(Arc::new(OpenCryptoFile {
            current_path: Mutex::new(path.to_path_buf()),
            size: AtomicU64::new(size),
            mtime_nanos: AtomicI64::new(system_time_to_nanos(mtime)),
            finalized: AtomicBool::new(false),
            rw: RwLock::new(()),
            inner: Mutex::new(FileInner {
                host,
                header,
                header_dirty,
                content_dirty: false,
                chunks: ChunkCache::new(chunk_cache_capacity),
                cryptor,
                stats,
                opened_path: path.to_path_buf(),
                writable,
            }),
            writable,
        }))
    }

    /// Current cleartext size.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Tracked modification time.
    pub fn modified(&self) -> SystemTime {
        nanos_to_system_time(self.mtime_nanos.load(Ordering::Acquire))
    }

    /// The ciphertext path this file currently lives at.
    pub fn current_path(&self) -> PathBuf {
        self.current_path
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Swap the ciphertext path after a move. The host handle stays valid;
    /// only metadata changes.
    pub fn set_current_path(&self, path: PathBuf) {
        if let Ok(mut current) = self.current_path.lock() {
            *current = path;
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Read cleartext bytes at a position. Returns the number of bytes read;
    /// zero at or past end of file.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.check_live()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let _guard = self.rw.read().map_err(|_| FsError::poisoned())?;

        let size = self.size.load(Ordering::Acquire);
        if pos >= size {
            return Ok(0);
        }
        let end = size.min(pos + buf.len() as u64);

        let mut inner = self.inner.lock().map_err(|_| FsError::poisoned())?;
        let mut done = 0usize;
        let mut cursor = pos;
        while cursor < end {
            let chunk_number = cursor / PAYLOAD_LEN;
            let offset = (cursor % PAYLOAD_LEN) as usize;
            let want = ((end - cursor) as usize).min(CHUNK_PAYLOAD_SIZE - offset);

            let chunk = inner.chunk_mut(chunk_number, size)?;
            let available = chunk.data.len().saturating_sub(offset).min(want);
            if available == 0 {
                break;
            }
            buf[done..done + available].copy_from_slice(&chunk.data[offset..offset + available]);
            done += available;
            cursor += available as u64;
            if available < want {
                break;
            }
        }
        trace!(pos, requested = buf.len(), read = done, "read");
        Ok(done)
    }

    /// Write cleartext bytes at a position, extending the file as needed.
    /// A write past the current end zero-fills the gap with encrypted zero
    /// chunks.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize, FsError> {
        self.check_live()?;
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let _guard = self.rw.write().map_err(|_| FsError::poisoned())?;
        let mut inner = self.inner.lock().map_err(|_| FsError::poisoned())?;

        let old_size = self.size.load(Ordering::Acquire);
        if pos > old_size {
            inner.zero_fill(old_size, pos)?;
        }

        let end = pos + buf.len() as u64;
        let mut cursor = pos;
        let mut consumed = 0usize;
        while cursor < end {
            let chunk_number = cursor / PAYLOAD_LEN;
            let offset = (cursor % PAYLOAD_LEN) as usize;
            let take = ((end - cursor) as usize).min(CHUNK_PAYLOAD_SIZE - offset);

            if offset == 0 && take == CHUNK_PAYLOAD_SIZE {
                // Full chunk overwrite: no need to read and decrypt first.
                inner.insert_chunk(
                    chunk_number,
                    Chunk::dirty(buf[consumed..consumed + take].to_vec()),
                )?;
            } else {
                let chunk = inner.chunk_mut(chunk_number, old_size)?;
                if chunk.data.len() < offset + take {
                    chunk.data.resize(offset + take, 0);
                }
                chunk.data[offset..offset + take].copy_from_slice(&buf[consumed..consumed + take]);
                chunk.dirty = true;
            }
            cursor += take as u64;
            consumed += take;
        }

        if end > old_size {
            self.size.store(end, Ordering::Release);
        }
        inner.content_dirty = true;
        self.touch_mtime();
        trace!(pos, written = buf.len(), "write");
        Ok(buf.len())
    }

    /// Shrink the file to `new_size`; a no-op when `new_size` is not smaller
    /// than the current size.
    pub fn truncate(&self, new_size: u64) -> Result<(), FsError> {
        self.check_live()?;
        self.check_writable()?;
        let _guard = self.rw.write().map_err(|_| FsError::poisoned())?;
        let mut inner = self.inner.lock().map_err(|_| FsError::poisoned())?;

        let old_size = self.size.load(Ordering::Acquire);
        if new_size >= old_size {
            return Ok(());
        }

        let kept_chunks = chunk_count(new_size);
        inner.chunks.discard_from(kept_chunks);

        if new_size % PAYLOAD_LEN != 0 {
            let last = kept_chunks - 1;
            let keep = (new_size - last * PAYLOAD_LEN) as usize;
            let chunk = inner.chunk_mut(last, old_size)?;
            if chunk.data.len() > keep {
                chunk.data.truncate(keep);
                chunk.dirty = true;
            }
        }

        self.size.store(new_size, Ordering::Release);
        inner.content_dirty = true;
        self.touch_mtime();
        debug!(old_size, new_size, "truncated");
        Ok(())
    }

    /// Write out all dirty chunks, persist the header, and fix the host file
    /// length. Does not close the file.
    pub fn flush(&self) -> Result<(), FsError> {
        self.check_live()?;
        let _guard = self.rw.write().map_err(|_| FsError::poisoned())?;
        let size = self.size.load(Ordering::Acquire);
        let mut inner = self.inner.lock().map_err(|_| FsError::poisoned())?;
        inner.flush(size)
    }

    /// Final flush and metadata write-back. Idempotent; called by the
    /// registry when the last channel closes or the filesystem shuts down.
    pub fn finalize(&self) -> Result<(), FsError> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.rw.write().map_err(|_| FsError::poisoned())?;
        let size = self.size.load(Ordering::Acquire);
        let mut inner = self.inner.lock().map_err(|_| FsError::poisoned())?;
        inner.flush(size)?;
        if inner.writable {
            let mtime = nanos_to_system_time(self.mtime_nanos.load(Ordering::Acquire));
            inner
                .host
                .set_modified(mtime)
                .map_err(|e| FsError::io(inner.opened_path.display().to_string(), e))?;
        }
        debug!(size, "finalized open file");
        Ok(())
    }

    fn touch_mtime(&self) {
        self.mtime_nanos
            .store(system_time_to_nanos(SystemTime::now()), Ordering::Release);
    }

    fn check_live(&self) -> Result<(), FsError> {
        if self.is_finalized() {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), FsError> {
        if !self.writable {
            return Err(FsError::ReadOnlyFilesystem);
        }
        Ok(())
    }
}

impl FileInner {
    /// Get a chunk, loading and decrypting it on a cache miss.
    ///
    /// `file_size` is the cleartext size at the start of the current
    /// operation; it bounds how much ciphertext the chunk can validly
    /// occupy on disk.
    fn chunk_mut(&mut self, chunk_number: u64, file_size: u64) -> Result<&mut Chunk, FsError> {
        self.stats.add_chunk_cache_access();
        if !self.chunks.contains(chunk_number) {
            self.stats.add_chunk_cache_miss();
            let chunk = self.load_chunk(chunk_number, file_size)?;
            self.insert_chunk(chunk_number, chunk)?;
        }
        Ok(self
            .chunks
            .get_mut(chunk_number)
            .expect("chunk present after insert"))
    }

    /// Read and decrypt one chunk from the host.
    ///
    /// The read is bounded by the chunk's expected ciphertext extent for the
    /// given cleartext size: the host file may still carry stale bytes
    /// beyond it (its length is only fixed on flush), and those must never
    /// reach the cipher. A chunk past the logical end is simply empty.
    fn load_chunk(&mut self, chunk_number: u64, file_size: u64) -> Result<Chunk, FsError> {
        let expected_payload = if chunk_number >= chunk_count(file_size) {
            0
        } else {
            (file_size - chunk_number * PAYLOAD_LEN).min(PAYLOAD_LEN) as usize
        };
        if expected_payload == 0 {
            return Ok(Chunk::clean(Vec::new()));
        }

        let offset = chunk_offset(chunk_number);
        let expected_ciphertext = expected_payload + crate::crypto::CHUNK_OVERHEAD;
        let ciphertext = read_up_to(&mut self.host, offset, expected_ciphertext)
            .map_err(|e| FsError::io(self.opened_path.display().to_string(), e))?;

        if ciphertext.is_empty() {
            // Only ever existed in the cache; recreate it empty.
            return Ok(Chunk::clean(Vec::new()));
        }

        self.stats.add_bytes_read(ciphertext.len() as u64);
        let data = self
            .cryptor
            .decrypt_chunk(&self.header, chunk_number, &ciphertext)
            .map_err(|e| FsError::corrupted_file(self.opened_path.display().to_string(), e))?;
        self.stats.add_bytes_decrypted(data.len() as u64);
        trace!(chunk = chunk_number, bytes = data.len(), "loaded chunk");
        Ok(Chunk::clean(data))
    }

    /// Insert a chunk; a dirty chunk evicted to make room is written back
    /// synchronously at its canonical offset.
    fn insert_chunk(&mut self, chunk_number: u64, chunk: Chunk) -> Result<(), FsError> {
        if let Some((evicted_number, evicted)) = self.chunks.insert(chunk_number, chunk) {
            if evicted.dirty {
                trace!(chunk = evicted_number, "write-back of evicted dirty chunk");
                self.write_chunk(evicted_number, &evicted.data)?;
            }
        }
        Ok(())
    }

    /// Encrypt and write one chunk at its canonical ciphertext offset.
    fn write_chunk(&mut self, chunk_number: u64, data: &[u8]) -> Result<(), FsError> {
        let ciphertext = self
            .cryptor
            .encrypt_chunk(&self.header, chunk_number, data)
            .map_err(|e| FsError::Internal {
                reason: format!("chunk encryption failed: {e}"),
            })?;
        self.stats.add_bytes_encrypted(data.len() as u64);

        let offset = chunk_offset(chunk_number);
        self.host
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.host.write_all(&ciphertext))
            .map_err(|e| FsError::io(self.opened_path.display().to_string(), e))?;
        self.stats.add_bytes_written(ciphertext.len() as u64);
        Ok(())
    }

    /// Fill the cleartext range `[from, to)` with zeros. `from` is the file
    /// size before the fill.
    fn zero_fill(&mut self, from: u64, to: u64) -> Result<(), FsError> {
        let mut cursor = from;
        while cursor < to {
            let chunk_number = cursor / PAYLOAD_LEN;
            let offset = (cursor % PAYLOAD_LEN) as usize;
            let take = ((to - cursor) as usize).min(CHUNK_PAYLOAD_SIZE - offset);

            if offset == 0 && take == CHUNK_PAYLOAD_SIZE {
                self.insert_chunk(chunk_number, Chunk::dirty(vec![0u8; CHUNK_PAYLOAD_SIZE]))?;
            } else {
                let chunk = self.chunk_mut(chunk_number, from)?;
                if chunk.data.len() < offset + take {
                    chunk.data.resize(offset + take, 0);
                } else {
                    chunk.data[offset..offset + take].fill(0);
                }
                chunk.dirty = true;
            }
            cursor += take as u64;
        }
        Ok(())
    }

    /// Write out dirty state: chunks, header, then the exact host length.
    fn flush(&mut self, size: u64) -> Result<(), FsError> {
        if !self.writable {
            return Ok(());
        }
        for chunk_number in self.chunks.dirty_chunk_numbers() {
            let data = match self.chunks.get_mut(chunk_number) {
                Some(chunk) => chunk.data.clone(),
                None => continue,
            };
            self.write_chunk(chunk_number, &data)?;
            if let Some(chunk) = self.chunks.get_mut(chunk_number) {
                chunk.dirty = false;
            }
        }
        if self.header_dirty {
            let encrypted = self
                .cryptor
                .encrypt_header(&self.header)
                .map_err(|e| FsError::Internal {
                    reason: format!("header encryption failed: {e}"),
                })?;
            self.host
                .seek(SeekFrom::Start(0))
                .and_then(|_| self.host.write_all(&encrypted))
                .map_err(|e| FsError::io(self.opened_path.display().to_string(), e))?;
            self.stats.add_bytes_written(HEADER_SIZE as u64);
            self.header_dirty = false;
        }
        if self.content_dirty {
            self.host
                .set_len(ciphertext_size(size))
                .map_err(|e| FsError::io(self.opened_path.display().to_string(), e))?;
            self.content_dirty = false;
        }
        Ok(())
    }
}

/// A positional cleartext view of one open file.
///
/// Channels do not own a cursor; every operation names its offset. Dropping
/// a channel closes it best-effort; call [`close`](Self::close) to observe
/// flush errors.
#[derive(Debug)]
pub struct CleartextFileChannel {
    file: Arc<OpenCryptoFile>,
    registry: Arc<OpenCryptoFiles>,
    readable: bool,
    writable: bool,
    closed: bool,
}

impl CleartextFileChannel {
    pub(crate) fn new(
        file: Arc<OpenCryptoFile>,
        registry: Arc<OpenCryptoFiles>,
        readable: bool,
        writable: bool,
    ) -> Self {
        CleartextFileChannel {
            file,
            registry,
            readable,
            writable,
            closed: false,
        }
    }

    /// Read cleartext bytes at `pos`. Returns 0 at end of file.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.readable {
            return Err(FsError::io(
                self.file.current_path().display().to_string(),
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "channel not opened for reading",
                ),
            ));
        }
        self.file.read_at(pos, buf)
    }

    /// Write cleartext bytes at `pos`, extending the file as needed.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::io(
                self.file.current_path().display().to_string(),
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "channel not opened for writing",
                ),
            ));
        }
        self.file.write_at(pos, buf)
    }

    /// Shrink the file to `new_size`; no-op when not smaller.
    pub fn truncate(&self, new_size: u64) -> Result<(), FsError> {
        if !self.writable {
            return Err(FsError::io(
                self.file.current_path().display().to_string(),
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "channel not opened for writing",
                ),
            ));
        }
        self.file.truncate(new_size)
    }

    /// Current cleartext size.
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Flush dirty chunks and the header without closing.
    pub fn flush(&self) -> Result<(), FsError> {
        self.file.flush()
    }

    /// Close this channel. The last channel on a file flushes it and writes
    /// final size and mtime back to the host.
    pub fn close(mut self) -> Result<(), FsError> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.registry.release(&self.file)
    }
}

impl Drop for CleartextFileChannel {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

fn system_time_to_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn nanos_to_system_time(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

/// Read up to `len` bytes at `offset`, stopping early at end of file.
fn read_up_to(host: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    host.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = host.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
