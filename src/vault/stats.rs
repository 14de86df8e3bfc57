//! Filesystem statistics: lock-free counters with destructive polls.
//!
//! Counters are sharded across cache-line-padded atomics so concurrent I/O
//! threads do not contend on a single hot line. `poll()` swaps every shard
//! to zero and returns the sum; each increment is observed by exactly one
//! poll, so the total over all polls equals the total of all increments.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SHARD_COUNT: usize = 8;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
}

#[repr(align(64))]
#[derive(Debug)]
struct Shard(AtomicU64);

/// A monotonic counter with poll-and-reset semantics.
#[derive(Debug)]
pub struct Counter {
    shards: [Shard; SHARD_COUNT],
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Shard(AtomicU64::new(0))),
        }
    }

    /// Add to the counter. Lock-free; each thread sticks to one shard.
    #[inline]
    pub fn add(&self, n: u64) {
        let shard = SHARD.with(|s| *s);
        self.shards[shard].0.fetch_add(n, Ordering::Relaxed);
    }

    /// Return the accumulated value and reset it to zero.
    pub fn poll(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.0.swap(0, Ordering::SeqCst))
            .sum()
    }

    /// Read the accumulated value without resetting. Test and debug aid.
    pub fn peek(&self) -> u64 {
        self.shards.iter().map(|s| s.0.load(Ordering::SeqCst)).sum()
    }
}

/// Process-wide statistics of one filesystem instance.
///
/// Raw ciphertext bytes moved to and from the host count as read/written;
/// cleartext bytes fed through the cipher count as encrypted/decrypted.
#[derive(Debug, Default)]
pub struct CryptoFsStats {
    bytes_read: Counter,
    bytes_written: Counter,
    bytes_encrypted: Counter,
    bytes_decrypted: Counter,
    chunk_cache_accesses: Counter,
    chunk_cache_misses: Counter,
}

impl CryptoFsStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_encrypted(&self, n: u64) {
        self.bytes_encrypted.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_decrypted(&self, n: u64) {
        self.bytes_decrypted.add(n);
    }

    #[inline]
    pub(crate) fn add_chunk_cache_access(&self) {
        self.chunk_cache_accesses.add(1);
    }

    #[inline]
    pub(crate) fn add_chunk_cache_miss(&self) {
        self.chunk_cache_misses.add(1);
    }

    /// Ciphertext bytes read from the host since the last poll.
    pub fn poll_bytes_read(&self) -> u64 {
        self.bytes_read.poll()
    }

    /// Ciphertext bytes written to the host since the last poll.
    pub fn poll_bytes_written(&self) -> u64 {
        self.bytes_written.poll()
    }

    /// Cleartext bytes encrypted since the last poll.
    pub fn poll_bytes_encrypted(&self) -> u64 {
        self.bytes_encrypted.poll()
    }

    /// Cleartext bytes decrypted since the last poll.
    pub fn poll_bytes_decrypted(&self) -> u64 {
        self.bytes_decrypted.poll()
    }

    /// Chunk cache lookups since the last poll.
    pub fn poll_chunk_cache_accesses(&self) -> u64 {
        self.chunk_cache_accesses.poll()
    }

    /// Chunk cache misses since the last poll. Hits are accesses − misses.
    pub fn poll_chunk_cache_misses(&self) -> u64 {
        self.chunk_cache_misses.poll()
    }
}
