//! Chunk arithmetic and the per-open-file chunk cache.
//!
//! A file body is a sequence of fixed-size cleartext chunks, each encrypted
//! independently. This module owns the pure offset math relating cleartext
//! and ciphertext sizes, and the bounded LRU of decrypted chunks held by one
//! open file. Write-back of evicted dirty chunks is the caller's job: the
//! cache hands evicted entries back instead of doing I/O itself.

use std::num::NonZeroUsize;

use lru::LruCache;
use thiserror::Error;

use crate::crypto::{CHUNK_CIPHERTEXT_SIZE, CHUNK_OVERHEAD, CHUNK_PAYLOAD_SIZE, HEADER_SIZE};

pub(crate) const HEADER_LEN: u64 = HEADER_SIZE as u64;
pub(crate) const PAYLOAD_LEN: u64 = CHUNK_PAYLOAD_SIZE as u64;
pub(crate) const CIPHERTEXT_LEN: u64 = CHUNK_CIPHERTEXT_SIZE as u64;
pub(crate) const OVERHEAD_LEN: u64 = CHUNK_OVERHEAD as u64;

/// Default number of decrypted chunks cached per open file.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;

/// The ciphertext length does not describe a valid chunked file.
#[derive(Error, Debug)]
pub enum SizeFormulaError {
    #[error("ciphertext is {actual} bytes, shorter than the {HEADER_LEN}-byte header")]
    TruncatedHeader { actual: u64 },

    #[error("trailing chunk of {actual} bytes cannot hold nonce and tag")]
    TruncatedChunk { actual: u64 },
}

/// Number of chunks a file of the given cleartext size occupies.
#[inline]
pub(crate) fn chunk_count(cleartext_size: u64) -> u64 {
    cleartext_size.div_ceil(PAYLOAD_LEN)
}

/// Ciphertext offset of a chunk within the host file.
#[inline]
pub(crate) fn chunk_offset(chunk_number: u64) -> u64 {
    HEADER_LEN + chunk_number * CIPHERTEXT_LEN
}

/// Exact ciphertext file length for a given cleartext size.
///
/// All chunks except the last are full; an empty file is a bare header.
pub(crate) fn ciphertext_size(cleartext_size: u64) -> u64 {
    if cleartext_size == 0 {
        return HEADER_LEN;
    }
    let chunks = chunk_count(cleartext_size);
    let last_payload = cleartext_size - (chunks - 1) * PAYLOAD_LEN;
    HEADER_LEN + (chunks - 1) * CIPHERTEXT_LEN + last_payload + OVERHEAD_LEN
}

/// Cleartext size derived from a ciphertext file length.
///
/// Inverse of [`ciphertext_size`]; fails on lengths no valid file can have.
pub(crate) fn cleartext_size(ciphertext_len: u64) -> Result<u64, SizeFormulaError> {
    if ciphertext_len < HEADER_LEN {
        return Err(SizeFormulaError::TruncatedHeader {
            actual: ciphertext_len,
        });
    }
    let body = ciphertext_len - HEADER_LEN;
    if body == 0 {
        return Ok(0);
    }
    let chunks = body.div_ceil(CIPHERTEXT_LEN);
    let last = body - (chunks - 1) * CIPHERTEXT_LEN;
    if last <= OVERHEAD_LEN {
        return Err(SizeFormulaError::TruncatedChunk { actual: last });
    }
    Ok((chunks - 1) * PAYLOAD_LEN + (last - OVERHEAD_LEN))
}

/// One decrypted chunk held in memory.
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Cleartext payload, at most [`CHUNK_PAYLOAD_SIZE`] bytes.
    pub data: Vec<u8>,
    /// Whether the payload differs from what is on disk.
    pub dirty: bool,
}

impl Chunk {
    pub fn clean(data: Vec<u8>) -> Self {
        Chunk { data, dirty: false }
    }

    pub fn dirty(data: Vec<u8>) -> Self {
        Chunk { data, dirty: true }
    }
}

/// Bounded LRU of decrypted chunks for one open file.
pub(crate) struct ChunkCache {
    cache: LruCache<u64, Chunk>,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("len", &self.cache.len())
            .field("cap", &self.cache.cap())
            .finish()
    }
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        ChunkCache {
            cache: LruCache::new(capacity),
        }
    }

    /// Look up a chunk and mark it most recently used.
    pub fn get_mut(&mut self, chunk_number: u64) -> Option<&mut Chunk> {
        self.cache.get_mut(&chunk_number)
    }

    pub fn contains(&self, chunk_number: u64) -> bool {
        self.cache.contains(&chunk_number)
    }

    /// Insert a chunk, returning an evicted entry that still needs
    /// write-back. Replacing the same chunk number never reports an
    /// eviction; the superseded payload is simply dropped.
    pub fn insert(&mut self, chunk_number: u64, chunk: Chunk) -> Option<(u64, Chunk)> {
        match self.cache.push(chunk_number, chunk) {
            Some((evicted_number, evicted)) if evicted_number != chunk_number => {
                Some((evicted_number, evicted))
            }
            _ => None,
        }
    }

    /// Remove and return a chunk without write-back.
    pub fn pop(&mut self, chunk_number: u64) -> Option<Chunk> {
        self.cache.pop(&chunk_number)
    }

    /// Chunk numbers currently marked dirty, in ascending order.
    pub fn dirty_chunk_numbers(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(n, _)| *n)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Discard every cached chunk at or beyond the given number, without
    /// write-back. Used by truncation.
    pub fn discard_from(&mut self, first_discarded: u64) {
        let doomed: Vec<u64> = self
            .cache
            .iter()
            .map(|(n, _)| *n)
            .filter(|n| *n >= first_discarded)
            .collect();
        for number in doomed {
            self.cache.pop(&number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_formula_roundtrip() {
        for size in [
            0u64,
            1,
            27,
            28,
            29,
            PAYLOAD_LEN - 1,
            PAYLOAD_LEN,
            PAYLOAD_LEN + 1,
            5 * PAYLOAD_LEN,
            5 * PAYLOAD_LEN + 123,
        ] {
            let ct = ciphertext_size(size);
            assert_eq!(cleartext_size(ct).unwrap(), size, "size {size}");
        }
    }

    #[test]
    fn empty_file_is_bare_header() {
        assert_eq!(ciphertext_size(0), HEADER_LEN);
        assert_eq!(cleartext_size(HEADER_LEN).unwrap(), 0);
    }

    #[test]
    fn cleartext_size_respects_interval_invariant() {
        // For any valid ciphertext length, the derived cleartext size lies in
        // ((n-1)*P, n*P] where n is the chunk count.
        for size in [1u64, 100, PAYLOAD_LEN, PAYLOAD_LEN * 3 - 7] {
            let ct = ciphertext_size(size);
            let n = (ct - HEADER_LEN).div_ceil(CIPHERTEXT_LEN);
            let derived = cleartext_size(ct).unwrap();
            assert!(derived > (n - 1) * PAYLOAD_LEN);
            assert!(derived <= n * PAYLOAD_LEN);
        }
    }

    #[test]
    fn invalid_ciphertext_lengths_rejected() {
        assert!(matches!(
            cleartext_size(HEADER_LEN - 1),
            Err(SizeFormulaError::TruncatedHeader { .. })
        ));
        // A trailing chunk of only nonce+tag (or less) holds no payload.
        assert!(matches!(
            cleartext_size(HEADER_LEN + OVERHEAD_LEN),
            Err(SizeFormulaError::TruncatedChunk { .. })
        ));
        assert!(matches!(
            cleartext_size(HEADER_LEN + CIPHERTEXT_LEN + 5),
            Err(SizeFormulaError::TruncatedChunk { .. })
        ));
    }

    #[test]
    fn chunk_offsets() {
        assert_eq!(chunk_offset(0), HEADER_LEN);
        assert_eq!(chunk_offset(1), HEADER_LEN + CIPHERTEXT_LEN);
        assert_eq!(chunk_offset(7), HEADER_LEN + 7 * CIPHERTEXT_LEN);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = ChunkCache::new(2);
        assert!(cache.insert(0, Chunk::clean(vec![0])).is_none());
        assert!(cache.insert(1, Chunk::clean(vec![1])).is_none());

        // Touch 0 so 1 becomes the LRU victim.
        cache.get_mut(0);
        let (evicted_number, evicted) = cache.insert(2, Chunk::clean(vec![2])).unwrap();
        assert_eq!(evicted_number, 1);
        assert_eq!(evicted.data, vec![1]);
        assert!(cache.contains(0));
        assert!(cache.contains(2));
    }

    #[test]
    fn replacing_same_chunk_is_not_an_eviction() {
        let mut cache = ChunkCache::new(1);
        cache.insert(0, Chunk::dirty(vec![1]));
        assert!(cache.insert(0, Chunk::dirty(vec![2])).is_none());
        assert_eq!(cache.get_mut(0).unwrap().data, vec![2]);
    }

    #[test]
    fn dirty_tracking() {
        let mut cache = ChunkCache::new(4);
        cache.insert(3, Chunk::dirty(vec![3]));
        cache.insert(1, Chunk::clean(vec![1]));
        cache.insert(2, Chunk::dirty(vec![2]));
        assert_eq!(cache.dirty_chunk_numbers(), vec![2, 3]);

        cache.get_mut(3).unwrap().dirty = false;
        assert_eq!(cache.dirty_chunk_numbers(), vec![2]);
    }

    #[test]
    fn discard_from_drops_tail() {
        let mut cache = ChunkCache::new(8);
        for n in 0..5u64 {
            cache.insert(n, Chunk::dirty(vec![n as u8]));
        }
        cache.discard_from(2);
        assert!(cache.contains(0));
        assert!(cache.contains(1));
        for n in 2..5u64 {
            assert!(!cache.contains(n));
        }
    }
}
