//! Memory-mapped embedding cache shared across the parent and all workers
//!
//! The backing file is the slot layout; there is no map abstraction on top.
//! `header ∥ slot[0] ∥ … ∥ slot[N-1]`, all little-endian:
//!
//! - header (64 B): `magic "EMBC"`, `version: u32`, `dim: u32`,
//!   `n_slots: u32`, `global_counter: u64`, zero padding to 64.
//! - slot: `flags: u8` (bit 0 = used, bit 1 = lock), 7 B pad, `hash: 32 B`,
//!   `vector: dim × f32`, `lru_counter: u64`; the vector region is padded so
//!   the counter (and the slot size) stay 8-byte aligned.
//!
//! Every process that opens the same path maps the region read/write and
//! coordinates purely through per-slot compare-and-set on the lock bit.
//! The lock is held only for the memcpy in/out of one slot; contested
//! acquisition spins a short bounded number of times, then yields, then
//! gives up (a reader reports a miss, a writer skips the store).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use memmap2::MmapRaw;
use thiserror::Error;

/// File magic, first four bytes of the header.
const MAGIC: [u8; 4] = *b"EMBC";
/// On-disk format version. Bump on any layout change; mismatch is fatal.
const FORMAT_VERSION: u32 = 1;
/// Fixed header size in bytes.
const HEADER_LEN: usize = 64;
/// Byte offset of the global LRU counter inside the header.
const GLOBAL_COUNTER_OFFSET: usize = 16;

/// Slot flag bits.
const FLAG_USED: u8 = 0b01;
const FLAG_LOCK: u8 = 0b10;

/// Bounded lock acquisition: this many raw spins before each yield, and
/// this many yields before giving up entirely.
const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 16;

/// Errors from cache initialization and access.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backing file could not be opened, created, sized, or mapped
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Header does not match this build's layout; destroy and recreate
    #[error("cache header mismatch at {path}: {detail}")]
    Header { path: PathBuf, detail: String },
    /// File is shorter than the header + slot region it declares
    #[error("cache file truncated at {path}: expected {expected} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    /// A vector of the wrong dimension was offered to `put`
    #[error("vector dimension mismatch: cache dim {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },
}

/// Aggregate counters for the cache.
///
/// `hits`/`misses`/`writes`/`evictions` are per-process (each mapping counts
/// its own traffic); `slots_used` is a scan of the shared region and thus
/// global.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub slots_used: u32,
    pub capacity: u32,
}

/// Fixed-slot embedding cache over a shared memory-mapped file.
///
/// `get`/`put` never block: slot contention beyond the spin budget degrades
/// to a miss or a skipped store. Safe to share across threads (`&self`
/// methods) and across processes mapping the same path.
#[derive(Debug)]
pub struct EmbeddingCache {
    map: MmapRaw,
    path: PathBuf,
    n_slots: u32,
    dim: u32,
    slot_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

// SAFETY: all mutation of the mapped region goes through atomics on the
// lock/flag bytes plus plain copies performed strictly while the slot lock
// is held; the per-process stat counters are atomics.
unsafe impl Send for EmbeddingCache {}
unsafe impl Sync for EmbeddingCache {}

/// Bytes occupied by one slot for a given dimension (vector region padded
/// so the trailing counter is 8-byte aligned).
pub fn slot_size(dim: u32) -> usize {
    let vector_span = (dim as usize * 4 + 7) & !7;
    8 + 32 + vector_span + 8
}

/// FNV-1a over the 32-byte content hash, reduced mod `n_slots`.
///
/// The input is already uniform (blake3), FNV just folds it into an index
/// deterministically across processes.
pub fn slot_index(hash: &[u8; 32], n_slots: u32) -> u32 {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in hash {
        acc ^= b as u64;
        acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (acc % n_slots as u64) as u32
}

impl EmbeddingCache {
    /// Open or create the backing file and map it read/write.
    ///
    /// A fresh file is sized to `HEADER_LEN + capacity × slot_size(dim)` and
    /// stamped with the header. An existing file must carry a matching
    /// magic, version, dimension and slot count; any mismatch is fatal and
    /// the caller is expected to [`EmbeddingCache::wipe`] and recreate.
    pub fn open(path: &Path, capacity: u32, dim: u32) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        let expected_len = (HEADER_LEN + capacity as usize * slot_size(dim)) as u64;
        let meta_len = file
            .metadata()
            .map_err(|e| CacheError::Io {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();

        let fresh = meta_len == 0;
        if fresh {
            // set_len zero-fills, which doubles as "all slots unused"
            file.set_len(expected_len).map_err(|e| CacheError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        } else if meta_len < HEADER_LEN as u64 {
            return Err(CacheError::Truncated {
                path: path.to_path_buf(),
                expected: HEADER_LEN as u64,
                found: meta_len,
            });
        }

        let map = MmapRaw::map_raw(&file).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let cache = Self {
            map,
            path: path.to_path_buf(),
            n_slots: capacity,
            dim,
            slot_size: slot_size(dim),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };

        if fresh {
            cache.write_header();
            tracing::info!(
                path = %path.display(),
                capacity,
                dim,
                bytes = expected_len,
                "Created embedding cache"
            );
        } else {
            cache.verify_header(meta_len)?;
            tracing::debug!(path = %path.display(), capacity, dim, "Attached embedding cache");
        }

        Ok(cache)
    }

    /// Delete the backing file (recovery path after a fatal header mismatch).
    pub fn wipe(path: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Look up a vector by content hash.
    ///
    /// Returns `None` on an empty slot, a hash mismatch (slot holds some
    /// other entry), or lock-budget exhaustion. A hit refreshes the slot's
    /// LRU counter.
    pub fn get(&self, hash: &[u8; 32]) -> Option<Vec<f32>> {
        let idx = slot_index(hash, self.n_slots);
        let guard = match self.lock_slot(idx) {
            Some(g) => g,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if guard.flags_at_acquire & FLAG_USED == 0 {
            drop(guard);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Copy the vector first, then verify the hash, all under the lock:
        // a writer may have replaced the slot between index computation and
        // acquisition, and the hash check is what rejects that case.
        let mut vector = vec![0f32; self.dim as usize];
        let vector_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut vector);
        // SAFETY: the slot lock is held; offsets are within the mapping by
        // construction (idx < n_slots, verified region length at open).
        unsafe {
            let base = self.slot_ptr(idx);
            std::ptr::copy_nonoverlapping(base.add(40), vector_bytes.as_mut_ptr(), vector_bytes.len());
            let mut stored_hash = [0u8; 32];
            std::ptr::copy_nonoverlapping(base.add(8), stored_hash.as_mut_ptr(), 32);
            if &stored_hash != hash {
                drop(guard);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            // Refresh recency while still holding the lock
            let next = self.bump_global_counter();
            self.write_slot_counter(idx, next);
        }

        drop(guard);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(vector)
    }

    /// Store a vector under a content hash.
    ///
    /// Returns `Ok(true)` if the slot now holds this entry, `Ok(false)` if
    /// the store was skipped (occupied by a fresher entry, or the slot lock
    /// could not be acquired within budget). Re-putting the same hash
    /// overwrites in place: last write wins, readers see old or new bytes,
    /// never a mix.
    pub fn put(&self, hash: &[u8; 32], vector: &[f32]) -> Result<bool, CacheError> {
        if vector.len() != self.dim as usize {
            return Err(CacheError::DimMismatch {
                expected: self.dim as usize,
                got: vector.len(),
            });
        }

        let idx = slot_index(hash, self.n_slots);
        let guard = match self.lock_slot(idx) {
            Some(g) => g,
            None => return Ok(false),
        };

        let occupied = guard.flags_at_acquire & FLAG_USED != 0;
        let mut evicting = false;
        if occupied {
            // SAFETY: lock held, offsets in bounds.
            let same_hash = unsafe {
                let base = self.slot_ptr(idx);
                let mut stored_hash = [0u8; 32];
                std::ptr::copy_nonoverlapping(base.add(8), stored_hash.as_mut_ptr(), 32);
                &stored_hash == hash
            };
            if !same_hash {
                // Approximate LRU: only replace entries that haven't been
                // touched for a full rotation of the global counter.
                let slot_counter = unsafe { self.read_slot_counter(idx) };
                let global = self.read_global_counter();
                let age = global.wrapping_sub(slot_counter);
                if age <= self.n_slots as u64 {
                    drop(guard);
                    return Ok(false);
                }
                evicting = true;
            }
        }

        // SAFETY: lock held; hash + vector + counter all inside this slot.
        let vector_bytes: &[u8] = bytemuck::cast_slice(vector);
        unsafe {
            let base = self.slot_ptr(idx);
            std::ptr::copy_nonoverlapping(hash.as_ptr(), base.add(8), 32);
            std::ptr::copy_nonoverlapping(vector_bytes.as_ptr(), base.add(40), vector_bytes.len());
            let next = self.bump_global_counter();
            self.write_slot_counter(idx, next);
        }

        // Publish used=1 together with the lock release (single store).
        guard.release_with_used();

        self.writes.fetch_add(1, Ordering::Relaxed);
        if evicting {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Per-process traffic counters plus a scan of global slot occupancy.
    pub fn stats(&self) -> CacheStats {
        let mut slots_used = 0u32;
        for idx in 0..self.n_slots {
            if self.flags_atomic(idx).load(Ordering::Relaxed) & FLAG_USED != 0 {
                slots_used += 1;
            }
        }
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            slots_used,
            capacity: self.n_slots,
        }
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn capacity(&self) -> u32 {
        self.n_slots
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ===== header =====

    fn write_header(&self) {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&self.dim.to_le_bytes());
        header[12..16].copy_from_slice(&self.n_slots.to_le_bytes());
        // global_counter starts at 0, reserved region stays zero
        // SAFETY: mapping is at least HEADER_LEN bytes (enforced at open).
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.map.as_mut_ptr(), HEADER_LEN);
        }
        self.map.flush_range(0, HEADER_LEN).ok();
    }

    fn verify_header(&self, file_len: u64) -> Result<(), CacheError> {
        let mut header = [0u8; HEADER_LEN];
        // SAFETY: mapping is at least HEADER_LEN bytes (enforced at open).
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr(), header.as_mut_ptr(), HEADER_LEN);
        }

        if header[0..4] != MAGIC {
            return Err(CacheError::Header {
                path: self.path.clone(),
                detail: "bad magic".into(),
            });
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        if version != FORMAT_VERSION {
            return Err(CacheError::Header {
                path: self.path.clone(),
                detail: format!("version {} != {}", version, FORMAT_VERSION),
            });
        }
        let dim = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
        if dim != self.dim {
            return Err(CacheError::Header {
                path: self.path.clone(),
                detail: format!("dim {} != {}", dim, self.dim),
            });
        }
        let n_slots = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes"));
        if n_slots != self.n_slots {
            return Err(CacheError::Header {
                path: self.path.clone(),
                detail: format!("n_slots {} != {}", n_slots, self.n_slots),
            });
        }

        let expected = (HEADER_LEN + self.n_slots as usize * self.slot_size) as u64;
        if file_len < expected {
            return Err(CacheError::Truncated {
                path: self.path.clone(),
                expected,
                found: file_len,
            });
        }
        Ok(())
    }

    // ===== slot access =====

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.n_slots);
        // SAFETY: idx < n_slots and the mapping covers the full slot region.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(HEADER_LEN + idx as usize * self.slot_size)
        }
    }

    fn flags_atomic(&self, idx: u32) -> &AtomicU8 {
        // SAFETY: the flags byte lives at slot offset 0, inside the mapping,
        // and AtomicU8 has no alignment requirement beyond 1.
        unsafe { &*(self.slot_ptr(idx) as *const AtomicU8) }
    }

    fn global_counter_atomic(&self) -> &AtomicU64 {
        // SAFETY: offset 16 in the header is 8-byte aligned (mmap is
        // page-aligned) and inside the mapping.
        unsafe { &*(self.map.as_ptr().add(GLOBAL_COUNTER_OFFSET) as *const AtomicU64) }
    }

    fn bump_global_counter(&self) -> u64 {
        self.global_counter_atomic()
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    fn read_global_counter(&self) -> u64 {
        self.global_counter_atomic().load(Ordering::Relaxed)
    }

    /// # Safety
    /// The slot lock for `idx` must be held.
    unsafe fn read_slot_counter(&self, idx: u32) -> u64 {
        let ptr = self.slot_ptr(idx).add(self.slot_size - 8) as *const u64;
        ptr.read_unaligned()
    }

    /// # Safety
    /// The slot lock for `idx` must be held.
    unsafe fn write_slot_counter(&self, idx: u32, value: u64) {
        let ptr = self.slot_ptr(idx).add(self.slot_size - 8) as *mut u64;
        ptr.write_unaligned(value);
    }

    /// Acquire the per-slot lock with a bounded spin, yielding between
    /// rounds. Returns `None` once the budget is exhausted; callers treat
    /// that as a miss / skipped store rather than blocking.
    fn lock_slot(&self, idx: u32) -> Option<SlotGuard<'_>> {
        let flags = self.flags_atomic(idx);
        for round in 0..=YIELD_LIMIT {
            for _ in 0..SPIN_LIMIT {
                let current = flags.load(Ordering::Relaxed);
                if current & FLAG_LOCK == 0
                    && flags
                        .compare_exchange_weak(
                            current,
                            current | FLAG_LOCK,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    return Some(SlotGuard {
                        flags,
                        flags_at_acquire: current,
                        publish_used: false,
                    });
                }
                std::hint::spin_loop();
            }
            if round < YIELD_LIMIT {
                std::thread::yield_now();
            }
        }
        tracing::trace!(slot = idx, "Slot lock budget exhausted");
        None
    }
}

/// RAII release of a slot lock. Dropping clears the lock bit; a writer that
/// completed a store releases with the used bit set in the same operation.
struct SlotGuard<'a> {
    flags: &'a AtomicU8,
    flags_at_acquire: u8,
    publish_used: bool,
}

impl SlotGuard<'_> {
    fn release_with_used(mut self) {
        self.publish_used = true;
        // Drop runs the release store.
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut next = self.flags_at_acquire & !FLAG_LOCK;
        if self.publish_used {
            next |= FLAG_USED;
        }
        self.flags.store(next, Ordering::Release);
    }
}
