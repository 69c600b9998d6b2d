use std::collections::HashMap;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;

use foldhash::fast::RandomState;

use crate::AllocTag;

/// Where a [`PageStore`] obtains its memory from.
///
/// A pool only draws on a [`General`][StoreKind::General] store if it was created with
/// [`PoolFlags::MALLOC_OK`][crate::PoolFlags::MALLOC_OK].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StoreKind {
    /// Pages come from a region set aside for page-granular allocation.
    Dedicated,

    /// Pages come from the general-purpose heap allocator.
    General,
}

/// A contiguous, page-aligned extent of memory owned by whoever holds this value.
///
/// Blocks are created by a [`PageStore`] and must be returned to the same store.
#[derive(Debug)]
pub struct BackingBlock {
    ptr: NonNull<u8>,
    size: usize,
}

impl BackingBlock {
    /// Wraps an extent of memory as a backing block.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` is valid for reads and writes of `size` bytes until
    /// the block is released back to the store that created it, and that no other party
    /// accesses that memory in the meantime.
    #[must_use]
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    /// The start of the block.
    #[must_use]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` falls within the block.
    #[must_use]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.addr().get();

        // Cannot overflow because the block exists in the address space.
        addr >= start && addr < start.wrapping_add(self.size)
    }
}

// SAFETY: A backing block is exclusive ownership of a memory extent, with no thread affinity.
unsafe impl Send for BackingBlock {}

/// Supplies page-granular backing memory to pools.
///
/// Page stores are shared by any number of pools and are called concurrently, so they do their
/// own locking. A pool never calls a page store while holding its own lock.
///
/// # Safety
///
/// Implementations must guarantee that every block returned from
/// [`acquire_pages()`][Self::acquire_pages]:
///
/// * is aligned to [`page_size()`][Self::page_size] and exactly `size` bytes long,
/// * is valid for reads and writes until passed to [`release_pages()`][Self::release_pages],
/// * does not overlap any other block that has not been released.
pub unsafe trait PageStore: Send + Sync + fmt::Debug {
    /// The size of a page in bytes. Always a power of two.
    fn page_size(&self) -> NonZero<usize>;

    /// Where the store obtains its memory from.
    fn kind(&self) -> StoreKind;

    /// Acquires a block of `size` bytes, a non-zero multiple of the page size.
    ///
    /// Returns `None` if the store cannot supply the memory right now.
    fn acquire_pages(&self, size: usize, tag: AllocTag) -> Option<BackingBlock>;

    /// Returns a block previously acquired from this store.
    fn release_pages(&self, block: BackingBlock, tag: AllocTag);
}

/// A point-in-time view of the activity of a page store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct StoreStats {
    /// Number of blocks handed out over the lifetime of the store.
    pub acquired_blocks: u64,

    /// Number of blocks returned over the lifetime of the store.
    pub released_blocks: u64,

    /// Number of acquisition requests the store could not satisfy.
    pub failed_acquisitions: u64,

    /// Bytes currently handed out and not yet returned.
    pub bytes_in_use: usize,
}

/// Bookkeeping shared by the page stores in this crate.
///
/// Always accessed under the owning store's lock.
pub(crate) struct Accounting {
    stats: StoreStats,
    bytes_by_tag: HashMap<AllocTag, usize, RandomState>,
}

impl Accounting {
    pub(crate) fn new() -> Self {
        Self {
            stats: StoreStats::default(),
            bytes_by_tag: HashMap::with_hasher(RandomState::default()),
        }
    }

    pub(crate) fn bytes_in_use(&self) -> usize {
        self.stats.bytes_in_use
    }

    pub(crate) fn bytes_in_use_by(&self, tag: AllocTag) -> usize {
        self.bytes_by_tag.get(&tag).copied().unwrap_or(0)
    }

    pub(crate) fn stats(&self) -> StoreStats {
        self.stats
    }

    pub(crate) fn record_acquire(&mut self, size: usize, tag: AllocTag) {
        // None of these can overflow: bytes are bounded by the address space and
        // the block counters would need centuries of continuous allocation.
        self.stats.acquired_blocks = self.stats.acquired_blocks.wrapping_add(1);
        self.stats.bytes_in_use = self.stats.bytes_in_use.wrapping_add(size);

        let by_tag = self.bytes_by_tag.entry(tag).or_insert(0);
        *by_tag = by_tag.wrapping_add(size);
    }

    pub(crate) fn record_failure(&mut self) {
        self.stats.failed_acquisitions = self.stats.failed_acquisitions.wrapping_add(1);
    }

    pub(crate) fn record_release(&mut self, size: usize, tag: AllocTag) {
        let by_tag = self
            .bytes_by_tag
            .get_mut(&tag)
            .expect("released a block under a tag that never acquired one");

        *by_tag = by_tag
            .checked_sub(size)
            .expect("released more bytes under a tag than were acquired under it");

        if *by_tag == 0 {
            self.bytes_by_tag.remove(&tag);
        }

        self.stats.bytes_in_use = self
            .stats
            .bytes_in_use
            .checked_sub(size)
            .expect("released more bytes than were acquired");
        self.stats.released_blocks = self.stats.released_blocks.wrapping_add(1);
    }
}

impl fmt::Debug for Accounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accounting")
            .field("stats", &self.stats)
            .field("tags", &self.bytes_by_tag.len())
            .finish()
    }
}
