use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use new_zealand::nz;
use parking_lot::Mutex;
use tracing::trace;

use crate::{Accounting, AllocTag, BackingBlock, PageStore, StoreKind, StoreStats};

/// The page size used when none is specified.
pub(crate) const DEFAULT_PAGE_SIZE: NonZero<usize> = nz!(4096);

/// A [`PageStore`] that obtains page-aligned blocks from the global heap allocator.
///
/// This is a [general-purpose][StoreKind::General] store: pools only draw on it if they were
/// created with [`PoolFlags::MALLOC_OK`][crate::PoolFlags::MALLOC_OK].
///
/// An optional byte budget bounds the memory the store hands out at any one time, which makes
/// it possible to reproduce memory pressure deterministically.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use paged_pool::{HeapPages, PageStore, Pool};
///
/// // Two pages worth of memory, shared between all pools using this store.
/// let pages = Arc::new(HeapPages::with_budget(8192));
///
/// let store: Arc<dyn PageStore> = Arc::<HeapPages>::clone(&pages);
/// let pool = Pool::builder()
///     .object_size(1024)
///     .page_store(store)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.prime(100), 8);
/// assert_eq!(pages.stats().acquired_blocks, 2);
/// ```
#[derive(Debug)]
pub struct HeapPages {
    page_size: NonZero<usize>,
    budget: Option<usize>,
    accounting: Mutex<Accounting>,
}

impl HeapPages {
    /// Creates a store with 4 KiB pages and no budget.
    #[must_use]
    pub fn new() -> Self {
        Self::build(DEFAULT_PAGE_SIZE, None)
    }

    /// Creates a store with 4 KiB pages that hands out at most `budget` bytes at a time.
    #[must_use]
    pub fn with_budget(budget: usize) -> Self {
        Self::build(DEFAULT_PAGE_SIZE, Some(budget))
    }

    /// Creates a store with a custom page size and an optional budget.
    ///
    /// # Panics
    ///
    /// Panics if the page size is not a power of two.
    #[must_use]
    pub fn with_page_size(page_size: NonZero<usize>, budget: Option<usize>) -> Self {
        Self::build(page_size, budget)
    }

    fn build(page_size: NonZero<usize>, budget: Option<usize>) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size {page_size} is not a power of two"
        );

        Self {
            page_size,
            budget,
            accounting: Mutex::new(Accounting::new()),
        }
    }

    /// The store shared by all pools that are not configured with a store of their own.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<HeapPages>> = OnceLock::new();

        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }

    /// A snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.accounting.lock().stats()
    }

    /// Bytes currently handed out under the given tag.
    #[must_use]
    pub fn bytes_in_use_by(&self, tag: AllocTag) -> usize {
        self.accounting.lock().bytes_in_use_by(tag)
    }

    fn block_layout(&self, size: usize) -> Layout {
        Layout::from_size_align(size, self.page_size.get())
            .expect("page-multiple sizes with power-of-two page alignment are valid layouts")
    }
}

impl Default for HeapPages {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Every block is a fresh, exclusively owned heap allocation of exactly `size` bytes
// with page alignment, and lives until it is deallocated in `release_pages()`.
unsafe impl PageStore for HeapPages {
    fn page_size(&self) -> NonZero<usize> {
        self.page_size
    }

    fn kind(&self) -> StoreKind {
        StoreKind::General
    }

    fn acquire_pages(&self, size: usize, tag: AllocTag) -> Option<BackingBlock> {
        assert!(
            size > 0 && size % self.page_size.get() == 0,
            "block size {size} is not a non-zero multiple of the page size {}",
            self.page_size
        );

        let mut accounting = self.accounting.lock();

        if let Some(budget) = self.budget {
            let exceeds_budget = accounting
                .bytes_in_use()
                .checked_add(size)
                .is_none_or(|total| total > budget);

            if exceeds_budget {
                accounting.record_failure();
                trace!(size, %tag, budget, "heap page budget exhausted");
                return None;
            }
        }

        // SAFETY: The layout has a non-zero size, checked above.
        let Some(ptr) = NonNull::new(unsafe { alloc(self.block_layout(size)) }) else {
            accounting.record_failure();
            return None;
        };

        accounting.record_acquire(size, tag);

        // SAFETY: We just allocated this memory with exactly this size and nobody else has it.
        Some(unsafe { BackingBlock::from_raw_parts(ptr, size) })
    }

    fn release_pages(&self, block: BackingBlock, tag: AllocTag) {
        let size = block.size();

        self.accounting.lock().record_release(size, tag);

        // SAFETY: The block came from acquire_pages() of this store, which allocated it with
        // this same layout, and the caller has given up ownership by passing it to us.
        unsafe {
            dealloc(block.ptr().as_ptr(), self.block_layout(size));
        }
    }
}
