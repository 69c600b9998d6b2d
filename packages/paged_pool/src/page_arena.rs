use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::heap_pages::DEFAULT_PAGE_SIZE;
use crate::{Accounting, AllocTag, BackingBlock, PageStore, StoreKind, StoreStats};

/// A [`PageStore`] that carves blocks out of a fixed region of pages reserved up front.
///
/// This is a [dedicated][StoreKind::Dedicated] store, the kind that pools may always draw on.
/// Blocks are runs of contiguous pages, handed out first-fit. Once the region is used up,
/// acquisition fails until blocks are released.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use paged_pool::{PageArena, PageStore, Pool, PoolFlags};
///
/// let arena = Arc::new(PageArena::new(16));
///
/// // Pools backed by a dedicated store do not need MALLOC_OK.
/// let store: Arc<dyn PageStore> = Arc::<PageArena>::clone(&arena);
/// let pool = Pool::builder()
///     .object_size(256)
///     .flags(PoolFlags::WAIT_OK)
///     .page_store(store)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.prime(16), 16);
/// assert_eq!(arena.free_pages(), 15);
/// ```
#[derive(Debug)]
pub struct PageArena {
    page_size: NonZero<usize>,
    page_count: NonZero<usize>,
    base: NonNull<u8>,
    region_layout: Layout,
    state: Mutex<ArenaState>,
}

#[derive(Debug)]
struct ArenaState {
    /// One entry per page in the region.
    in_use: Vec<bool>,
    free_pages: usize,
    accounting: Accounting,
}

impl PageArena {
    /// Reserves a region of `page_count` pages of 4 KiB.
    ///
    /// # Panics
    ///
    /// Panics if `page_count` is zero or the region cannot be allocated.
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE, page_count)
    }

    /// Reserves a region of `page_count` pages of `page_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the page size is not a power of two, `page_count` is zero or the region
    /// cannot be allocated.
    #[must_use]
    pub fn with_page_size(page_size: NonZero<usize>, page_count: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size {page_size} is not a power of two"
        );

        let page_count =
            NonZero::new(page_count).expect("a page arena must contain at least one page");

        let region_size = page_size
            .get()
            .checked_mul(page_count.get())
            .expect("page arena size exceeds the address space");

        let region_layout = Layout::from_size_align(region_size, page_size.get())
            .expect("page-multiple sizes with power-of-two page alignment are valid layouts");

        // SAFETY: The layout is non-zero-sized because both factors are non-zero.
        let base = NonNull::new(unsafe { alloc(region_layout) })
            .expect("we do not intend to handle allocation failure as a real possibility - OOM results in panic");

        debug!(page_size = page_size.get(), page_count, "reserved page arena");

        Self {
            page_size,
            page_count,
            base,
            region_layout,
            state: Mutex::new(ArenaState {
                in_use: vec![false; page_count.get()],
                free_pages: page_count.get(),
                accounting: Accounting::new(),
            }),
        }
    }

    /// The total number of pages in the region.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count.get()
    }

    /// The number of pages not currently handed out.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.state.lock().free_pages
    }

    /// A snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.state.lock().accounting.stats()
    }

    /// Bytes currently handed out under the given tag.
    #[must_use]
    pub fn bytes_in_use_by(&self, tag: AllocTag) -> usize {
        self.state.lock().accounting.bytes_in_use_by(tag)
    }

    fn pages_in(&self, size: usize) -> usize {
        assert!(
            size > 0 && size % self.page_size.get() == 0,
            "block size {size} is not a non-zero multiple of the page size {}",
            self.page_size
        );

        size.checked_div(self.page_size.get())
            .expect("page size is non-zero")
    }
}

impl ArenaState {
    /// Finds the lowest run of `pages` consecutive free pages.
    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut run_start: usize = 0;
        let mut run_len: usize = 0;

        for (index, in_use) in self.in_use.iter().enumerate() {
            if *in_use {
                // Cannot overflow, index is bounded by the length of the vector.
                run_start = index.wrapping_add(1);
                run_len = 0;
                continue;
            }

            // Cannot overflow, bounded by the length of the vector.
            run_len = run_len.wrapping_add(1);

            if run_len == pages {
                return Some(run_start);
            }
        }

        None
    }

    fn mark(&mut self, first_page: usize, pages: usize, in_use: bool) {
        let run = first_page
            .checked_add(pages)
            .and_then(|end| self.in_use.get_mut(first_page..end))
            .expect("page run lies within the arena");

        for page in run {
            assert!(
                *page != in_use,
                "page arena run starting at page {first_page} is in an inconsistent state"
            );
            *page = in_use;
        }

        self.free_pages = if in_use {
            self.free_pages.wrapping_sub(pages)
        } else {
            self.free_pages.wrapping_add(pages)
        };
    }
}

// SAFETY: Every block is a run of pages inside our region, aligned to the page size because
// the region is, marked in use until released so that no two live blocks overlap, and the
// region itself lives until the arena is dropped. Pools hold the arena alive via `Arc`.
unsafe impl PageStore for PageArena {
    fn page_size(&self) -> NonZero<usize> {
        self.page_size
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Dedicated
    }

    fn acquire_pages(&self, size: usize, tag: AllocTag) -> Option<BackingBlock> {
        let pages = self.pages_in(size);
        let mut state = self.state.lock();

        let Some(first_page) = state.find_run(pages) else {
            state.accounting.record_failure();
            trace!(size, %tag, free_pages = state.free_pages, "page arena exhausted");
            return None;
        };

        state.mark(first_page, pages, true);
        state.accounting.record_acquire(size, tag);

        // Cannot overflow, the run lies within the region.
        let offset = first_page.wrapping_mul(self.page_size.get());

        // SAFETY: The offset lies within our region, as established by find_run().
        let ptr = unsafe { self.base.add(offset) };

        // SAFETY: The run was free and is now marked in use, so nobody else has this memory.
        Some(unsafe { BackingBlock::from_raw_parts(ptr, size) })
    }

    fn release_pages(&self, block: BackingBlock, tag: AllocTag) {
        let pages = self.pages_in(block.size());

        let offset = block
            .ptr()
            .addr()
            .get()
            .checked_sub(self.base.addr().get())
            .expect("released a block that does not belong to this page arena");

        assert!(
            offset % self.page_size.get() == 0,
            "released a block that is not aligned to a page of this arena"
        );

        let first_page = offset
            .checked_div(self.page_size.get())
            .expect("page size is non-zero");

        let mut state = self.state.lock();
        state.mark(first_page, pages, false);
        state.accounting.record_release(block.size(), tag);
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        let outstanding = self.page_count.get().wrapping_sub(self.state.get_mut().free_pages);

        // SAFETY: We allocated the region with this layout in the constructor.
        unsafe {
            dealloc(self.base.as_ptr(), self.region_layout);
        }

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was.
        if !thread::panicking() {
            assert!(
                outstanding == 0,
                "dropped a page arena with {outstanding} pages still handed out"
            );
        }
    }
}

// SAFETY: The base pointer refers to memory we own exclusively. All mutable state is behind
// the mutex, and the region itself is never accessed by the arena after construction.
unsafe impl Send for PageArena {}

// SAFETY: See above. Shared access only reads immutable fields or goes through the mutex.
unsafe impl Sync for PageArena {}
