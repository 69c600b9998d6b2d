use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::pool::PoolConfig;
use crate::{AllocTag, Error, HeapPages, PageStore, Pool, PoolFlags, PoolRegistry, Result};

/// The largest alignment inferred from an object size when no alignment is given.
const MAX_INFERRED_ALIGN: usize = 16;

/// Builder for creating an instance of [`Pool`].
///
/// The object size (or layout) is mandatory, every other setting has a default:
///
/// | Setting | Default |
/// |---|---|
/// | [`high_water`][Self::high_water] | unbounded |
/// | [`low_water`][Self::low_water] | 0 |
/// | [`name`][Self::name] | `"pool"` |
/// | [`alloc_tag`][Self::alloc_tag] | [`AllocTag::GENERIC`] |
/// | [`flags`][Self::flags] | [`MALLOC_OK`][PoolFlags::MALLOC_OK] and [`WAIT_OK`][PoolFlags::WAIT_OK] |
/// | [`page_store`][Self::page_store] | [`HeapPages::shared()`] |
/// | [`registry`][Self::registry] | [`PoolRegistry::global()`] |
/// | [`poison`][Self::poison] | on in debug builds |
///
/// # Examples
///
/// ```
/// use paged_pool::{AllocTag, Pool, PoolFlags};
///
/// let pool = Pool::builder()
///     .object_size(200)
///     .high_water(64)
///     .low_water(8)
///     .name("mbuf")
///     .alloc_tag(AllocTag::new("network"))
///     .flags(PoolFlags::MALLOC_OK)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.free_count(), 8);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder {
    object_size: Option<usize>,
    align: Option<usize>,
    high_water: usize,
    low_water: usize,
    name: String,
    alloc_tag: AllocTag,
    flags: PoolFlags,
    page_store: Option<Arc<dyn PageStore>>,
    registry: Option<Arc<PoolRegistry>>,
    poison: bool,

    _not_sync: PhantomData<Cell<()>>,
}

impl PoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            object_size: None,
            align: None,
            high_water: usize::MAX,
            low_water: 0,
            name: "pool".to_string(),
            alloc_tag: AllocTag::GENERIC,
            flags: PoolFlags::default(),
            page_store: None,
            registry: None,
            poison: cfg!(debug_assertions),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size of each object in bytes.
    ///
    /// Unless an alignment is also set, objects are aligned to the largest power of two that
    /// divides the size, up to 16 bytes.
    pub fn object_size(mut self, size: usize) -> Self {
        self.object_size = Some(size);
        self
    }

    /// Sets the alignment of each object in bytes. Must be a power of two.
    pub fn align(mut self, align: usize) -> Self {
        self.align = Some(align);
        self
    }

    /// Sets the object size and alignment from a layout.
    pub fn layout(mut self, layout: Layout) -> Self {
        self.object_size = Some(layout.size());
        self.align = Some(layout.align());
        self
    }

    /// Sets the object size and alignment to fit a `T`.
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the maximum number of objects the pool carves from backing memory, counting both
    /// free and checked-out objects.
    ///
    /// Once the cap is reached, `get` on an empty pool fails or waits even if the page store
    /// could supply more memory.
    pub fn high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }

    /// Sets the number of free objects the pool keeps ready.
    ///
    /// The pool primes itself to this many objects when built, and
    /// [`Pool::reclaim()`] never releases memory below it.
    pub fn low_water(mut self, low_water: usize) -> Self {
        self.low_water = low_water;
        self
    }

    /// Sets the diagnostic name of the pool, used in log events, panic messages and the
    /// registry.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the tag the pool passes to its page store when acquiring and releasing memory.
    pub fn alloc_tag(mut self, tag: AllocTag) -> Self {
        self.alloc_tag = tag;
        self
    }

    /// Sets the pool flags. Runtime state bits such as [`PoolFlags::WANTED`] are ignored.
    pub fn flags(mut self, flags: PoolFlags) -> Self {
        self.flags = flags & PoolFlags::CONFIG_MASK;
        self
    }

    /// Sets the page store the pool obtains backing blocks from.
    pub fn page_store(mut self, store: Arc<dyn PageStore>) -> Self {
        self.page_store = Some(store);
        self
    }

    /// Sets the registry the pool publishes itself to.
    pub fn registry(mut self, registry: &Arc<PoolRegistry>) -> Self {
        self.registry = Some(Arc::clone(registry));
        self
    }

    /// Sets whether free objects are filled with a poison pattern that is verified when they
    /// are handed out again, detecting writes through dangling pointers.
    pub fn poison(mut self, poison: bool) -> Self {
        self.poison = poison;
        self
    }

    /// Builds the pool and primes it to its low-water mark.
    ///
    /// # Errors
    ///
    /// Returns an error if the object size is missing or zero, the alignment is invalid or
    /// larger than a page, or the object is too large to be backed by pages.
    pub fn build(self) -> Result<Pool> {
        let size = self.object_size.ok_or(Error::ZeroSizedObject)?;

        if size == 0 {
            return Err(Error::ZeroSizedObject);
        }

        let align = self.align.unwrap_or_else(|| inferred_align(size));

        let layout = Layout::from_size_align(size, align).map_err(|e| Error::InvalidLayout {
            size,
            align,
            problem: e.to_string(),
        })?;

        let store = self
            .page_store
            .unwrap_or_else(|| -> Arc<dyn PageStore> { HeapPages::shared() });
        let registry = self.registry.unwrap_or_else(PoolRegistry::global);

        Pool::new_inner(PoolConfig {
            layout,
            high_water: self.high_water,
            low_water: self.low_water,
            name: self.name,
            tag: self.alloc_tag,
            flags: self.flags,
            store,
            registry,
            poison: self.poison,
        })
    }
}

/// The largest power of two dividing `size`, capped at [`MAX_INFERRED_ALIGN`].
fn inferred_align(size: usize) -> usize {
    debug_assert!(size > 0);

    1_usize
        .checked_shl(size.trailing_zeros())
        .map_or(MAX_INFERRED_ALIGN, |align| align.min(MAX_INFERRED_ALIGN))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolBuilder: Sync);

    fn isolated() -> PoolBuilder {
        PoolBuilder::new().registry(&Arc::new(PoolRegistry::new()))
    }

    #[test]
    fn defaults() {
        let builder = PoolBuilder::new();

        assert_eq!(builder.object_size, None);
        assert_eq!(builder.high_water, usize::MAX);
        assert_eq!(builder.low_water, 0);
        assert_eq!(builder.name, "pool");
        assert_eq!(builder.alloc_tag, AllocTag::GENERIC);
        assert_eq!(builder.flags, PoolFlags::MALLOC_OK | PoolFlags::WAIT_OK);
        assert_eq!(builder.poison, cfg!(debug_assertions));
    }

    #[test]
    fn alignment_is_inferred_from_size() {
        assert_eq!(inferred_align(1), 1);
        assert_eq!(inferred_align(6), 2);
        assert_eq!(inferred_align(24), 8);
        assert_eq!(inferred_align(64), 16);
        assert_eq!(inferred_align(4096), 16);
    }

    #[test]
    fn layout_of_sets_size_and_alignment() {
        let pool = isolated().layout_of::<[u32; 3]>().build().unwrap();

        assert_eq!(pool.object_layout(), Layout::new::<[u32; 3]>());
    }

    #[test]
    fn missing_size_is_rejected() {
        assert!(matches!(isolated().build(), Err(Error::ZeroSizedObject)));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            isolated().object_size(0).build(),
            Err(Error::ZeroSizedObject)
        ));
        assert!(matches!(
            isolated().layout_of::<()>().build(),
            Err(Error::ZeroSizedObject)
        ));
    }

    #[test]
    fn bad_alignment_is_rejected() {
        assert!(matches!(
            isolated().object_size(24).align(3).build(),
            Err(Error::InvalidLayout { align: 3, .. })
        ));
        assert!(matches!(
            isolated().object_size(64).align(8192).build(),
            Err(Error::InvalidLayout { align: 8192, .. })
        ));
    }

    #[test]
    fn oversized_object_is_rejected() {
        assert!(matches!(
            isolated()
                .object_size(isize::MAX as usize - 100)
                .align(1)
                .build(),
            Err(Error::ObjectTooLarge { .. })
        ));
    }

    #[test]
    fn runtime_flags_are_stripped() {
        let pool = isolated()
            .object_size(8)
            .flags(PoolFlags::WAIT_OK | PoolFlags::WANTED)
            .build()
            .unwrap();

        assert_eq!(pool.flags(), PoolFlags::WAIT_OK);
    }

    #[test]
    fn build_primes_to_low_water() {
        let pool = isolated().object_size(100).low_water(50).build().unwrap();

        assert_eq!(pool.free_count(), 50);
        assert_eq!(pool.low_water(), 50);
    }
}
