use std::alloc::Layout;
use std::ptr::NonNull;

use crate::SlotId;

/// A handle to an object checked out of a [`Pool`][crate::Pool].
///
/// The handle is an address token: it grants no access by itself and does not keep the object
/// checked out. The caller decides what lives in the memory and returns the object with
/// [`Pool::put()`][crate::Pool::put] when done with it.
///
/// Handles are freely copyable. Returning an object through one copy makes every other copy
/// stale; the pool detects and rejects stale handles.
///
/// # Examples
///
/// ```
/// use paged_pool::{Pool, WaitMode};
///
/// let pool = Pool::builder().layout_of::<u64>().build().unwrap();
///
/// let object = pool.get(WaitMode::NoWait).unwrap();
///
/// // SAFETY: The object is checked out to us and the pool layout fits a u64.
/// unsafe {
///     object.cast::<u64>().write(42);
///     assert_eq!(object.cast::<u64>().read(), 42);
/// }
///
/// pool.put(object);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolObject {
    /// Ensures handles cannot be returned to the wrong pool.
    pool_id: u64,

    slot: SlotId,

    /// Distinguishes this checkout of the slot from every other one.
    generation: u64,

    ptr: NonNull<u8>,
    layout: Layout,
}

impl PoolObject {
    pub(crate) fn new(
        pool_id: u64,
        slot: SlotId,
        generation: u64,
        ptr: NonNull<u8>,
        layout: Layout,
    ) -> Self {
        Self {
            pool_id,
            slot,
            generation,
            ptr,
            layout,
        }
    }

    /// The address of the object.
    ///
    /// The memory is valid for reads and writes of [`size()`][Self::size] bytes until the object
    /// is returned to the pool. Its contents are unspecified unless the object was obtained via
    /// [`Pool::get_zeroed()`][crate::Pool::get_zeroed].
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The address of the object as a pointer to `T`.
    ///
    /// In debug builds, asserts that a `T` fits within the object's size and alignment.
    #[must_use]
    #[inline]
    pub fn cast<T>(&self) -> NonNull<T> {
        debug_assert!(
            size_of::<T>() <= self.layout.size() && align_of::<T>() <= self.layout.align(),
            "{} does not fit in a pool object of {:?}",
            std::any::type_name::<T>(),
            self.layout
        );

        self.ptr.cast()
    }

    /// The size of the object in bytes.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn slot(&self) -> SlotId {
        self.slot
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

// SAFETY: The handle is only an address token. Accessing the memory is unsafe and it is the
// caller's responsibility to synchronize that access, just as with any raw pointer they hold.
unsafe impl Send for PoolObject {}

// SAFETY: See above. No operation on a shared handle touches the object memory.
unsafe impl Sync for PoolObject {}
