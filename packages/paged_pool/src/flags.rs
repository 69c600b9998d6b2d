use std::time::Instant;

bitflags::bitflags! {
    /// Pool configuration flags, plus the transient [`WANTED`][PoolFlags::WANTED] state bit.
    ///
    /// # Examples
    ///
    /// ```
    /// use paged_pool::{Pool, PoolFlags};
    ///
    /// // A pool whose callers may block but which must not fall back to general heap memory.
    /// let pool = Pool::builder()
    ///     .object_size(64)
    ///     .flags(PoolFlags::WAIT_OK)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(pool.flags(), PoolFlags::WAIT_OK);
    /// ```
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct PoolFlags: u8 {
        /// The pool may obtain backing blocks from a [general-purpose][crate::StoreKind::General]
        /// page store. Without this flag, such a store is treated as unable to supply memory.
        const MALLOC_OK = 0b0001;

        /// Callers of [`Pool::get()`][crate::Pool::get] may block waiting for an object.
        /// Without this flag, every `get` behaves as [`WaitMode::NoWait`].
        const WAIT_OK = 0b0010;

        /// At least one caller is currently blocked waiting for an object.
        ///
        /// This is runtime state owned by the pool. It is ignored when passed to the builder.
        const WANTED = 0b0100;
    }
}

impl PoolFlags {
    /// The flags that describe configuration, as opposed to runtime state.
    pub(crate) const CONFIG_MASK: Self = Self::MALLOC_OK.union(Self::WAIT_OK);
}

impl Default for PoolFlags {
    fn default() -> Self {
        Self::MALLOC_OK | Self::WAIT_OK
    }
}

/// How [`Pool::get()`][crate::Pool::get] behaves when no object is immediately available.
///
/// Waiting is only possible if the pool was created with [`PoolFlags::WAIT_OK`]. Otherwise every
/// mode behaves as [`WaitMode::NoWait`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitMode {
    /// Return `None` if the pool cannot supply an object without waiting.
    NoWait,

    /// Block until another party returns an object to the pool or primes it.
    CanWait,

    /// Block until an object becomes available or the deadline passes, whichever comes first.
    Until(Instant),
}
