use std::alloc::Layout;
use std::collections::BTreeSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    AllocTag, BlockGeometry, BlockTable, Counters, FreeList, PageStore, PoolBlock, PoolBuilder,
    PoolFlags, PoolInfo, PoolObject, PoolRegistry, PoolStats, Result, SlotId, SlotMeta, StoreKind,
    WaitMode,
};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Validated settings collected by [`PoolBuilder`].
pub(crate) struct PoolConfig {
    pub(crate) layout: Layout,
    pub(crate) high_water: usize,
    pub(crate) low_water: usize,
    pub(crate) name: String,
    pub(crate) tag: AllocTag,
    pub(crate) flags: PoolFlags,
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) registry: Arc<PoolRegistry>,
    pub(crate) poison: bool,
}

/// A type-stable pool of fixed-size objects.
///
/// Objects are carved from page-granular backing blocks obtained from a [`PageStore`] and are
/// only ever reused for objects of the same pool. Returning an object puts it on the pool's free
/// list, from which the next [`get()`][Self::get] is served in O(1) without touching the store.
///
/// The pool never returns memory to the store on its own. Memory goes back when the pool is
/// destroyed or when [`reclaim()`][Self::reclaim] is called.
///
/// # High and low water
///
/// The high-water mark caps the number of objects carved from backing memory, free and checked
/// out together. Once it is reached, a `get` on an empty free list fails or waits even if the
/// store could supply more memory. The low-water mark is the number of free objects the pool
/// keeps ready: the pool primes itself to it and `reclaim()` never goes below it.
///
/// # Waiting
///
/// If the pool has [`PoolFlags::WAIT_OK`], callers of `get` may block until another party returns
/// an object or primes the pool. Each returned object wakes at most one waiter.
///
/// # Misuse
///
/// Returning an object to a pool it did not come from, returning it twice or returning it through
/// a stale handle panics. So does destroying a pool while objects are still checked out.
///
/// # Examples
///
/// ```
/// use paged_pool::{Pool, PoolFlags, WaitMode};
///
/// let pool = Pool::builder()
///     .object_size(64)
///     .high_water(4)
///     .flags(PoolFlags::WAIT_OK | PoolFlags::MALLOC_OK)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.prime(4), 4);
///
/// let objects = (0..4)
///     .map(|_| pool.get(WaitMode::NoWait).unwrap())
///     .collect::<Vec<_>>();
///
/// // The cap is reached and nothing is free.
/// assert!(pool.get(WaitMode::NoWait).is_none());
///
/// pool.put(objects[2]);
/// assert_eq!(pool.get(WaitMode::NoWait).unwrap().as_ptr(), objects[2].as_ptr());
/// #
/// # for object in objects {
/// #     pool.put_ptr(object.as_ptr());
/// # }
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). All state lives behind a single lock per
/// pool, which is never held while calling into the page store.
pub struct Pool {
    pub(crate) shared: Arc<PoolShared>,
    registry: Arc<PoolRegistry>,
}

/// The part of a pool that the registry can reach.
#[derive(Debug)]
pub(crate) struct PoolShared {
    id: u64,
    name: String,
    tag: AllocTag,
    geometry: BlockGeometry,

    /// Configuration flags only. `WANTED` is derived from the waiter count.
    flags: PoolFlags,

    high_water: usize,
    poison: bool,
    store: Arc<dyn PageStore>,

    state: Mutex<PoolState>,

    /// Signaled once for every object that becomes available while callers are waiting.
    available: Condvar,
}

#[derive(Debug)]
struct PoolState {
    blocks: BlockTable,
    free_list: FreeList,

    /// Objects carved from the blocks, free and checked out.
    carved: usize,

    /// Objects reserved for blocks being acquired while the lock is released.
    pending_growth: usize,

    /// Callers currently blocked in `get`.
    waiters: usize,

    low_water: usize,

    /// Generation of the next checkout. Starts above the generation of unlinked slots.
    next_generation: u64,

    /// Whether the high-water warning has been logged since the pool last shrank.
    limit_warned: bool,

    counters: Counters,
}

impl Pool {
    /// Creates a builder for configuring and constructing a [`Pool`].
    ///
    /// # Examples
    ///
    /// ```
    /// use paged_pool::Pool;
    ///
    /// let pool = Pool::builder().object_size(32).build().unwrap();
    /// assert_eq!(pool.object_size(), 32);
    /// ```
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    pub(crate) fn new_inner(config: PoolConfig) -> Result<Self> {
        let geometry = BlockGeometry::calculate(config.layout, config.store.page_size())?;

        let shared = Arc::new(PoolShared {
            id: generate_pool_id(),
            name: config.name,
            tag: config.tag,
            geometry,
            flags: config.flags,
            high_water: config.high_water,
            poison: config.poison,
            store: config.store,
            state: Mutex::new(PoolState {
                blocks: BlockTable::new(),
                free_list: FreeList::new(),
                carved: 0,
                pending_growth: 0,
                waiters: 0,
                low_water: config.low_water,
                next_generation: 1,
                limit_warned: false,
                counters: Counters::default(),
            }),
            available: Condvar::new(),
        });

        config.registry.register(&shared);

        debug!(
            pool = %shared.name,
            id = shared.id,
            object_size = config.layout.size(),
            align = config.layout.align(),
            stride = geometry.stride().get(),
            block_size = geometry.block_size().get(),
            high_water = shared.high_water,
            low_water = config.low_water,
            "pool created"
        );

        let pool = Self {
            shared,
            registry: config.registry,
        };

        if config.low_water > 0 {
            pool.prime(config.low_water);
        }

        Ok(pool)
    }

    /// Checks out an object.
    ///
    /// The object comes from the free list if possible. Otherwise the pool grows by carving more
    /// backing memory, unless the high-water mark has been reached or the page store cannot
    /// supply memory. If it cannot grow, the `mode` decides whether to wait for an object to be
    /// returned or to give up. Pools without [`PoolFlags::WAIT_OK`] never wait.
    ///
    /// Returns `None` if no object could be obtained. The contents of the object are unspecified.
    ///
    /// # Panics
    ///
    /// Panics if poisoning is enabled and a free object was written to while on the free list.
    #[must_use]
    pub fn get(&self, mode: WaitMode) -> Option<PoolObject> {
        self.shared.get(mode)
    }

    /// Checks out an object like [`get()`][Self::get] and zeroes its bytes.
    #[must_use]
    pub fn get_zeroed(&self, mode: WaitMode) -> Option<PoolObject> {
        let object = self.shared.get(mode)?;

        // SAFETY: The object was just checked out to us and is valid for writes of its size.
        unsafe {
            object.as_ptr().write_bytes(0, object.size());
        }

        Some(object)
    }

    /// Returns an object to the pool, waking one waiter if any are blocked in `get`.
    ///
    /// # Panics
    ///
    /// Panics if the object belongs to another pool, has already been returned, or the handle
    /// is stale because the object was returned and handed out again since.
    pub fn put(&self, object: PoolObject) {
        self.shared.put(object);
    }

    /// Returns an object to the pool by address, for callers that kept only the pointer.
    ///
    /// # Panics
    ///
    /// Panics if the address is not the start of an object of this pool or the object is
    /// already on the free list.
    pub fn put_ptr(&self, ptr: NonNull<u8>) {
        self.shared.put_ptr(ptr);
    }

    /// Adds up to `count` objects to the free list, acquiring backing memory as needed.
    ///
    /// Never exceeds the high-water mark and never blocks. Returns the number of objects
    /// actually added, which is less than `count` if the cap was reached or the page store ran
    /// out of memory. Blocked callers of `get` are woken for the new objects.
    pub fn prime(&self, count: usize) -> usize {
        let mut state = self.shared.state.lock();
        let added = self.shared.prime_locked(&mut state, count);
        self.shared.wake_waiters(&state, added);

        added
    }

    /// Changes the low-water mark and primes the pool up to it.
    ///
    /// Returns the number of objects added.
    pub fn set_low_water(&self, low_water: usize) -> usize {
        let mut state = self.shared.state.lock();
        state.low_water = low_water;

        let shortfall = low_water.saturating_sub(state.free_list.len());
        let added = self.shared.prime_locked(&mut state, shortfall);
        self.shared.wake_waiters(&state, added);

        debug!(pool = %self.shared.name, low_water, added, "low water mark changed");

        added
    }

    /// Releases backing blocks with no checked-out objects back to the page store, keeping at
    /// least the low-water mark of objects on the free list.
    ///
    /// Returns the number of blocks released.
    pub fn reclaim(&self) -> usize {
        self.shared.reclaim()
    }

    /// A snapshot of the pool's state and lifetime counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Destroys the pool, releasing all backing blocks to the page store and removing the pool
    /// from its registry.
    ///
    /// Dropping the pool does the same.
    ///
    /// # Panics
    ///
    /// Panics if any object is still checked out.
    pub fn destroy(self) {
        drop(self);
    }

    /// Process-unique identifier of the pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The diagnostic name of the pool.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The size of each object in bytes.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.shared.geometry.object_layout().size()
    }

    /// The size and alignment of each object.
    #[must_use]
    pub fn object_layout(&self) -> Layout {
        self.shared.geometry.object_layout()
    }

    /// The tag the pool passes to its page store.
    #[must_use]
    pub fn alloc_tag(&self) -> AllocTag {
        self.shared.tag
    }

    /// The configuration flags, plus [`PoolFlags::WANTED`] while any caller is blocked in `get`.
    #[must_use]
    pub fn flags(&self) -> PoolFlags {
        let waiting = self.shared.state.lock().waiters > 0;

        if waiting {
            self.shared.flags | PoolFlags::WANTED
        } else {
            self.shared.flags
        }
    }

    /// The cap on carved objects.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.shared.high_water
    }

    /// The number of free objects the pool keeps ready.
    #[must_use]
    pub fn low_water(&self) -> usize {
        self.shared.state.lock().low_water
    }

    /// The number of objects on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.shared.state.lock().free_list.len()
    }

    /// The number of objects currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let state = self.shared.state.lock();

        // Cannot wrap, free objects are a subset of carved objects.
        state.carved.wrapping_sub(state.free_list.len())
    }

    #[cfg(all(test, debug_assertions))]
    pub(crate) fn integrity_check(&self) {
        let state = self.shared.state.lock();
        self.shared.integrity_check(&state);
    }
}

impl PoolShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn info(&self) -> PoolInfo {
        let stats = self.stats();

        PoolInfo {
            id: self.id,
            name: self.name.clone(),
            object_size: self.geometry.object_layout().size(),
            free_count: stats.free,
            high_water: self.high_water,
            stats,
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();

        state.counters.snapshot(
            state.carved,
            state.free_list.len(),
            self.high_water,
            state.low_water,
        )
    }

    fn get(&self, mode: WaitMode) -> Option<PoolObject> {
        let mode = if self.flags.contains(PoolFlags::WAIT_OK) {
            mode
        } else {
            WaitMode::NoWait
        };

        let mut state = self.state.lock();

        loop {
            if let Some(object) = self.take_free(&mut state) {
                return Some(object);
            }

            let added = self.refill(&mut state);

            if added > 0 {
                // We take one of the new objects on the next pass, the rest may serve waiters.
                self.wake_waiters(&state, added.wrapping_sub(1));
                continue;
            }

            // The lock is released during page store calls, a put may have arrived meanwhile.
            if let Some(object) = self.take_free(&mut state) {
                return Some(object);
            }

            if !self.may_use_store() {
                // Such a pool can never obtain an object, so there is nothing to wait for.
                trace!(
                    pool = %self.name,
                    "page store is general-purpose and the pool lacks MALLOC_OK"
                );
                state.counters.record_failed_get();
                return None;
            }

            match mode {
                WaitMode::CanWait => {
                    self.begin_wait(&mut state);
                    self.available.wait(&mut state);
                    self.end_wait(&mut state);
                }
                WaitMode::Until(deadline) => {
                    self.begin_wait(&mut state);
                    let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
                    self.end_wait(&mut state);

                    if timed_out {
                        // An object may have arrived just as we timed out.
                        if let Some(object) = self.take_free(&mut state) {
                            return Some(object);
                        }

                        trace!(pool = %self.name, "wait for object timed out");
                        state.counters.record_failed_get();
                        return None;
                    }
                }
                WaitMode::NoWait => {
                    trace!(pool = %self.name, "no object available without waiting");
                    state.counters.record_failed_get();
                    return None;
                }
            }
        }
    }

    fn begin_wait(&self, state: &mut PoolState) {
        // Cannot overflow, every waiter is a blocked thread.
        state.waiters = state.waiters.wrapping_add(1);
        state.counters.record_wait();

        trace!(pool = %self.name, waiters = state.waiters, "waiting for object");
    }

    fn end_wait(&self, state: &mut PoolState) {
        state.waiters = state
            .waiters
            .checked_sub(1)
            .expect("waiter count includes the caller that is ending its wait");

        trace!(pool = %self.name, waiters = state.waiters, "woke up");
    }

    /// Wakes one waiter per newly available object, as far as there are waiters.
    fn wake_waiters(&self, state: &PoolState, available: usize) {
        for _ in 0..available.min(state.waiters) {
            self.available.notify_one();
        }
    }

    /// Pops an object off the free list and hands it out.
    fn take_free(&self, state: &mut PoolState) -> Option<PoolObject> {
        let generation = state.next_generation;
        let slot = state.free_list.pop(&mut state.blocks, generation)?;

        // Cannot overflow, we would need centuries of continuous allocation.
        state.next_generation = generation.wrapping_add(1);

        let block = state
            .blocks
            .get(slot.block_index())
            .expect("free list entries belong to live blocks");

        let ptr = block.slot_ptr(&self.geometry, slot.slot_index());

        assert!(
            !self.poison || block.is_poison_intact(&self.geometry, slot.slot_index()),
            "pool '{}': object at {ptr:?} was modified after being returned to the pool",
            self.name
        );

        state.counters.record_get();

        #[cfg(debug_assertions)]
        self.integrity_check(state);

        trace!(pool = %self.name, ?ptr, "object checked out");

        Some(PoolObject::new(
            self.id,
            slot,
            generation,
            ptr,
            self.geometry.object_layout(),
        ))
    }

    fn put(&self, object: PoolObject) {
        assert!(
            object.pool_id() == self.id,
            "pool '{}' (id {}) was given an object from pool id {}",
            self.name,
            self.id,
            object.pool_id()
        );

        let mut state = self.state.lock();
        let slot = object.slot();

        let meta = state
            .blocks
            .get(slot.block_index())
            .and_then(|block| block.meta(slot.slot_index()))
            .copied();

        match meta {
            Some(SlotMeta::Occupied { generation }) if generation == object.generation() => {}
            Some(SlotMeta::Vacant { .. }) => panic!(
                "pool '{}': object at {:?} was returned twice",
                self.name,
                object.as_ptr()
            ),
            _ => panic!(
                "pool '{}': stale handle for object at {:?}, it was already returned",
                self.name,
                object.as_ptr()
            ),
        }

        self.return_slot(&mut state, slot);
    }

    fn put_ptr(&self, ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        let addr = ptr.addr().get();

        let Some(block_index) = state.blocks.locate(addr) else {
            panic!(
                "pool '{}': {ptr:?} does not belong to this pool",
                self.name
            );
        };

        let block = state
            .blocks
            .get(block_index)
            .expect("located blocks are live");

        let Some(slot_index) = block.slot_at(&self.geometry, addr) else {
            panic!(
                "pool '{}': {ptr:?} is not the start of an object of this pool",
                self.name
            );
        };

        if matches!(block.meta(slot_index), Some(SlotMeta::Vacant { .. })) {
            panic!(
                "pool '{}': object at {ptr:?} was returned twice",
                self.name
            );
        }

        self.return_slot(&mut state, SlotId::new(block_index, slot_index));
    }

    /// Pushes a checked-out slot onto the free list and wakes a waiter.
    fn return_slot(&self, state: &mut PoolState, slot: SlotId) {
        if self.poison {
            state
                .blocks
                .get_mut(slot.block_index())
                .expect("returned slots belong to live blocks")
                .fill(&self.geometry, slot.slot_index(), crate::block::POISON_BYTE);
        }

        state.free_list.push(&mut state.blocks, slot);
        state.counters.record_put();

        #[cfg(debug_assertions)]
        self.integrity_check(state);

        trace!(pool = %self.name, ?slot, free = state.free_list.len(), "object returned");

        // The object is on the free list before anyone is woken to take it.
        self.wake_waiters(state, 1);
    }

    /// Objects the pool may still carve without exceeding the high-water mark.
    fn room(&self, state: &PoolState) -> usize {
        self.high_water
            .saturating_sub(state.carved)
            .saturating_sub(state.pending_growth)
    }

    /// Whether the pool may draw on its page store at all.
    fn may_use_store(&self) -> bool {
        self.flags.contains(PoolFlags::MALLOC_OK) || self.store.kind() != StoreKind::General
    }

    /// Grows the free list by one block's worth of objects for a `get` that found it empty.
    fn refill(&self, state: &mut MutexGuard<'_, PoolState>) -> usize {
        if self.room(state) == 0 {
            if !state.limit_warned && state.pending_growth == 0 {
                state.limit_warned = true;
                warn!(
                    pool = %self.name,
                    high_water = self.high_water,
                    "pool limit reached, not growing further"
                );
            }

            return 0;
        }

        let added = self.carve_partial_blocks(state, usize::MAX);

        if added > 0 {
            return added;
        }

        self.acquire_block(state, self.geometry.slots_per_block().get())
    }

    /// Adds up to `count` objects, first from partially carved blocks, then from new blocks.
    fn prime_locked(&self, state: &mut MutexGuard<'_, PoolState>, count: usize) -> usize {
        let mut added = self.carve_partial_blocks(state, count);

        while added < count {
            // Cannot wrap, added is below count.
            let acquired = self.acquire_block(state, count.wrapping_sub(added));

            if acquired == 0 {
                break;
            }

            // Cannot overflow, bounded by count.
            added = added.wrapping_add(acquired);
        }

        if added > 0 {
            debug!(pool = %self.name, requested = count, added, "pool primed");
        }

        added
    }

    /// Carves up to `limit` objects from blocks that still have uncarved slots.
    fn carve_partial_blocks(&self, state: &mut PoolState, limit: usize) -> usize {
        let limit = limit.min(self.room(state));

        let partial = state
            .blocks
            .iter()
            .filter(|(_, block)| block.uncarved(&self.geometry) > 0)
            .map(|(index, block)| (index, block.uncarved(&self.geometry)))
            .collect::<Vec<_>>();

        let mut added: usize = 0;

        for (block_index, uncarved) in partial {
            // Cannot wrap, added never exceeds limit.
            let count = uncarved.min(limit.wrapping_sub(added));

            if count == 0 {
                break;
            }

            self.carve_into_free_list(state, block_index, count);

            // Cannot overflow, bounded by limit.
            added = added.wrapping_add(count);
        }

        added
    }

    /// Acquires a new block from the page store and carves up to `limit` objects from it.
    ///
    /// The pool lock is released while the page store is called. The objects to carve are
    /// reserved up front so that concurrent growth cannot exceed the high-water mark.
    fn acquire_block(&self, state: &mut MutexGuard<'_, PoolState>, limit: usize) -> usize {
        let reserved = limit
            .min(self.room(state))
            .min(self.geometry.slots_per_block().get());

        if reserved == 0 {
            return 0;
        }

        if !self.may_use_store() {
            return 0;
        }

        // Cannot overflow, reservations are bounded by the high-water mark.
        state.pending_growth = state.pending_growth.wrapping_add(reserved);

        let block_size = self.geometry.block_size().get();
        let backing = MutexGuard::unlocked(state, || {
            self.store.acquire_pages(block_size, self.tag)
        });

        state.pending_growth = state
            .pending_growth
            .checked_sub(reserved)
            .expect("our own reservation is still part of the pending growth");

        let Some(backing) = backing else {
            trace!(pool = %self.name, block_size, "page store could not supply a block");
            return 0;
        };

        debug!(
            pool = %self.name,
            block_size,
            addr = backing.ptr().addr().get(),
            "backing block acquired"
        );

        state.counters.record_block_acquired();
        let block_index = state.blocks.insert(PoolBlock::new(backing, &self.geometry));
        self.carve_into_free_list(state, block_index, reserved);

        reserved
    }

    fn carve_into_free_list(&self, state: &mut PoolState, block_index: usize, count: usize) {
        for _ in 0..count {
            let slot_index = state
                .blocks
                .get_mut(block_index)
                .expect("carving from a live block")
                .carve(&self.geometry, self.poison);

            state
                .free_list
                .push(&mut state.blocks, SlotId::new(block_index, slot_index));
        }

        // Cannot overflow, carved objects are bounded by the high-water mark.
        state.carved = state.carved.wrapping_add(count);

        #[cfg(debug_assertions)]
        self.integrity_check(state);
    }

    fn reclaim(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut surplus = state.free_list.len().saturating_sub(state.low_water);
        let mut doomed = BTreeSet::new();

        for (index, block) in state.blocks.iter() {
            if block.is_idle() && block.carved() <= surplus {
                doomed.insert(index);

                // Cannot wrap, checked above.
                surplus = surplus.wrapping_sub(block.carved());
            }
        }

        if doomed.is_empty() {
            return 0;
        }

        state
            .free_list
            .retain(&mut state.blocks, |slot| !doomed.contains(&slot.block_index()));

        let released = doomed
            .iter()
            .map(|index| state.blocks.remove(*index))
            .collect::<Vec<_>>();

        let released_objects = released.iter().map(PoolBlock::carved).sum::<usize>();

        state.carved = state
            .carved
            .checked_sub(released_objects)
            .expect("released objects were part of the carved objects");
        state.counters.record_blocks_released(released.len());
        state.limit_warned = false;

        #[cfg(debug_assertions)]
        self.integrity_check(state);

        let free = state.free_list.len();
        drop(guard);

        let count = released.len();

        for block in released {
            self.store.release_pages(block.into_backing(), self.tag);
        }

        debug!(pool = %self.name, blocks = count, free, "reclaimed idle blocks");

        count
    }

    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    fn integrity_check(&self, state: &PoolState) {
        state.free_list.integrity_check(&state.blocks);

        let carved = state
            .blocks
            .iter()
            .map(|(_, block)| block.carved())
            .sum::<usize>();

        assert_eq!(carved, state.carved, "carved object count is out of sync");
        assert!(
            state.carved.saturating_add(state.pending_growth) <= self.high_water,
            "pool carved {} objects with {} pending, above its high water mark of {}",
            state.carved,
            state.pending_growth,
            self.high_water
        );
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.registry.deregister(self.shared.id);

        let mut state = self.shared.state.lock();

        // Cannot wrap, free objects are a subset of carved objects.
        let outstanding = state.carved.wrapping_sub(state.free_list.len());

        if outstanding > 0 {
            // If we are already panicking, we do not want to panic again because that will
            // simply obscure whatever the original panic was. The blocks may still be referenced,
            // so they are leaked instead of released.
            if thread::panicking() {
                warn!(
                    pool = %self.shared.name,
                    outstanding,
                    blocks = state.blocks.len(),
                    "pool dropped during panic with objects checked out, leaking its blocks"
                );
                return;
            }

            panic!(
                "pool '{}' destroyed with {outstanding} objects still checked out",
                self.shared.name
            );
        }

        state.free_list = FreeList::new();
        state.carved = 0;
        let blocks = state.blocks.drain().collect::<Vec<_>>();
        state
            .counters
            .record_blocks_released(blocks.len());
        drop(state);

        let count = blocks.len();

        for block in blocks {
            self.shared
                .store
                .release_pages(block.into_backing(), self.shared.tag);
        }

        debug!(pool = %self.shared.name, blocks = count, "pool destroyed");
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("object_layout", &self.shared.geometry.object_layout())
            .field("high_water", &self.shared.high_water)
            .field("flags", &self.shared.flags)
            .field("store", &self.shared.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::time::{Duration, Instant};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{HeapPages, PageArena};

    assert_impl_all!(Pool: Send, Sync, fmt::Debug);
    assert_not_impl_any!(Pool: Clone);

    fn builder(store: &Arc<HeapPages>) -> PoolBuilder {
        let store: Arc<dyn PageStore> = Arc::<HeapPages>::clone(store);

        Pool::builder()
            .page_store(store)
            .registry(&Arc::new(PoolRegistry::new()))
    }

    #[test]
    fn starts_empty_without_low_water() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(64).build().unwrap();

        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.stats().carved, 0);
        assert_eq!(pages.stats().acquired_blocks, 0);
    }

    #[test]
    fn get_refills_a_whole_block() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(64).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();

        // 64 objects of 64 bytes fit in a page; one is checked out.
        assert_eq!(pool.free_count(), 63);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(object.size(), 64);
        assert_eq!(object.as_ptr().addr().get() % 16, 0);

        pool.put(object);

        #[cfg(debug_assertions)]
        pool.integrity_check();
    }

    #[test]
    fn objects_are_distinct() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(24).build().unwrap();

        let objects = (0..500)
            .map(|_| pool.get(WaitMode::NoWait).unwrap())
            .collect::<Vec<_>>();

        let mut addresses = objects
            .iter()
            .map(|object| object.as_ptr().addr().get())
            .collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 500);

        for object in objects {
            pool.put(object);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), pool.stats().carved);
    }

    #[test]
    fn put_is_lifo() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(32).build().unwrap();

        let a = pool.get(WaitMode::NoWait).unwrap();
        let b = pool.get(WaitMode::NoWait).unwrap();
        pool.put(a);
        pool.put(b);

        assert_eq!(pool.get(WaitMode::NoWait).unwrap().as_ptr(), b.as_ptr());
        assert_eq!(pool.get(WaitMode::NoWait).unwrap().as_ptr(), a.as_ptr());

        pool.put_ptr(a.as_ptr());
        pool.put_ptr(b.as_ptr());
    }

    #[test]
    fn prime_respects_high_water_across_blocks() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(1024)
            .high_water(10)
            .build()
            .unwrap();

        assert_eq!(pool.prime(7), 7);
        assert_eq!(pool.prime(7), 3);
        assert_eq!(pool.prime(1), 0);

        // 4 objects per page, 10 objects need 3 blocks, the last one partially carved.
        assert_eq!(pages.stats().acquired_blocks, 3);
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn partially_carved_blocks_are_used_first() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(64).build().unwrap();

        assert_eq!(pool.prime(10), 10);
        assert_eq!(pool.prime(54), 54);

        assert_eq!(pages.stats().acquired_blocks, 1);
        assert_eq!(pool.stats().carved, 64);
    }

    #[test]
    fn general_store_needs_malloc_ok() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(64)
            .flags(PoolFlags::WAIT_OK)
            .build()
            .unwrap();

        assert_eq!(pool.prime(10), 0);

        // Refused immediately even though the caller is willing to wait.
        assert!(pool.get(WaitMode::CanWait).is_none());
        assert_eq!(pages.stats().acquired_blocks, 0);
        assert_eq!(pool.stats().failed_gets, 1);
    }

    #[test]
    fn dedicated_store_does_not_need_malloc_ok() {
        let arena = Arc::new(PageArena::new(2));
        let store: Arc<dyn PageStore> = Arc::<PageArena>::clone(&arena);
        let pool = Pool::builder()
            .object_size(64)
            .flags(PoolFlags::empty())
            .page_store(store)
            .registry(&Arc::new(PoolRegistry::new()))
            .build()
            .unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();
        assert_eq!(arena.free_pages(), 1);

        pool.put(object);
        drop(pool);
        assert_eq!(arena.free_pages(), 2);
    }

    #[test]
    fn without_wait_ok_every_get_is_no_wait() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(64)
            .high_water(1)
            .flags(PoolFlags::MALLOC_OK)
            .build()
            .unwrap();

        let object = pool.get(WaitMode::CanWait).unwrap();
        assert!(pool.get(WaitMode::CanWait).is_none());

        pool.put(object);
    }

    #[test]
    fn timed_get_gives_up_at_deadline() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(64)
            .high_water(1)
            .build()
            .unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();

        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);
        assert!(pool.get(WaitMode::Until(deadline)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));

        let stats = pool.stats();
        assert!(stats.waits >= 1);
        assert_eq!(stats.failed_gets, 1);
        assert!(!pool.flags().contains(PoolFlags::WANTED));

        pool.put(object);
    }

    #[test]
    fn get_zeroed_clears_the_object() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(128).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();
        // SAFETY: The object is checked out to us and 128 bytes long.
        unsafe {
            object.as_ptr().write_bytes(0xEE, 128);
        }
        pool.put(object);

        let object = pool.get_zeroed(WaitMode::NoWait).unwrap();
        // SAFETY: The object is checked out to us, 128 bytes long and was just zeroed.
        let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr().as_ptr(), 128) };
        assert!(bytes.iter().all(|byte| *byte == 0));

        pool.put(object);
    }

    #[test]
    fn stale_generation_is_distinct_per_checkout() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(16).build().unwrap();

        let first = pool.get(WaitMode::NoWait).unwrap();
        pool.put(first);
        let second = pool.get(WaitMode::NoWait).unwrap();

        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_ne!(first, second);

        pool.put(second);
    }

    #[test]
    #[should_panic(expected = "returned twice")]
    fn double_put_panics() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(16).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();
        pool.put(object);
        pool.put(object);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn stale_handle_panics() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(16).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();
        pool.put(object);
        let _again = pool.get(WaitMode::NoWait).unwrap();

        pool.put(object);
    }

    #[test]
    #[should_panic(expected = "was given an object from pool")]
    fn foreign_object_panics() {
        let pages = Arc::new(HeapPages::new());
        let a = builder(&pages).object_size(16).build().unwrap();
        let b = builder(&pages).object_size(16).build().unwrap();

        let object = a.get(WaitMode::NoWait).unwrap();
        b.put(object);
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn foreign_pointer_panics() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(16).build().unwrap();
        let mut local = 0_u128;

        pool.put_ptr(NonNull::from(&mut local).cast());
    }

    #[test]
    #[should_panic(expected = "not the start of an object")]
    fn misaligned_pointer_panics() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(16).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();

        // SAFETY: Still within the object, we only compute the address.
        pool.put_ptr(unsafe { object.as_ptr().add(1) });
    }

    #[test]
    #[should_panic(expected = "modified after being returned")]
    fn write_after_put_is_detected() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(32).poison(true).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();
        pool.put(object);

        // SAFETY: Deliberately writing through a stale handle. The memory still belongs to the
        // pool and nothing else uses it.
        unsafe {
            object.as_ptr().write(0);
        }

        _ = pool.get(WaitMode::NoWait);
    }

    #[test]
    fn poisoned_objects_are_filled() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(32).poison(true).build().unwrap();

        let object = pool.get(WaitMode::NoWait).unwrap();

        // SAFETY: The object is checked out to us, 32 bytes long and initialized by poisoning.
        let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr().as_ptr(), 32) };
        assert!(bytes.iter().all(|byte| *byte == crate::block::POISON_BYTE));

        pool.put(object);
    }

    #[test]
    fn reclaim_keeps_low_water() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(1024).build().unwrap();

        // 4 objects per block, 3 blocks.
        assert_eq!(pool.prime(12), 12);
        pool.set_low_water(5);

        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pages.stats().released_blocks, 1);

        // Another block would drop below the low water mark.
        assert_eq!(pool.reclaim(), 0);

        #[cfg(debug_assertions)]
        pool.integrity_check();
    }

    #[test]
    fn reclaim_skips_blocks_in_use() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(2048).build().unwrap();

        let held = pool.get(WaitMode::NoWait).unwrap();
        assert_eq!(pool.prime(2), 2);

        // The first block holds the checked-out object and one free object.
        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.stats().blocks_released, 1);

        pool.put(held);
        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.stats().carved, 0);
        assert_eq!(pages.stats().bytes_in_use, 0);

        // The pool grows again after shrinking.
        let object = pool.get(WaitMode::NoWait).unwrap();
        pool.put(object);
    }

    #[test]
    fn set_low_water_primes_the_shortfall() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(64)
            .high_water(20)
            .build()
            .unwrap();

        assert_eq!(pool.set_low_water(8), 8);
        assert_eq!(pool.set_low_water(5), 0);
        assert_eq!(pool.set_low_water(30), 12);
        assert_eq!(pool.free_count(), 20);
    }

    #[test]
    fn destroy_releases_every_block() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(3000).build().unwrap();

        assert_eq!(pool.prime(5), 5);
        pool.destroy();

        let stats = pages.stats();
        assert_eq!(stats.acquired_blocks, 5);
        assert_eq!(stats.released_blocks, 5);
        assert_eq!(stats.bytes_in_use, 0);
    }

    #[test]
    #[should_panic(expected = "still checked out")]
    fn destroy_with_outstanding_objects_panics() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages).object_size(64).build().unwrap();

        let _object = pool.get(WaitMode::NoWait).unwrap();
        pool.destroy();
    }

    #[test]
    fn stats_track_activity() {
        let pages = Arc::new(HeapPages::new());
        let pool = builder(&pages)
            .object_size(64)
            .high_water(2)
            .build()
            .unwrap();

        let a = pool.get(WaitMode::NoWait).unwrap();
        let b = pool.get(WaitMode::NoWait).unwrap();
        assert!(pool.get(WaitMode::NoWait).is_none());
        pool.put(a);

        let stats = pool.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.failed_gets, 1);
        assert_eq!(stats.blocks_acquired, 1);
        assert_eq!(stats.carved, 2);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.high_water, 2);

        pool.put(b);
    }
}
