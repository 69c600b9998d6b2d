/// A point-in-time view of the state and activity of a [`Pool`][crate::Pool].
///
/// Lifetime counters only ever grow. The remaining fields describe the pool at the moment the
/// snapshot was taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Objects handed out by `get`.
    pub gets: u64,

    /// Objects returned by `put`.
    pub puts: u64,

    /// Calls to `get` that returned `None`.
    pub failed_gets: u64,

    /// Times a caller blocked waiting for an object.
    pub waits: u64,

    /// Backing blocks obtained from the page store.
    pub blocks_acquired: u64,

    /// Backing blocks returned to the page store.
    pub blocks_released: u64,

    /// Objects currently carved from backing blocks, whether free or checked out.
    pub carved: usize,

    /// Objects currently checked out.
    pub outstanding: usize,

    /// Objects currently on the free list.
    pub free: usize,

    /// The cap on carved objects.
    pub high_water: usize,

    /// The number of free objects the pool tries to keep.
    pub low_water: usize,
}

/// The lifetime counters of a pool, kept under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) gets: u64,
    pub(crate) puts: u64,
    pub(crate) failed_gets: u64,
    pub(crate) waits: u64,
    pub(crate) blocks_acquired: u64,
    pub(crate) blocks_released: u64,
}

// None of these can realistically overflow a u64.
impl Counters {
    pub(crate) fn record_get(&mut self) {
        self.gets = self.gets.wrapping_add(1);
    }

    pub(crate) fn record_put(&mut self) {
        self.puts = self.puts.wrapping_add(1);
    }

    pub(crate) fn record_failed_get(&mut self) {
        self.failed_gets = self.failed_gets.wrapping_add(1);
    }

    pub(crate) fn record_wait(&mut self) {
        self.waits = self.waits.wrapping_add(1);
    }

    pub(crate) fn record_block_acquired(&mut self) {
        self.blocks_acquired = self.blocks_acquired.wrapping_add(1);
    }

    pub(crate) fn record_blocks_released(&mut self, count: usize) {
        self.blocks_released = self.blocks_released.wrapping_add(count as u64);
    }

    /// Combines the counters with the current shape of the pool into a snapshot.
    pub(crate) fn snapshot(
        &self,
        carved: usize,
        free: usize,
        high_water: usize,
        low_water: usize,
    ) -> PoolStats {
        debug_assert!(free <= carved);

        PoolStats {
            gets: self.gets,
            puts: self.puts,
            failed_gets: self.failed_gets,
            waits: self.waits,
            blocks_acquired: self.blocks_acquired,
            blocks_released: self.blocks_released,
            carved,
            outstanding: carved.wrapping_sub(free),
            free,
            high_water,
            low_water,
        }
    }
}
