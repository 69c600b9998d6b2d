use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::PoolStats;
use crate::pool::PoolShared;

/// A read-only directory of live pools, for diagnostics.
///
/// Every pool registers itself with a registry when it is built and deregisters when it is
/// destroyed. Pools use the [process-wide registry][Self::global] unless the builder is given
/// another one, which keeps tests independent of each other.
///
/// The registry only holds weak references, so it never keeps a pool alive.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use paged_pool::{Pool, PoolRegistry};
///
/// let registry = Arc::new(PoolRegistry::new());
///
/// let pool = Pool::builder()
///     .object_size(48)
///     .name("vnode")
///     .registry(&registry)
///     .build()
///     .unwrap();
///
/// let pools = registry.list();
/// assert_eq!(pools.len(), 1);
/// assert_eq!(pools[0].name, "vnode");
/// assert_eq!(pools[0].object_size, 48);
///
/// pool.destroy();
/// assert!(registry.list().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<BTreeMap<u64, Weak<PoolShared>>>,
}

/// A snapshot of one pool, as published by a [`PoolRegistry`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolInfo {
    /// Process-unique identifier of the pool.
    pub id: u64,

    /// The diagnostic name of the pool.
    pub name: String,

    /// The size of each object in bytes.
    pub object_size: usize,

    /// Objects on the free list at the time of the snapshot.
    pub free_count: usize,

    /// The cap on carved objects.
    pub high_water: usize,

    /// The full statistics of the pool at the time of the snapshot.
    pub stats: PoolStats,
}

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created at first use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<PoolRegistry>> = OnceLock::new();

        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Snapshots every pool registered at the time of the call, ordered by pool id.
    #[must_use]
    pub fn list(&self) -> Vec<PoolInfo> {
        // Pools are snapshotted after letting go of the registry lock. Pools take their own
        // lock for the snapshot and must never be locked while holding the registry lock.
        let live = self
            .pools
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();

        live.iter().map(|pool| pool.info()).collect()
    }

    /// The number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether no pools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    pub(crate) fn register(&self, pool: &Arc<PoolShared>) {
        let previous = self.pools.lock().insert(pool.id(), Arc::downgrade(pool));

        debug_assert!(previous.is_none(), "pool ids are unique");
    }

    pub(crate) fn deregister(&self, pool_id: u64) {
        self.pools.lock().remove(&pool_id);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Pool;

    assert_impl_all!(PoolRegistry: Send, Sync, std::fmt::Debug);
    assert_impl_all!(PoolInfo: Send, Sync, Clone);

    #[test]
    fn global_is_a_singleton() {
        assert!(Arc::ptr_eq(&PoolRegistry::global(), &PoolRegistry::global()));
    }

    #[test]
    fn lists_pools_in_creation_order() {
        let registry = Arc::new(PoolRegistry::new());

        let first = Pool::builder()
            .object_size(16)
            .name("first")
            .registry(&registry)
            .build()
            .unwrap();
        let second = Pool::builder()
            .object_size(32)
            .name("second")
            .high_water(8)
            .registry(&registry)
            .build()
            .unwrap();

        let names = registry
            .list()
            .into_iter()
            .map(|info| info.name)
            .collect::<Vec<_>>();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(registry.len(), 2);

        drop(first);
        let pools = registry.list();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].id, second.id());
        assert_eq!(pools[0].high_water, 8);
    }

    #[test]
    fn snapshot_reflects_pool_state() {
        let registry = Arc::new(PoolRegistry::new());

        let pool = Pool::builder()
            .object_size(64)
            .high_water(4)
            .registry(&registry)
            .build()
            .unwrap();
        pool.prime(4);

        let info = registry.list().remove(0);
        assert_eq!(info.free_count, 4);
        assert_eq!(info.stats.carved, 4);
        assert_eq!(info.stats.blocks_acquired, 1);
    }

    #[test]
    fn stale_entries_are_skipped() {
        let registry = PoolRegistry::new();
        let pool = Pool::builder().object_size(8).build().unwrap();

        // Registered with another registry as well; dropping the pool leaves a dangling entry.
        registry.register(&pool.shared);
        drop(pool);

        assert_eq!(registry.len(), 1);
        assert!(registry.list().is_empty());
    }
}
