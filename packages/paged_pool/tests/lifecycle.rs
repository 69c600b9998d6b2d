//! End-to-end behavior of a single pool driven from one thread.

#![allow(
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]

use std::sync::Arc;

use paged_pool::{
    AllocTag, Error, HeapPages, PageArena, PageStore, Pool, PoolFlags, PoolRegistry, WaitMode,
};

fn isolated_registry() -> Arc<PoolRegistry> {
    Arc::new(PoolRegistry::new())
}

#[test]
fn capped_pool_refuses_fifth_object() {
    let pages = Arc::new(HeapPages::new());
    let store: Arc<dyn PageStore> = Arc::<HeapPages>::clone(&pages);
    let pool = Pool::builder()
        .object_size(64)
        .high_water(4)
        .flags(PoolFlags::WAIT_OK | PoolFlags::MALLOC_OK)
        .page_store(store)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    assert_eq!(pool.prime(4), 4);

    let objects = (0..4)
        .map(|_| pool.get(WaitMode::NoWait).expect("primed objects are available"))
        .collect::<Vec<_>>();

    assert!(pool.get(WaitMode::NoWait).is_none());

    // A returned object is handed out again, from the same slot.
    pool.put(objects[1]);
    let again = pool.get(WaitMode::NoWait).expect("an object was just returned");
    assert_eq!(again.as_ptr(), objects[1].as_ptr());

    pool.put(again);
    for object in [objects[0], objects[2], objects[3]] {
        pool.put(object);
    }

    pool.destroy();

    let stats = pages.stats();
    assert!(stats.acquired_blocks > 0);
    assert_eq!(stats.acquired_blocks, stats.released_blocks);
    assert_eq!(stats.bytes_in_use, 0);
}

#[test]
fn free_count_never_exceeds_high_water() {
    let pool = Pool::builder()
        .object_size(100)
        .high_water(50)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let mut held = Vec::new();

    for round in 0..20 {
        assert!(pool.prime(7) <= 7);
        assert!(pool.free_count() <= pool.high_water());

        for _ in 0..round % 5 {
            if let Some(object) = pool.get(WaitMode::NoWait) {
                held.push(object);
            }
        }

        if round % 3 == 0 {
            for object in held.drain(..) {
                pool.put(object);
            }
        }

        let stats = pool.stats();
        assert!(stats.carved <= 50);
        assert_eq!(stats.free + stats.outstanding, stats.carved);
        assert_eq!(stats.free, pool.free_count());
    }

    for object in held {
        pool.put(object);
    }
}

#[test]
fn round_trip_returns_same_address() {
    let pool = Pool::builder()
        .object_size(40)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let warm = (0..3)
        .map(|_| pool.get(WaitMode::NoWait).unwrap())
        .collect::<Vec<_>>();

    for _ in 0..10 {
        let object = pool.get(WaitMode::CanWait).unwrap();
        let addr = object.as_ptr();
        pool.put(object);

        let next = pool.get(WaitMode::CanWait).unwrap();
        assert_eq!(next.as_ptr(), addr);
        assert_eq!(next.size(), 40);
        pool.put(next);
    }

    for object in warm {
        pool.put(object);
    }
}

#[test]
fn objects_are_type_stable_across_reuse() {
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Vnode {
        id: u64,
        refs: u32,
    }

    let pool = Pool::builder()
        .layout_of::<Vnode>()
        .name("vnode")
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let object = pool.get(WaitMode::NoWait).unwrap();
    // SAFETY: The object is checked out to us and laid out for a Vnode.
    unsafe {
        object.cast::<Vnode>().write(Vnode { id: 7, refs: 1 });
    }
    pool.put(object);

    let object = pool.get(WaitMode::NoWait).unwrap();
    // SAFETY: As above.
    unsafe {
        object.cast::<Vnode>().write(Vnode { id: 8, refs: 2 });
        assert_eq!(object.cast::<Vnode>().read(), Vnode { id: 8, refs: 2 });
    }
    pool.put(object);
}

#[test]
fn registry_publishes_pools_until_destroyed() {
    let registry = isolated_registry();

    let mbufs = Pool::builder()
        .object_size(256)
        .high_water(32)
        .name("mbuf")
        .alloc_tag(AllocTag::new("network"))
        .registry(&registry)
        .build()
        .unwrap();
    let vnodes = Pool::builder()
        .object_size(192)
        .name("vnode")
        .registry(&registry)
        .build()
        .unwrap();

    mbufs.prime(5);

    let listed = registry.list();
    assert_eq!(listed.len(), 2);

    let mbuf_info = listed.iter().find(|info| info.name == "mbuf").unwrap();
    assert_eq!(mbuf_info.id, mbufs.id());
    assert_eq!(mbuf_info.object_size, 256);
    assert_eq!(mbuf_info.free_count, 5);
    assert_eq!(mbuf_info.high_water, 32);

    mbufs.destroy();
    let listed = registry.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "vnode");

    drop(vnodes);
    assert!(registry.is_empty());
}

#[test]
fn pools_share_a_store_and_are_accounted_by_tag() {
    const NET: AllocTag = AllocTag::new("network");
    const FS: AllocTag = AllocTag::new("filesystem");

    let arena = Arc::new(PageArena::new(8));
    let store: Arc<dyn PageStore> = Arc::<PageArena>::clone(&arena);
    let registry = isolated_registry();

    let net = Pool::builder()
        .object_size(2048)
        .alloc_tag(NET)
        .page_store(Arc::clone(&store))
        .registry(&registry)
        .build()
        .unwrap();
    let fs = Pool::builder()
        .object_size(512)
        .alloc_tag(FS)
        .page_store(Arc::clone(&store))
        .registry(&registry)
        .build()
        .unwrap();

    assert_eq!(net.prime(6), 6);
    assert_eq!(fs.prime(8), 8);

    assert_eq!(arena.bytes_in_use_by(NET), 3 * 4096);
    assert_eq!(arena.bytes_in_use_by(FS), 4096);
    assert_eq!(arena.free_pages(), 4);

    // The arena runs out: the pools cannot grow beyond what it holds.
    assert_eq!(net.prime(100), 8);
    assert_eq!(arena.free_pages(), 0);
    assert_eq!(fs.prime(1), 0);

    drop(net);
    assert_eq!(arena.free_pages(), 7);
    assert_eq!(fs.prime(8), 8);
}

#[test]
fn budget_exhaustion_fails_without_waiting() {
    let pages = Arc::new(HeapPages::with_budget(4096));
    let store: Arc<dyn PageStore> = Arc::<HeapPages>::clone(&pages);
    let pool = Pool::builder()
        .object_size(4096)
        .page_store(store)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let first = pool.get(WaitMode::NoWait).unwrap();
    assert!(pool.get(WaitMode::NoWait).is_none());
    assert_eq!(pages.stats().failed_acquisitions, 1);

    // Returned objects are served from the free list without asking the store.
    pool.put(first);
    let again = pool.get(WaitMode::NoWait).expect("an object was just returned");
    assert_eq!(again.as_ptr(), first.as_ptr());
    assert_eq!(pages.stats().acquired_blocks, 1);

    pool.put(again);
}

#[test]
fn reclaim_returns_memory_and_pool_regrows() {
    let pages = Arc::new(HeapPages::new());
    let store: Arc<dyn PageStore> = Arc::<HeapPages>::clone(&pages);
    let pool = Pool::builder()
        .object_size(512)
        .low_water(8)
        .page_store(store)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    // Low water primes one block of 8.
    assert_eq!(pool.free_count(), 8);

    let objects = (0..40)
        .map(|_| pool.get(WaitMode::NoWait).unwrap())
        .collect::<Vec<_>>();
    for object in objects {
        pool.put(object);
    }

    assert_eq!(pool.free_count(), 40);
    assert_eq!(pool.reclaim(), 4);
    assert_eq!(pool.free_count(), 8);
    assert_eq!(pages.stats().bytes_in_use, 4096);

    let object = pool.get(WaitMode::NoWait).unwrap();
    pool.put(object);
}

#[test]
fn configuration_errors_are_reported() {
    assert!(matches!(
        Pool::builder().build(),
        Err(Error::ZeroSizedObject)
    ));
    assert!(matches!(
        Pool::builder().object_size(0).build(),
        Err(Error::ZeroSizedObject)
    ));

    let error = Pool::builder()
        .object_size(8)
        .align(6)
        .build()
        .unwrap_err();
    assert!(matches!(error, Error::InvalidLayout { size: 8, align: 6, .. }));
    assert!(error.to_string().contains("align 6"));
}

#[test]
#[should_panic(expected = "returned twice")]
fn double_put_by_address_is_fatal() {
    let pool = Pool::builder()
        .object_size(64)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let object = pool.get(WaitMode::NoWait).unwrap();
    pool.put_ptr(object.as_ptr());
    pool.put_ptr(object.as_ptr());
}

#[test]
#[should_panic(expected = "still checked out")]
fn dropping_pool_with_outstanding_objects_is_fatal() {
    let pool = Pool::builder()
        .object_size(64)
        .registry(&isolated_registry())
        .build()
        .unwrap();

    let _object = pool.get(WaitMode::NoWait).unwrap();
    drop(pool);
}
