//! Pools shared between threads, including callers that block waiting for objects.

use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use paged_pool::{
    AllocTag, BackingBlock, HeapPages, PageArena, PageStore, Pool, PoolFlags, PoolRegistry,
    StoreKind, WaitMode,
};
use testing::{wait_until, with_watchdog};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

fn capped_pool(object_size: usize, high_water: usize) -> Arc<Pool> {
    Arc::new(
        Pool::builder()
            .object_size(object_size)
            .high_water(high_water)
            .registry(&Arc::new(PoolRegistry::new()))
            .build()
            .unwrap(),
    )
}

fn is_wanted(pool: &Pool) -> bool {
    pool.flags().contains(PoolFlags::WANTED)
}

#[test]
fn blocked_get_is_woken_by_put() {
    with_watchdog(|| {
        let pool = capped_pool(64, 1);
        let held = pool.get(WaitMode::NoWait).unwrap();

        let waiter = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.get(WaitMode::CanWait).map(|object| object.as_ptr().addr())
        });

        assert!(wait_until(SETTLE_TIMEOUT, || is_wanted(&pool)));

        pool.put(held);

        let received = waiter.join().unwrap().expect("waiter receives the returned object");
        assert_eq!(received, held.as_ptr().addr());
        assert!(!is_wanted(&pool));

        pool.put_ptr(held.as_ptr());
    });
}

#[test]
fn each_put_wakes_one_waiter() {
    with_watchdog(|| {
        const WAITERS: usize = 4;

        let pool = capped_pool(64, WAITERS);
        let held = (0..WAITERS)
            .map(|_| pool.get(WaitMode::NoWait).unwrap())
            .collect::<Vec<_>>();

        let served = Arc::new(AtomicUsize::new(0));

        let waiters = (0..WAITERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let served = Arc::clone(&served);
                thread::spawn(move || {
                    let object = pool.get(WaitMode::CanWait).unwrap();
                    served.fetch_add(1, Ordering::SeqCst);
                    object
                })
            })
            .collect::<Vec<_>>();

        assert!(wait_until(SETTLE_TIMEOUT, || {
            pool.stats().waits >= WAITERS as u64
        }));

        for (returned, object) in held.into_iter().enumerate() {
            pool.put(object);

            // Exactly one more waiter gets through per returned object.
            assert!(wait_until(SETTLE_TIMEOUT, || {
                served.load(Ordering::SeqCst) == returned + 1
            }));
        }

        for waiter in waiters {
            pool.put(waiter.join().unwrap());
        }

        assert_eq!(pool.outstanding(), 0);
        assert!(!is_wanted(&pool));
    });
}

#[test]
fn prime_wakes_waiters() {
    with_watchdog(|| {
        let store: Arc<dyn PageStore> = Arc::new(PageArena::new(1));
        let registry = Arc::new(PoolRegistry::new());

        let hog = Pool::builder()
            .object_size(4096)
            .page_store(Arc::clone(&store))
            .registry(&registry)
            .build()
            .unwrap();
        assert_eq!(hog.prime(1), 1);

        let pool = Arc::new(
            Pool::builder()
                .object_size(2048)
                .page_store(Arc::clone(&store))
                .registry(&registry)
                .build()
                .unwrap(),
        );

        let waiters = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.get(WaitMode::CanWait).unwrap())
            })
            .collect::<Vec<_>>();

        assert!(wait_until(SETTLE_TIMEOUT, || pool.stats().waits >= 2));

        // Free the only page, then prime the waiting pool from it.
        hog.destroy();
        assert_eq!(pool.prime(2), 2);

        for waiter in waiters {
            pool.put(waiter.join().unwrap());
        }

        assert_eq!(pool.free_count(), 2);
    });
}

#[test]
fn timed_get_receives_object_before_deadline() {
    with_watchdog(|| {
        let pool = capped_pool(32, 1);
        let held = pool.get(WaitMode::NoWait).unwrap();

        let waiter = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.get(WaitMode::Until(Instant::now() + Duration::from_secs(5)))
        });

        assert!(wait_until(SETTLE_TIMEOUT, || is_wanted(&pool)));
        pool.put(held);

        let object = waiter.join().unwrap().expect("object arrived well before the deadline");
        pool.put(object);

        assert_eq!(pool.stats().failed_gets, 0);
    });
}

#[test]
fn waiters_on_one_pool_ignore_other_pools() {
    with_watchdog(|| {
        let busy = capped_pool(64, 1);
        let other = capped_pool(64, 1);

        let held = busy.get(WaitMode::NoWait).unwrap();

        let waiter = thread::spawn({
            let busy = Arc::clone(&busy);
            move || busy.get(WaitMode::CanWait).unwrap()
        });

        assert!(wait_until(SETTLE_TIMEOUT, || is_wanted(&busy)));

        for _ in 0..10 {
            let object = other.get(WaitMode::NoWait).unwrap();
            other.put(object);
        }

        thread::sleep(Duration::from_millis(20));
        assert!(is_wanted(&busy));
        assert!(!waiter.is_finished());

        busy.put(held);
        busy.put(waiter.join().unwrap());
    });
}

#[test]
fn stress_objects_are_never_shared() {
    with_watchdog(|| {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 2_000;
        const HIGH_WATER: usize = 5;

        let pool = capped_pool(size_of::<usize>() * 4, HIGH_WATER);

        let workers = (0..THREADS)
            .map(|thread_index| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for iteration in 0..ITERATIONS {
                        let object = pool.get(WaitMode::CanWait).unwrap();
                        let words = object.cast::<[usize; 4]>();
                        let stamp = thread_index * ITERATIONS + iteration;

                        // SAFETY: The object is checked out to us and sized for [usize; 4].
                        unsafe {
                            words.write([stamp; 4]);
                        }

                        if iteration % 7 == 0 {
                            thread::yield_now();
                        }

                        // SAFETY: As above. Another holder would have overwritten the stamp.
                        let read_back = unsafe { words.read() };
                        assert_eq!(read_back, [stamp; 4]);

                        pool.put(object);
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.gets, (THREADS * ITERATIONS) as u64);
        assert_eq!(stats.puts, stats.gets);
        assert_eq!(stats.outstanding, 0);
        assert!(stats.carved <= HIGH_WATER);
        assert_eq!(stats.free, stats.carved);
        assert!(!is_wanted(&pool));
    });
}

#[test]
fn contended_waiters_all_make_progress() {
    with_watchdog(|| {
        const THREADS: usize = 6;
        const ROUNDS: usize = 200;

        // A single object passed around between all threads.
        let pool = capped_pool(16, 1);

        let workers = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let object = pool.get(WaitMode::CanWait).unwrap();
                        thread::yield_now();
                        pool.put(object);
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.stats().gets, (THREADS * ROUNDS) as u64);
        assert_eq!(pool.free_count(), 1);
    });
}

/// Supplies the first block from the heap, then makes every later caller wait at a gate inside
/// the store until released, after which the store reports exhaustion.
#[derive(Debug)]
struct GatedStore {
    inner: HeapPages,
    calls: AtomicUsize,
    entered: Barrier,
    release: Barrier,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: HeapPages::new(),
            calls: AtomicUsize::new(0),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

// SAFETY: Every block comes from the inner store, which upholds the contract.
unsafe impl PageStore for GatedStore {
    fn page_size(&self) -> NonZero<usize> {
        self.inner.page_size()
    }

    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn acquire_pages(&self, size: usize, tag: AllocTag) -> Option<BackingBlock> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return self.inner.acquire_pages(size, tag);
        }

        self.entered.wait();
        self.release.wait();
        None
    }

    fn release_pages(&self, block: BackingBlock, tag: AllocTag) {
        self.inner.release_pages(block, tag);
    }
}

#[test]
fn put_during_page_store_call_is_not_lost() {
    with_watchdog(|| {
        let gated = Arc::new(GatedStore::new());
        let store: Arc<dyn PageStore> = Arc::<GatedStore>::clone(&gated);

        // One object per block, so the second get has to ask the store.
        let pool = Arc::new(
            Pool::builder()
                .object_size(4096)
                .page_store(store)
                .registry(&Arc::new(PoolRegistry::new()))
                .build()
                .unwrap(),
        );

        let held = pool.get(WaitMode::NoWait).unwrap();

        let waiter = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.get(WaitMode::CanWait).map(|object| object.as_ptr().addr())
        });

        // The waiter is inside the store with the pool lock released.
        gated.entered.wait();
        assert!(!is_wanted(&pool));
        pool.put(held);
        gated.release.wait();

        let received = waiter
            .join()
            .unwrap()
            .expect("the object returned during the store call is handed out");
        assert_eq!(received, held.as_ptr().addr());
        assert_eq!(pool.stats().waits, 0);

        pool.put_ptr(held.as_ptr());
    });
}
