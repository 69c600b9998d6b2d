//! Several pools sharing a dedicated page arena, with per-tag accounting and reclamation.

use std::sync::Arc;

use paged_pool::{AllocTag, PageArena, PageStore, Pool, PoolFlags, PoolRegistry, WaitMode};

const NETWORK: AllocTag = AllocTag::new("network");
const FILESYSTEM: AllocTag = AllocTag::new("filesystem");

fn main() {
    let arena = Arc::new(PageArena::new(16));
    let store: Arc<dyn PageStore> = Arc::<PageArena>::clone(&arena);
    let registry = PoolRegistry::global();

    // Pools on a dedicated store do not need MALLOC_OK.
    let mbufs = Pool::builder()
        .object_size(256)
        .low_water(32)
        .name("mbuf")
        .alloc_tag(NETWORK)
        .flags(PoolFlags::WAIT_OK)
        .page_store(Arc::clone(&store))
        .registry(&registry)
        .build()
        .expect("the configuration is valid");

    let vnodes = Pool::builder()
        .object_size(1024)
        .name("vnode")
        .alloc_tag(FILESYSTEM)
        .flags(PoolFlags::WAIT_OK)
        .page_store(Arc::clone(&store))
        .registry(&registry)
        .build()
        .expect("the configuration is valid");

    let held = (0..40)
        .map(|_| vnodes.get(WaitMode::NoWait).expect("the arena has room"))
        .collect::<Vec<_>>();

    println!("Arena pages free: {}", arena.free_pages());
    println!("  network:    {} bytes", arena.bytes_in_use_by(NETWORK));
    println!("  filesystem: {} bytes", arena.bytes_in_use_by(FILESYSTEM));

    for info in registry.list() {
        println!(
            "pool {:>8}: {} byte objects, {} free, {} carved",
            info.name, info.object_size, info.free_count, info.stats.carved
        );
    }

    for object in held {
        vnodes.put(object);
    }

    let released = vnodes.reclaim();
    println!("Reclaimed {released} blocks, arena pages free: {}", arena.free_pages());

    mbufs.destroy();
    vnodes.destroy();
    println!("All pools destroyed, arena pages free: {}", arena.free_pages());
}
