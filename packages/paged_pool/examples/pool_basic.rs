//! Basic usage example for `Pool`.
//!
//! Creates a capped pool, primes it, drains it and shows how returned objects are reused.

use paged_pool::{Pool, PoolFlags, WaitMode};

fn main() {
    let pool = Pool::builder()
        .object_size(64)
        .high_water(4)
        .name("example")
        .flags(PoolFlags::WAIT_OK | PoolFlags::MALLOC_OK)
        .build()
        .expect("the configuration is valid");

    let added = pool.prime(4);
    println!("Primed {added} objects, {} free", pool.free_count());

    let objects = (0..4)
        .map(|_| pool.get(WaitMode::NoWait).expect("the pool was primed"))
        .collect::<Vec<_>>();

    for object in &objects {
        println!("Checked out object at {:p}", object.as_ptr());
    }

    match pool.get(WaitMode::NoWait) {
        Some(_) => println!("Unexpectedly got a fifth object"),
        None => println!("Fifth object refused: the pool is at its high-water mark"),
    }

    pool.put(objects[0]);
    let reused = pool.get(WaitMode::NoWait).expect("an object was just returned");
    println!(
        "Returned {:p} and got {:p} back",
        objects[0].as_ptr(),
        reused.as_ptr()
    );

    pool.put(reused);
    for object in objects.into_iter().skip(1) {
        pool.put(object);
    }

    println!("{:#?}", pool.stats());
}
