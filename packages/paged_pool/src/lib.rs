//! A type-stable pool of fixed-size objects carved from page-granular backing memory.
//!
//! This crate provides [`Pool`], an allocator that hands out equally sized objects from a cache
//! of free objects and refills that cache in whole blocks of pages obtained from a [`PageStore`].
//! Objects are only ever reused within the pool they came from, and returning an object never
//! gives memory back to the store, so the common path of `get` and `put` is a pop or push on a
//! free list under a short-held lock.
//!
//! # Key Features
//!
//! - **Bounded growth**: a high-water mark caps the objects a pool carves from backing memory
//! - **Blocking or non-blocking allocation**: callers choose per call, pools opt in with
//!   [`PoolFlags::WAIT_OK`], and deadlines are supported via [`WaitMode::Until`]
//! - **Pluggable backing memory**: [`HeapPages`] for general heap memory, [`PageArena`] for a
//!   dedicated region reserved up front, or any custom [`PageStore`]
//! - **Misuse detection**: foreign objects, double returns and stale handles panic instead of
//!   corrupting the free list, and optional poisoning catches writes to free objects
//! - **Explicit reclamation**: [`Pool::reclaim()`] releases idle blocks down to a low-water mark
//! - **Introspection**: per-pool [`PoolStats`] and a [`PoolRegistry`] listing all live pools
//!
//! # Examples
//!
//! ```
//! use paged_pool::{Pool, WaitMode};
//!
//! let pool = Pool::builder()
//!     .layout_of::<[u64; 4]>()
//!     .high_water(1024)
//!     .name("packet-headers")
//!     .build()
//!     .unwrap();
//!
//! let object = pool.get(WaitMode::NoWait).expect("pool is far below its high-water mark");
//!
//! // SAFETY: The object is checked out to us and sized and aligned for a [u64; 4].
//! unsafe {
//!     object.cast::<[u64; 4]>().write([1, 2, 3, 4]);
//! }
//!
//! pool.put(object);
//! assert_eq!(pool.free_count(), pool.stats().carved);
//! ```
//!
//! ## Waiting for objects
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use paged_pool::{Pool, WaitMode};
//!
//! let pool = Arc::new(Pool::builder().object_size(64).high_water(1).build().unwrap());
//!
//! let object = pool.get(WaitMode::NoWait).unwrap();
//!
//! let waiter = thread::spawn({
//!     let pool = Arc::clone(&pool);
//!     move || {
//!         // Blocks until the object is returned below.
//!         let object = pool.get(WaitMode::CanWait).unwrap();
//!         pool.put(object);
//!     }
//! });
//!
//! pool.put(object);
//! waiter.join().unwrap();
//! ```

mod block;
mod builder;
mod error;
mod flags;
mod free_list;
mod geometry;
mod heap_pages;
mod object;
mod page_arena;
mod pool;
mod registry;
mod stats;
mod store;
mod tag;

pub(crate) use block::*;
pub use builder::*;
pub use error::*;
pub use flags::*;
pub(crate) use free_list::*;
pub(crate) use geometry::*;
pub use heap_pages::HeapPages;
pub use object::*;
pub use page_arena::*;
pub use pool::Pool;
pub use registry::*;
pub use stats::PoolStats;
pub(crate) use stats::Counters;
pub use store::{BackingBlock, PageStore, StoreKind, StoreStats};
pub(crate) use store::Accounting;
pub use tag::*;
