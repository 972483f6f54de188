//! A family of intrusive heap allocators that manage memory donated to them
//! by the caller. Every variant implements the same [`Heap`] contract, so
//! they can be swapped or stacked:
//!
//! - [`Heap1`]: address ordered free chain, merged on every free.
//! - [`Heap2`]: unordered free chain, merged lazily when a search fails.
//! - [`Heap3`]: free blocks indexed by two 2-3 trees, O(log n) everything.
//! - [`Heap4`]: size class buckets on top of any other heap.
//! - [`Heap5`]: guard bytes around every block of any other heap.
//! - [`Heap6`]: call site tracking for every block of any other heap.
//! - [`Heap7`]: exact size bins plus an address ordered overflow list.
//!
//! # Examples
//!
//! ```rust
//! use std::ptr::NonNull;
//!
//! use heapkit::{Heap, Heap4, Heap5, Heap7, NoRefill, PanicOnBroken, Provide};
//!
//! let mut memory = vec![0usize; 8192];
//! let region = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
//!
//! // Buckets backed by Heap7, with guards around every block.
//! let backing = Heap7::new(NoRefill, PanicOnBroken);
//! let mut heap = Heap5::new(Heap4::new(backing, NoRefill, PanicOnBroken), PanicOnBroken);
//!
//! unsafe {
//!     heap.provide_memory(region, memory.len() * std::mem::size_of::<usize>()).unwrap();
//!
//!     let address = heap.alloc(24).unwrap();
//!     address.as_ptr().write_bytes(1, 24);
//!     let address = heap.realloc(address, 2000).unwrap();
//!     heap.free(address);
//! }
//!
//! println!("{}", heap.stats());
//! ```

use std::ptr::NonNull;

mod align;
mod alignment;
mod allocator;
mod block;
mod bucket;
mod chain;
mod freelist;
mod header;
mod heap;
mod heap1;
mod heap2;
mod heap3;
mod heap4;
mod heap5;
mod heap6;
mod heap7;
mod list;
mod pages;
mod platform;
mod realloc;
mod region;
mod tree;

#[cfg(test)]
mod testing;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. It is also what every allocation returns, `None` being the null
/// pointer of an exhausted heap.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::{align, WORD};
pub use allocator::Locked;
pub use bucket::{class_of, CLASS_COUNT, CLASS_SIZES};
pub use chain::Fit;
pub use heap::{
    AbortOnBroken, Fault, Heap, HeapStats, NoRefill, OnBroken, OnFull, PanicOnBroken, Provide,
    RegionError, HISTOGRAM_BUCKETS,
};
pub use heap1::Heap1;
pub use heap2::{Heap2, BIG_REQUEST};
pub use heap3::Heap3;
pub use heap4::{Backing, ClassCensus, Heap4};
pub use heap5::{Heap5, GUARD_OVERHEAD, GUARD_SIZE};
pub use heap6::{Allocation, Heap6};
pub use heap7::{Heap7, LARGE_BLOCK, NBINS};
pub use pages::OsPages;
pub use tree::{TreeFault, TreeShape};
