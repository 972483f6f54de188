use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    alignment::{alloc_aligned, free_aligned, needs_back_pointer, realloc_aligned},
    heap::{Heap, HeapStats},
    Pointer,
};

/// Puts any heap behind a [`Mutex`] and implements [`GlobalAlloc`] on top of
/// it. The heaps themselves never lock anything, this is the place where
/// concurrent callers get serialized.
///
/// The heaps log through [`log`] while the lock is held. When `Locked` is
/// the global allocator, a logger that allocates re-enters the lock from the
/// same thread and deadlocks. Either install no logger, one that never
/// allocates, or cap the level with the `log` crate's `max_level_off`
/// feature (or `release_max_level_off` for release builds), which compiles
/// the calls out.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use std::alloc::{GlobalAlloc, Layout};
///
/// use heapkit::{Heap3, Locked, OsPages, PanicOnBroken};
///
/// let allocator = Locked::new(Heap3::new(OsPages::new(), PanicOnBroken));
/// let layout = Layout::from_size_align(128, 64).unwrap();
///
/// unsafe {
///     let address = allocator.alloc(layout);
///     assert!(!address.is_null());
///     assert_eq!(address as usize % 64, 0);
///     allocator.dealloc(address, layout);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use heapkit::{Heap7, Locked, OsPages, AbortOnBroken};
///
/// #[global_allocator]
/// static ALLOCATOR: Locked<Heap7<OsPages, AbortOnBroken>> =
///     Locked::new(Heap7::new(OsPages::new(), AbortOnBroken));
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Locked<H> {
    heap: Mutex<H>,
}

// The heap only touches memory it owns and the mutex serializes all access.
unsafe impl<H: Heap> Sync for Locked<H> {}

impl<H: Heap> Locked<H> {
    pub const fn new(heap: H) -> Self {
        Self {
            heap: Mutex::new(heap),
        }
    }

    /// Runs `f` with the heap locked. `None` if another thread panicked
    /// while holding the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut H) -> R) -> Option<R> {
        let mut heap = self.heap.lock().ok()?;
        Some(f(&mut heap))
    }

    /// Snapshot of the free memory of the inner heap.
    pub fn stats(&self) -> Option<HeapStats> {
        self.with(|heap| heap.stats())
    }
}

#[inline]
fn into_raw(address: Pointer<u8>) -> *mut u8 {
    address.map_or(ptr::null_mut(), NonNull::as_ptr)
}

unsafe impl<H: Heap> GlobalAlloc for Locked<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Ok(mut heap) = self.heap.lock() else {
            return ptr::null_mut();
        };

        let address = if needs_back_pointer(layout.align()) {
            alloc_aligned(&mut *heap, layout.size(), layout.align())
        } else {
            heap.alloc(layout.size())
        };

        into_raw(address)
    }

    unsafe fn dealloc(&self, address: *mut u8, layout: Layout) {
        let (Ok(mut heap), Some(address)) = (self.heap.lock(), NonNull::new(address)) else {
            return;
        };

        if needs_back_pointer(layout.align()) {
            free_aligned(&mut *heap, address)
        } else {
            heap.free(address)
        }
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Ok(mut heap), Some(address)) = (self.heap.lock(), NonNull::new(address)) else {
            return ptr::null_mut();
        };

        let new_address = if needs_back_pointer(layout.align()) {
            realloc_aligned(&mut *heap, address, layout.size(), new_size, layout.align())
        } else {
            heap.realloc(address, new_size)
        };

        into_raw(new_address)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync,
        thread::{self, ThreadId},
    };

    use super::*;
    use crate::{
        heap::{NoRefill, PanicOnBroken, Provide},
        testing::Arena,
        Fit, Heap1, Heap3, Heap7, OsPages,
    };

    #[test]
    fn arena_backed_allocator() {
        let mut arena = Arena::new(16 * 1024);
        let allocator = Locked::new(Heap1::new(Fit::Best, NoRefill, PanicOnBroken));

        let initial = allocator
            .with(|heap| unsafe {
                heap.provide_memory(arena.start(), arena.size()).unwrap();
                heap.stats()
            })
            .unwrap();

        unsafe {
            let small = Layout::array::<u8>(24).unwrap();
            let aligned = Layout::from_size_align(200, 128).unwrap();

            let a = allocator.alloc(small);
            let b = allocator.alloc(aligned);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(b as usize % 128, 0);

            a.write_bytes(69, small.size());
            b.write_bytes(42, aligned.size());

            let a = allocator.realloc(a, small, 1000);
            let b = allocator.realloc(b, aligned, 2000);
            assert_eq!(b as usize % 128, 0);
            assert!((0..small.size()).all(|i| *a.add(i) == 69));
            assert!((0..aligned.size()).all(|i| *b.add(i) == 42));

            allocator.dealloc(a, Layout::array::<u8>(1000).unwrap());
            allocator.dealloc(b, Layout::from_size_align(2000, 128).unwrap());

            // Too big for the arena and nobody refills it.
            assert!(allocator.alloc(Layout::array::<u8>(1 << 20).unwrap()).is_null());
        }

        let stats = allocator.stats().unwrap();
        assert_eq!((stats.free_bytes, stats.free_blocks), (initial.free_bytes, 1));
    }

    /// All threads allocate at the same time, then wait and free at the same
    /// time.
    #[test]
    fn multiple_threads_synchronized_allocs_and_deallocs() {
        let allocator = Locked::new(Heap3::new(OsPages::new(), PanicOnBroken));

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let num_elements = 1024;
                    let layout = Layout::array::<ThreadId>(num_elements).unwrap();
                    let addr = allocator.alloc(layout).cast::<ThreadId>();
                    assert!(!addr.is_null());
                    let id = thread::current().id();

                    for i in 0..num_elements {
                        addr.add(i).write(id);
                    }

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_elements {
                        assert_eq!(*addr.add(i), id);
                    }

                    allocator.dealloc(addr.cast(), layout);
                });
            }
        });

        let shape = allocator.with(|heap| heap.verify().unwrap()).unwrap();
        assert_eq!(shape.values, allocator.stats().unwrap().free_blocks);
    }

    /// Heap7 takes mapped chunks wherever the OS puts them.
    #[test]
    fn heap7_grows_with_os_pages() {
        let allocator = Locked::new(Heap7::new(OsPages::new(), PanicOnBroken));
        let layout = Layout::array::<u8>(100_000).unwrap();

        unsafe {
            let blocks: Vec<_> = (0..32).map(|_| allocator.alloc(layout)).collect();
            assert!(blocks.iter().all(|block| !block.is_null()));

            for (i, block) in blocks.iter().enumerate() {
                block.write_bytes(i as u8, layout.size());
            }
            for (i, block) in blocks.iter().enumerate() {
                assert!((0..layout.size()).all(|j| *block.add(j) == i as u8));
            }
            for block in blocks {
                allocator.dealloc(block, layout);
            }
        }

        assert_eq!(allocator.with(|heap| heap.check()).unwrap(), Ok(()));
    }

    /// Threads allocate and free interchangeably with different sizes and
    /// alignments.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_deallocs() {
        let mut arena = Arena::new(4 << 20);
        let allocator = Locked::new(Heap7::new(NoRefill, PanicOnBroken));
        allocator
            .with(|heap| unsafe { heap.provide_memory(arena.start(), arena.size()) })
            .unwrap()
            .unwrap();

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let layouts = [(16, 8), (256, 16), (1024, 8), (2048, 64), (4096, 4096)]
                        .map(|(size, align)| Layout::from_size_align(size, align).unwrap());

                    let num_allocs = if cfg!(miri) { 20 } else { 500 };

                    for layout in layouts {
                        barrier.wait();
                        for _ in 0..num_allocs {
                            let addr = allocator.alloc(layout);
                            assert!(!addr.is_null());
                            assert_eq!(addr as usize % layout.align(), 0);
                            for i in 0..layout.size() {
                                *addr.add(i) = (i % 256) as u8;
                            }
                            for i in 0..layout.size() {
                                assert_eq!(*addr.add(i), (i % 256) as u8);
                            }
                            allocator.dealloc(addr, layout);
                        }
                    }
                });
            }
        });

        allocator.with(|heap| heap.coalesce()).unwrap();
        assert_eq!(allocator.with(|heap| heap.check()).unwrap(), Ok(()));
        assert_eq!(allocator.stats().unwrap().free_blocks, 1);
    }
}
