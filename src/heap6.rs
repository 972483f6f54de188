use std::{fmt, mem, ptr::NonNull};

use crate::{
    header::Header,
    heap::{Heap, HeapStats, Provide, RegionError},
    list::LinkedList,
    Pointer,
};

/// Call site and size of one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address handed out to the caller.
    pub address: NonNull<u8>,
    /// Requested size in bytes.
    pub size: usize,
    /// Source file of the call site, `None` for plain [`Heap::alloc`].
    pub file: Option<&'static str>,
    pub line: u32,
}

/// Record kept in front of every block.
#[derive(Debug, Clone, Copy)]
struct Trace {
    file: Option<&'static str>,
    line: u32,
    size: usize,
}

const TRACE_HEADER_SIZE: usize = mem::size_of::<Header<Trace>>();

/// Wraps any heap and remembers every live allocation together with the
/// place in the source code that requested it:
///
/// ```text
/// +---------------+-------------+    +---------------+-------------+
/// | Header<Trace> | user bytes  | -> | Header<Trace> | user bytes  | -> ...
/// +---------------+-------------+    +---------------+-------------+
/// ```
///
/// Newest allocations are first in the list. [`Heap::report`] prints every
/// allocation that was never freed before the report of the inner heap,
/// which makes leaks easy to spot. Allocation policy is entirely up to the
/// inner heap.
pub struct Heap6<H> {
    inner: H,
    live: LinkedList<Trace>,
}

impl<H: Heap> Heap6<H> {
    pub const fn new(inner: H) -> Self {
        Self {
            inner,
            live: LinkedList::new(),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Number of allocations not freed yet.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Live allocations, newest first.
    pub fn live(&self) -> impl Iterator<Item = Allocation> + '_ {
        // Every node on the list is the header of a block we handed out and
        // which is still owned by the inner heap.
        unsafe { self.live.iter() }.map(|node| unsafe {
            let Trace { file, line, size } = node.as_ref().data;
            Allocation {
                address: Header::content_address_of(node),
                size,
                file,
                line,
            }
        })
    }

    unsafe fn record(&mut self, base: NonNull<u8>, trace: Trace) -> NonNull<u8> {
        let node = self.live.push_front(trace, base);
        log::trace!("tracing {} bytes at {node:p} from {:?}:{}", trace.size, trace.file, trace.line);
        Header::content_address_of(node)
    }

    unsafe fn alloc_traced(&mut self, trace: Trace) -> Pointer<u8> {
        let base = self.inner.alloc(trace.size.checked_add(TRACE_HEADER_SIZE)?)?;
        Some(self.record(base, trace))
    }
}

impl<H: Heap> Provide for Heap6<H> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.inner.provide_memory(region, size)
    }
}

impl<H: Heap> Heap for Heap6<H> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        self.alloc_traced(Trace {
            file: None,
            line: 0,
            size,
        })
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        let node = Header::<Trace>::from_content_address(address);
        self.live.remove(node);
        self.inner.free(node.cast());
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let node = Header::<Trace>::from_content_address(address);
        let total = new_size.checked_add(TRACE_HEADER_SIZE)?;

        // The inner heap may move the block, and the header with it, so it
        // can't stay linked while that happens.
        self.live.remove(node);

        let Some(base) = self.inner.realloc(node.cast(), total) else {
            self.live.link_front(node);
            return None;
        };

        let node = base.cast::<Header<Trace>>();
        (*node.as_ptr()).data.size = new_size;
        self.live.link_front(node);

        Some(Header::content_address_of(node))
    }

    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        let node = Header::<Trace>::from_content_address(address);
        self.inner.usable_size(node.cast()) - TRACE_HEADER_SIZE
    }

    fn stats(&self) -> HeapStats {
        let mut stats = self.inner.stats();
        stats.live_blocks = self.live.len();
        stats
    }

    fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "{} live allocations:", self.live.len())?;

        for allocation in self.live() {
            let Allocation { address, size, file, line } = allocation;
            match file {
                Some(file) => writeln!(out, "  {address:p} {size:>8} bytes from {file}:{line}")?,
                None => writeln!(out, "  {address:p} {size:>8} bytes from unknown")?,
            }
        }

        self.inner.report(out)
    }

    unsafe fn trace_alloc(&mut self, size: usize, file: &'static str, line: u32) -> Pointer<u8> {
        self.alloc_traced(Trace {
            file: Some(file),
            line,
            size,
        })
    }
}

/// Calls [`Heap::trace_alloc`] with the current file and line.
///
/// ```rust
/// use heapkit::{trace_alloc, Fit, Heap1, Heap6, NoRefill, PanicOnBroken, Provide};
///
/// let mut memory = vec![0usize; 256];
/// let mut heap = Heap6::new(Heap1::new(Fit::First, NoRefill, PanicOnBroken));
///
/// unsafe {
///     let region = std::ptr::NonNull::new(memory.as_mut_ptr().cast()).unwrap();
///     heap.provide_memory(region, memory.len() * std::mem::size_of::<usize>()).unwrap();
///
///     let address = trace_alloc!(&mut heap, 64).unwrap();
///     let leak = heap.live().next().unwrap();
///     assert_eq!(leak.address, address);
///     assert_eq!(leak.file, Some(file!()));
/// }
/// ```
#[macro_export]
macro_rules! trace_alloc {
    ($heap:expr, $size:expr) => {
        $crate::Heap::trace_alloc($heap, $size, ::core::file!(), ::core::line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::{NoRefill, PanicOnBroken},
        testing::{check, fill, Arena},
        Fit, Heap1, Heap3, Heap5,
    };

    fn traced(arena: &mut Arena) -> Heap6<Heap1> {
        let mut heap = Heap6::new(Heap1::new(Fit::First, NoRefill, PanicOnBroken));
        unsafe { heap.provide_memory(arena.start(), arena.size()).unwrap() };
        heap
    }

    #[test]
    fn records_call_sites() {
        let mut arena = Arena::new(4096);
        let mut heap = traced(&mut arena);

        unsafe {
            let a = heap.trace_alloc(10, "net.rs", 42).unwrap();
            let b = heap.alloc(20).unwrap();
            let line = line!() + 1;
            let c = crate::trace_alloc!(&mut heap, 30).unwrap();

            let live: Vec<_> = heap.live().collect();
            assert_eq!(
                live,
                [
                    Allocation { address: c, size: 30, file: Some(file!()), line },
                    Allocation { address: b, size: 20, file: None, line: 0 },
                    Allocation { address: a, size: 10, file: Some("net.rs"), line: 42 },
                ]
            );

            heap.free(b);
            assert_eq!(heap.live_count(), 2);
            assert!(heap.live().all(|allocation| allocation.address != b));

            heap.free(a);
            heap.free(c);
        }

        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn realloc_moves_the_record() {
        let mut arena = Arena::new(4096);
        let mut heap = traced(&mut arena);

        unsafe {
            let a = heap.trace_alloc(16, "a.rs", 1).unwrap();
            let b = heap.trace_alloc(16, "b.rs", 2).unwrap();
            fill(a, 16, 9);

            // b blocks growth in place, so a has to move.
            let moved = heap.realloc(a, 400).unwrap();
            assert_ne!(moved, a);
            assert!(check(moved, 16, 9));
            assert!(heap.usable_size(moved) >= 400);

            let record = heap.live().find(|allocation| allocation.address == moved).unwrap();
            assert_eq!((record.size, record.file, record.line), (400, Some("a.rs"), 1));
            assert_eq!(heap.live_count(), 2);

            heap.free(b);
            heap.free(moved);
        }

        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn failed_realloc_keeps_the_record() {
        let mut arena = Arena::new(512);
        let mut heap = traced(&mut arena);

        unsafe {
            let a = heap.trace_alloc(32, "a.rs", 7).unwrap();
            assert!(heap.realloc(a, 10_000).is_none());

            let live: Vec<_> = heap.live().collect();
            assert_eq!(live.len(), 1);
            assert_eq!((live[0].address, live[0].size), (a, 32));

            heap.free(a);
        }
    }

    #[test]
    fn report_lists_leaks_before_inner_report() {
        let mut arena = Arena::new(4096);
        let mut heap = traced(&mut arena);

        unsafe {
            heap.trace_alloc(24, "leaky.rs", 99).unwrap();
            heap.alloc(8).unwrap();
        }

        let mut report = String::new();
        heap.report(&mut report).unwrap();

        let leaks = report.find("2 live allocations:").unwrap();
        let leak = report.find("bytes from leaky.rs:99").unwrap();
        let unknown = report.find("bytes from unknown").unwrap();
        let totals = report.find("total free:").unwrap();
        assert!(leaks < unknown && unknown < leak && leak < totals);

        assert_eq!(heap.stats().live_blocks, 2);
    }

    #[test]
    fn wraps_other_wrappers() {
        let mut arena = Arena::new(8192);
        let mut heap = Heap6::new(Heap5::new(Heap3::new(NoRefill, PanicOnBroken), PanicOnBroken));

        unsafe {
            heap.provide_memory(arena.start(), arena.size()).unwrap();

            let a = heap.trace_alloc(100, "stack.rs", 3).unwrap();
            fill(a, 100, 1);
            assert_eq!(heap.usable_size(a), 100);

            let a = heap.realloc(a, 1000).unwrap();
            assert!(check(a, 100, 1));
            assert_eq!(heap.live().next().map(|allocation| allocation.size), Some(1000));

            heap.free(a);
        }

        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.stats().free_blocks, 1);
    }
}
