//! The contract every heap variant in this crate implements. A heap never
//! asks anybody for memory on its own: somebody has to donate regions with
//! [`Provide::provide_memory`] and, when a request can't be satisfied, the
//! heap asks its [`OnFull`] handler to donate more. Internal corruption that
//! a variant is able to detect goes to its [`OnBroken`] handler, which never
//! returns.
//!
//! None of the heaps lock anything. Callers that share a heap between
//! threads or interrupt contexts must serialize access themselves, see
//! [`crate::Locked`].

use std::{fmt, ptr::NonNull};

use thiserror::Error;

use crate::{
    align::is_word_aligned,
    tree::TreeFault,
    Pointer,
};

/// Number of power-of-two buckets in [`HeapStats::histogram`].
pub const HISTOGRAM_BUCKETS: usize = usize::BITS as usize;

/// Reasons for rejecting a donated region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region at {address:#x} is not word aligned")]
    Misaligned { address: usize },
    #[error("region size {size} is not a multiple of the word size")]
    BadSize { size: usize },
    #[error("region of {size} bytes is smaller than the minimum of {minimum}")]
    TooSmall { size: usize, minimum: usize },
    #[error("region at {address:#x} of {size} bytes touches address zero")]
    TouchesZero { address: usize, size: usize },
    #[error("region at {address:#x} of {size} bytes overlaps memory the heap already manages")]
    Overlap { address: usize, size: usize },
}

/// Internal corruption reported to [`OnBroken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("guard bytes before block {address:#x} were overwritten")]
    GuardUnderrun { address: usize },
    #[error("guard bytes after block {address:#x} were overwritten")]
    GuardOverrun { address: usize },
    #[error("block {address:#x} freed twice")]
    DoubleFree { address: usize },
    #[error("pointer {address:#x} does not belong to this heap")]
    OutOfBounds { address: usize },
    #[error("block header at {address:#x} is corrupt")]
    CorruptHeader { address: usize },
    #[error("free block tree is corrupt: {0}")]
    Tree(#[from] TreeFault),
}

/// Anything memory can be donated to. This is split from [`Heap`] so that
/// [`OnFull`] handlers can receive the heap that is currently allocating.
pub trait Provide {
    /// Donates `size` bytes starting at `region`. The heap owns that memory
    /// from now on.
    ///
    /// # Safety
    ///
    /// `region..region + size` must be valid for reads and writes, must not
    /// be used by anybody else while the heap lives, and must not overlap
    /// any region donated before.
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize)
        -> Result<(), RegionError>;
}

/// Common allocator contract. Pointers returned by [`Heap::alloc`] are word
/// aligned and point right after an invisible header.
pub trait Heap: Provide {
    /// Returns a pointer to at least `size` usable bytes or `None` once the
    /// [`OnFull`] handler has declined to donate more memory.
    ///
    /// # Safety
    ///
    /// The heap touches memory that was donated through
    /// [`Provide::provide_memory`], so all donations must still be valid.
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8>;

    /// Gives a block back to the heap.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this heap and not freed since.
    unsafe fn free(&mut self, address: NonNull<u8>);

    /// Resizes a block keeping the first `min(old, new_size)` bytes. Returns
    /// `None` if no block of `new_size` bytes can be found, in which case
    /// `address` is still valid and untouched.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::free`].
    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8>;

    /// Number of bytes the caller may use at `address`, which can be more
    /// than what was requested.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::free`].
    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize;

    /// Snapshot of the free memory.
    fn stats(&self) -> HeapStats;

    /// Writes a human readable report. Wrappers may print more than
    /// [`Heap::stats`], see [`crate::Heap6`].
    fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self.stats())
    }

    /// Allocation tagged with the call site. Only tracing wrappers care.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::alloc`].
    unsafe fn trace_alloc(&mut self, size: usize, _file: &'static str, _line: u32) -> Pointer<u8> {
        self.alloc(size)
    }
}

/// Called when a heap runs out of memory. Returning `true` means memory
/// was donated to `heap` and the allocation should be retried.
pub trait OnFull {
    fn heap_full(&mut self, heap: &mut dyn Provide, requested: usize) -> bool;
}

/// Handler that never donates anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefill;

impl OnFull for NoRefill {
    fn heap_full(&mut self, _: &mut dyn Provide, _: usize) -> bool {
        false
    }
}

impl<F: FnMut(&mut dyn Provide, usize) -> bool> OnFull for F {
    fn heap_full(&mut self, heap: &mut dyn Provide, requested: usize) -> bool {
        self(heap, requested)
    }
}

/// Called for unrecoverable internal corruption. Must not return.
pub trait OnBroken {
    fn broken(&mut self, fault: Fault) -> !;
}

/// Panics with the fault description.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicOnBroken;

impl OnBroken for PanicOnBroken {
    fn broken(&mut self, fault: Fault) -> ! {
        panic!("heap corruption: {fault}")
    }
}

/// Aborts the process without unwinding.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnBroken;

impl OnBroken for AbortOnBroken {
    fn broken(&mut self, fault: Fault) -> ! {
        log::error!("heap corruption: {fault}");
        std::process::abort()
    }
}

/// Logs and forwards `fault` to `handler`.
pub(crate) fn report_fault<B: OnBroken>(handler: &mut B, fault: Fault) -> ! {
    log::error!("heap corruption detected: {fault}");
    handler.broken(fault)
}

/// Validates a donated region. `minimum` is the smallest region the variant
/// can turn into at least one free block.
pub(crate) fn check_region(
    region: NonNull<u8>,
    size: usize,
    minimum: usize,
) -> Result<(), RegionError> {
    let address = region.as_ptr() as usize;

    if !is_word_aligned(address) {
        return Err(RegionError::Misaligned { address });
    }

    if !is_word_aligned(size) {
        return Err(RegionError::BadSize { size });
    }

    if size < minimum {
        return Err(RegionError::TooSmall { size, minimum });
    }

    // The end of the region has to be representable, otherwise the region
    // would wrap around and contain address zero.
    match address.checked_add(size) {
        Some(end) if end != 0 => Ok(()),
        _ => Err(RegionError::TouchesZero { address, size }),
    }
}

/// Free memory summary returned by [`Heap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Total bytes in free blocks, headers included.
    pub free_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
    /// `histogram[i]` counts free blocks of size `2^i..2^(i+1)`.
    pub histogram: [usize; HISTOGRAM_BUCKETS],
    /// Highest end address ever handed out, 0 if nothing was allocated.
    pub high_water: usize,
    /// Number of full coalesce passes, for variants that coalesce lazily.
    pub coalesces: usize,
    /// Outstanding allocations, for variants that track them.
    pub live_blocks: usize,
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            free_bytes: 0,
            free_blocks: 0,
            largest_free: 0,
            histogram: [0; HISTOGRAM_BUCKETS],
            high_water: 0,
            coalesces: 0,
            live_blocks: 0,
        }
    }

    /// Accounts one free block of `size` bytes.
    pub fn record_free(&mut self, size: usize) {
        self.free_bytes += size;
        self.free_blocks += 1;
        self.largest_free = self.largest_free.max(size);
        if size > 0 {
            self.histogram[size.ilog2() as usize] += 1;
        }
    }

    /// Adds the free memory of `other` to `self`, keeping our own high-water
    /// mark.
    pub fn absorb(&mut self, other: &HeapStats) {
        self.free_bytes += other.free_bytes;
        self.free_blocks += other.free_blocks;
        self.largest_free = self.largest_free.max(other.largest_free);
        for (mine, theirs) in self.histogram.iter_mut().zip(other.histogram.iter()) {
            *mine += theirs;
        }
        self.coalesces += other.coalesces;
        self.live_blocks += other.live_blocks;
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "free blocks by size:")?;
        for (bit, count) in self.histogram.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let low = 1usize << bit;
            let high = low.saturating_sub(1).saturating_add(low);
            writeln!(f, "  {low:>10} .. {high:<10} {count}")?;
        }
        writeln!(
            f,
            "total free: {} bytes in {} blocks (largest {})",
            self.free_bytes, self.free_blocks, self.largest_free
        )?;
        if self.coalesces > 0 {
            writeln!(f, "coalesce passes: {}", self.coalesces)?;
        }
        if self.live_blocks > 0 {
            writeln!(f, "live allocations: {}", self.live_blocks)?;
        }
        writeln!(f, "high water mark: {:#x}", self.high_water)
    }
}

/// Remembers the end of a block as the high-water mark if it is the
/// highest one so far.
#[inline]
pub(crate) fn raise_high_water(high_water: &mut usize, block: NonNull<u8>, size: usize) {
    *high_water = (*high_water).max(block.as_ptr() as usize + size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::WORD;

    const fn words(count: usize) -> usize {
        count * WORD
    }

    #[test]
    fn region_validation() {
        let mut memory = vec![0usize; 64];
        let region = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();

        assert_eq!(check_region(region, words(64), words(4)), Ok(()));
        assert_eq!(
            check_region(region, words(64) - 1, words(4)),
            Err(RegionError::BadSize { size: words(64) - 1 })
        );
        assert_eq!(
            check_region(region, words(2), words(4)),
            Err(RegionError::TooSmall { size: words(2), minimum: words(4) })
        );

        let misaligned = unsafe { NonNull::new_unchecked(region.as_ptr().add(1)) };
        assert!(matches!(
            check_region(misaligned, words(8), words(4)),
            Err(RegionError::Misaligned { .. })
        ));

        let top = NonNull::new((usize::MAX - WORD + 1) as *mut u8).unwrap();
        assert!(matches!(
            check_region(top, words(4), words(4)),
            Err(RegionError::TouchesZero { .. })
        ));
    }

    #[test]
    fn histogram_buckets() {
        let mut stats = HeapStats::new();
        stats.record_free(64);
        stats.record_free(100);
        stats.record_free(4096);

        assert_eq!(stats.histogram[6], 2);
        assert_eq!(stats.histogram[12], 1);
        assert_eq!(stats.free_bytes, 64 + 100 + 4096);
        assert_eq!(stats.free_blocks, 3);
        assert_eq!(stats.largest_free, 4096);

        let report = stats.to_string();
        assert!(report.contains("total free: 4260 bytes in 3 blocks"));
    }

    #[test]
    fn closures_are_full_handlers() {
        struct Nothing;
        impl Provide for Nothing {
            unsafe fn provide_memory(&mut self, _: NonNull<u8>, _: usize) -> Result<(), RegionError> {
                Ok(())
            }
        }

        let mut calls = 0;
        let mut handler = |_: &mut dyn Provide, requested: usize| {
            calls += 1;
            requested < 100
        };

        assert!(handler.heap_full(&mut Nothing, 10));
        assert!(!handler.heap_full(&mut Nothing, 1000));
        assert_eq!(calls, 2);
        assert!(!NoRefill.heap_full(&mut Nothing, 1));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn panic_handler_describes_fault() {
        PanicOnBroken.broken(Fault::DoubleFree { address: 0x1000 });
    }
}
