use std::{fmt, ptr::NonNull};

use crate::{
    align::WORD,
    heap::{report_fault, Fault, Heap, HeapStats, OnBroken, PanicOnBroken, Provide, RegionError},
    Pointer,
};

/// Length of each guard.
pub const GUARD_SIZE: usize = 8;

/// Written right before the user bytes.
const PRE_GUARD: [u8; GUARD_SIZE] = [0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED, 0xFA, 0xCE];

/// Written right after the user bytes.
const POST_GUARD: [u8; GUARD_SIZE] = [0xCA, 0xFE, 0xBA, 0xBE, 0x0B, 0xAD, 0xF0, 0x0D];

/// Bytes added to every request.
pub const GUARD_OVERHEAD: usize = WORD + 2 * GUARD_SIZE;

/// Wraps any heap and surrounds every block with guard bytes:
///
/// ```text
/// +---------------+-----------+-----------------+------------+
/// | post guard at | PRE_GUARD | user bytes      | POST_GUARD |
/// +---------------+-----------+-----------------+------------+
///         |                                     ^
///         +-------------------------------------+
/// ```
///
/// The post guard starts at the exact end of the requested size, so even a
/// single byte written past the end is noticed. Guards are checked on every
/// free and realloc; a damaged guard is reported to the [`OnBroken`]
/// handler.
pub struct Heap5<H, B: OnBroken = PanicOnBroken> {
    inner: H,
    broken: B,
}

impl<H: Heap, B: OnBroken> Heap5<H, B> {
    pub const fn new(inner: H, broken: B) -> Self {
        Self { inner, broken }
    }

    /// Wrapped heap.
    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Checks the guards of a live block without freeing it.
    ///
    /// # Safety
    ///
    /// `address` must be a live block of this heap.
    pub unsafe fn check(&mut self, address: NonNull<u8>) {
        if let Err(fault) = Self::verify(address) {
            report_fault(&mut self.broken, fault);
        }
    }

    /// Block of the inner heap that holds `address`.
    #[inline]
    unsafe fn base_of(address: NonNull<u8>) -> NonNull<u8> {
        NonNull::new_unchecked(address.as_ptr().sub(GUARD_SIZE + WORD))
    }

    /// Writes both guards for `size` user bytes in the inner block at `base`.
    unsafe fn stamp(base: NonNull<u8>, size: usize) -> NonNull<u8> {
        let pre = base.as_ptr().add(WORD);
        let address = pre.add(GUARD_SIZE);
        let post = address.add(size);

        *base.as_ptr().cast::<*mut u8>() = post;
        pre.copy_from_nonoverlapping(PRE_GUARD.as_ptr(), GUARD_SIZE);
        post.copy_from_nonoverlapping(POST_GUARD.as_ptr(), GUARD_SIZE);

        NonNull::new_unchecked(address)
    }

    /// Compares both guards of the block at `address` with the patterns.
    unsafe fn verify(address: NonNull<u8>) -> Result<(), Fault> {
        let fault_address = address.as_ptr() as usize;
        let pre = address.as_ptr().sub(GUARD_SIZE);

        if std::slice::from_raw_parts(pre, GUARD_SIZE) != PRE_GUARD {
            return Err(Fault::GuardUnderrun { address: fault_address });
        }

        // The post guard pointer sits before the pre guard, an underrun long
        // enough to reach it has already been caught above.
        let post = *Self::base_of(address).as_ptr().cast::<*const u8>();

        if (post as usize) < fault_address {
            return Err(Fault::CorruptHeader { address: fault_address });
        }

        if std::slice::from_raw_parts(post, GUARD_SIZE) != POST_GUARD {
            return Err(Fault::GuardOverrun { address: fault_address });
        }

        Ok(())
    }

    /// Requested size of the block at `address`.
    #[inline]
    unsafe fn requested_size(address: NonNull<u8>) -> usize {
        *Self::base_of(address).as_ptr().cast::<usize>() - address.as_ptr() as usize
    }
}

impl<H: Heap, B: OnBroken> Provide for Heap5<H, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.inner.provide_memory(region, size)
    }
}

impl<H: Heap, B: OnBroken> Heap for Heap5<H, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        let base = self.inner.alloc(size.checked_add(GUARD_OVERHEAD)?)?;
        Some(Self::stamp(base, size))
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        self.check(address);
        self.inner.free(Self::base_of(address));
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        self.check(address);

        let total = new_size.checked_add(GUARD_OVERHEAD)?;
        let base = self.inner.realloc(Self::base_of(address), total)?;

        Some(Self::stamp(base, new_size))
    }

    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        Self::requested_size(address)
    }

    fn stats(&self) -> HeapStats {
        self.inner.stats()
    }

    fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.report(out)
    }

    unsafe fn trace_alloc(&mut self, size: usize, file: &'static str, line: u32) -> Pointer<u8> {
        let base = self.inner.trace_alloc(size.checked_add(GUARD_OVERHEAD)?, file, line)?;
        Some(Self::stamp(base, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::NoRefill,
        testing::{check, fill, Arena},
        Fit, Heap1,
    };

    type Guarded = Heap5<Heap1>;

    fn heap_with(arena: &mut Arena) -> Guarded {
        let mut heap = Heap5::new(Heap1::new(Fit::First, NoRefill, PanicOnBroken), PanicOnBroken);
        unsafe { heap.provide_memory(arena.start(), arena.size()).unwrap() };
        heap
    }

    #[test]
    fn intact_guards_pass() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(13).unwrap();
            fill(a, 13, 4);
            assert_eq!(heap.usable_size(a), 13);

            let b = heap.realloc(a, 200).unwrap();
            assert!(check(b, 13, 4));
            assert_eq!(heap.usable_size(b), 200);

            let c = heap.realloc(b, 5).unwrap();
            assert!(check(c, 5, 4));
            heap.free(c);
        }

        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    #[should_panic(expected = "after block")]
    fn one_byte_overrun_is_caught_on_free() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(13).unwrap();
            *a.as_ptr().add(13) = 0;
            heap.free(a);
        }
    }

    #[test]
    #[should_panic(expected = "before block")]
    fn underrun_is_caught_on_realloc() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(32).unwrap();
            *a.as_ptr().sub(1) = 0;
            heap.realloc(a, 64);
        }
    }

    #[test]
    fn faults_name_the_damaged_guard() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(16).unwrap();
            assert_eq!(Guarded::verify(a), Ok(()));

            *a.as_ptr().add(16 + GUARD_SIZE - 1) ^= 1;
            assert_eq!(Guarded::verify(a), Err(Fault::GuardOverrun { address: a.as_ptr() as usize }));

            *a.as_ptr().add(16 + GUARD_SIZE - 1) ^= 1;
            *a.as_ptr().sub(GUARD_SIZE) ^= 1;
            assert_eq!(Guarded::verify(a), Err(Fault::GuardUnderrun { address: a.as_ptr() as usize }));
        }
    }
}
