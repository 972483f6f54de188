//! Alignments above one word. Every heap in this crate hands out word
//! aligned pointers only, which covers alignments of 1, 2, 4 and 8 on 64 bit
//! machines. Bigger alignments are served with a back pointer:
//!
//! ```text
//!                        +----------------------------+
//! Block from the heap -> | padding                    |  <---+
//!                        |            ...             |      |
//!                        +----------------------------+      | At most `align` bytes
//!        Back pointer -> | address of the heap block  |      |
//!                        +----------------------------+  <---+
//!        User pointer -> | user content, aligned      |
//!                        |            ...             |
//!                        +----------------------------+
//! ```
//!
//! We request `size + align` bytes from the heap. The heap pointer is word
//! aligned, so rounding `pointer + WORD` up to `align` adds at most `align`
//! bytes, and there is always room for the back pointer right above the
//! user pointer. The caller gives us the alignment again when freeing (the
//! [`std::alloc::GlobalAlloc`] contract), which tells us whether a back
//! pointer exists at all.

use std::ptr::{self, NonNull};

use crate::{align::WORD, heap::Heap, Pointer};

/// Whether `align` needs a back pointer.
#[inline]
pub(crate) const fn needs_back_pointer(align: usize) -> bool {
    align > WORD
}

/// Address of the back pointer that belongs to `address`.
#[inline]
unsafe fn back_pointer(address: NonNull<u8>) -> *mut NonNull<u8> {
    address.as_ptr().sub(WORD).cast()
}

/// Allocates `size` bytes aligned to `align`, which must be a power of two
/// greater than [`WORD`].
pub(crate) unsafe fn alloc_aligned<H: Heap + ?Sized>(heap: &mut H, size: usize, align: usize) -> Pointer<u8> {
    let block = heap.alloc(size.checked_add(align)?)?;

    let address = (block.as_ptr() as usize + WORD + align - 1) & !(align - 1);
    let address = NonNull::new_unchecked(address as *mut u8);
    *back_pointer(address) = block;

    Some(address)
}

/// Frees memory obtained from [`alloc_aligned`].
pub(crate) unsafe fn free_aligned<H: Heap + ?Sized>(heap: &mut H, address: NonNull<u8>) {
    heap.free(*back_pointer(address))
}

/// Moves memory obtained from [`alloc_aligned`] into a new block of
/// `new_size` bytes with the same alignment. The heap can't resize in place
/// because the padding would change, so this always copies.
pub(crate) unsafe fn realloc_aligned<H: Heap + ?Sized>(
    heap: &mut H,
    address: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
) -> Pointer<u8> {
    let new_address = alloc_aligned(heap, new_size, align)?;
    ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_size.min(new_size));
    free_aligned(heap, address);

    Some(new_address)
}
