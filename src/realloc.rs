use std::ptr::{self, NonNull};

use crate::{heap::Heap, Pointer};

/// Generic reallocation: allocate a new block, copy the bytes that survive
/// the resize and free the old block. Used by every variant when it can't
/// resize in place.
///
/// The old block is freed only after the new one has been obtained, so on
/// failure `address` remains valid and its content untouched.
///
/// # Safety
///
/// `address` must be a live block of `heap`.
pub(crate) unsafe fn relocate<H: Heap + ?Sized>(
    heap: &mut H,
    address: NonNull<u8>,
    new_size: usize,
) -> Pointer<u8> {
    let count = heap.usable_size(address).min(new_size);

    let new_address = heap.alloc(new_size)?;
    ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);
    heap.free(address);

    log::trace!("relocated {count} bytes from {address:p} to {new_address:p}");

    Some(new_address)
}
