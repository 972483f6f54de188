use std::{mem, ptr::NonNull};

use crate::{header::Header, list::LinkedList};

/// Region header size in bytes. See [`Region`].
pub(crate) const REGION_HEADER_SIZE: usize = mem::size_of::<Header<Region>>();

/// A donated region that has to be remembered as a unit. The header is
/// written at the very start of the region and everything after it is
/// content:
///
/// ```text
/// +--------+-------------------------------------------+
/// |        | +-------+    +-------+    +-------------+ |
/// | Region | | Block | -> | Block | -> | End of area | |
/// |        | +-------+    +-------+    +-------------+ |
/// +--------+-------------------------------------------+
/// ```
///
/// Heap2 chains every region it receives so that its deferred coalesce can
/// walk each one from start to end. [`crate::OsPages`] chains every chunk it
/// mapped so it can give them back to the OS when dropped. Regions are never
/// assumed to be adjacent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
    /// Size of the region including [`REGION_HEADER_SIZE`].
    pub size: usize,
}

/// List of regions. The list owns nothing, see [`LinkedList`].
pub(crate) type RegionList = LinkedList<Region>;

impl Header<Region> {
    /// First byte after the header.
    #[inline]
    pub unsafe fn start_of(region: NonNull<Self>) -> NonNull<u8> {
        Self::content_address_of(region)
    }

    /// Region size including [`REGION_HEADER_SIZE`].
    #[inline]
    pub fn total_size(&self) -> usize {
        self.data.size
    }

    /// Region size excluding [`REGION_HEADER_SIZE`].
    #[inline]
    pub fn content_size(&self) -> usize {
        self.data.size - REGION_HEADER_SIZE
    }
}

/// Calculates the length in bytes that must be requested from the OS in
/// order to donate at least `size` usable bytes, when the heap needs
/// `overhead` bytes of its own bookkeeping on top of that.
///
/// The length is rounded up to whole pages. If rounding leaves a tail
/// smaller than `overhead` past the requested content, another page is
/// added: a heap can't build a free block out of a tail that small, so the
/// next request would map a new chunk anyway.
pub(crate) fn determine_region_length(size: usize, overhead: usize, page_size: usize) -> usize {
    let total_size = REGION_HEADER_SIZE + overhead + size;

    let mut length = page_size * ((total_size + page_size - 1) / page_size);

    if total_size < length && total_size + overhead > length {
        length += page_size;
    }

    length
}
