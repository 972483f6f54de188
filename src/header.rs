use std::ptr::NonNull;

use crate::list::Node;

/// Headers that are also list nodes: Heap4 buckets, Heap6 trace records and
/// the regions remembered by Heap2 and [`crate::OsPages`]. This alias is used
/// when we think of them as headers sitting right before some content rather
/// than as list nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns a pointer to a [`Header<T>`] given an address that points right
    /// after a valid [`Header<T>`].
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned address points here.
    /// +-------------+
    /// |   Content   | <- Given address should point here.
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must guarantee that the given address points exactly to the
    /// first byte after a [`Header<T>`]. That's the case for every pointer a
    /// heap hands out to its users, as long as they give us back our own
    /// pointers.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address after the header.
    ///
    /// Used as `Header::content_address_of(header)` rather than a method on
    /// `&self` so that no intermediate reference to the header is created
    /// while the caller may hold pointers into the content.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
