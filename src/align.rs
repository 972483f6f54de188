use std::mem;

/// Machine word size in bytes. Every header the heaps write is one or more
/// words and every pointer they hand out is aligned to this.
pub const WORD: usize = mem::size_of::<usize>();

/// Returns the machine word alignment for the given size.
///
/// # Examples
///
/// ```rust
/// use std::mem;
/// use heapkit::align;
///
/// match mem::size_of::<usize>() {
///     8 => assert_eq!(align(13), 16), // 64 bit machine.
///     4 => assert_eq!(align(11), 12), // 32 bit machine.
///     _ => {}, // some other power of two, will work the same.
/// };
/// ```
#[inline]
pub const fn align(to_be_aligned: usize) -> usize {
    (to_be_aligned + WORD - 1) & !(WORD - 1)
}

/// Whether `value` is a multiple of [`WORD`].
#[inline]
pub const fn is_word_aligned(value: usize) -> bool {
    value & (WORD - 1) == 0
}
