use std::ptr::NonNull;

use crate::align::WORD;

/// One-word block header that packs flags into the low bits of the block
/// size. Sizes are always multiples of [`WORD`] (at least 4), so the two low
/// bits are never part of the size:
///
/// ```text
/// +---------------------------------------------+------+------+
/// |             block size (bytes)              | HOLE | FREE |
/// +---------------------------------------------+------+------+
///  usize::BITS - 1                           2      1      0
/// ```
///
/// The size always includes the header itself, so the next block in memory
/// starts exactly `size()` bytes after this header. Heaps that walk memory
/// linearly (Heap2 and Heap7) rely on that to tell free, used and hole
/// blocks apart from the header alone.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct SizeWord(usize);

impl SizeWord {
    /// Block is free and linked into some free structure.
    pub const FREE: usize = 0b01;
    /// Block bridges the gap between two non-contiguous regions. Never
    /// allocated, never merged.
    pub const HOLE: usize = 0b10;
    /// All flag bits.
    pub const FLAGS: usize = Self::FREE | Self::HOLE;
    /// All size bits.
    pub const SIZE_MASK: usize = !Self::FLAGS;

    #[inline]
    pub const fn encode(size: usize, flags: usize) -> Self {
        debug_assert!(size & Self::FLAGS == 0);
        Self(size | (flags & Self::FLAGS))
    }

    #[inline]
    pub const fn decode(self) -> (usize, usize) {
        (self.size(), self.flags())
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.0 & Self::SIZE_MASK
    }

    #[inline]
    pub const fn flags(self) -> usize {
        self.0 & Self::FLAGS
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 & Self::FREE != 0
    }

    #[inline]
    pub const fn is_hole(self) -> bool {
        self.0 & Self::HOLE != 0
    }

    /// Same flags, different size.
    #[inline]
    pub const fn with_size(self, size: usize) -> Self {
        Self::encode(size, self.flags())
    }

    /// Same size, different flags.
    #[inline]
    pub const fn with_flags(self, flags: usize) -> Self {
        Self::encode(self.size(), flags)
    }

    /// Reads the header located at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to a header written by one of the heaps.
    #[inline]
    pub unsafe fn read(block: NonNull<u8>) -> Self {
        *block.as_ptr().cast::<Self>()
    }

    /// Writes this header at `block`.
    #[inline]
    pub unsafe fn write(self, block: NonNull<u8>) {
        *block.as_ptr().cast::<Self>() = self;
    }

    /// Address of the block that follows `block` in memory.
    #[inline]
    pub unsafe fn next_block(block: NonNull<u8>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().add(Self::read(block).size()))
    }
}

impl std::fmt::Debug for SizeWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (size, flags) = self.decode();
        f.debug_struct("SizeWord")
            .field("size", &size)
            .field("free", &(flags & Self::FREE != 0))
            .field("hole", &(flags & Self::HOLE != 0))
            .finish()
    }
}

/// Size of the [`SizeWord`] header in bytes.
pub(crate) const SIZE_WORD: usize = WORD;

/// Total block size needed to hand out `size` usable bytes behind a header
/// of `header` bytes, never less than `minimum`. `None` if the result would
/// not fit in an address space.
#[inline]
pub(crate) fn block_size_for(size: usize, header: usize, minimum: usize) -> Option<usize> {
    let total = size.checked_add(header + WORD - 1)? & !(WORD - 1);

    (total <= isize::MAX as usize).then_some(total.max(minimum))
}

/// Returns the user pointer of a block whose header is at `block`.
#[inline]
pub(crate) unsafe fn user_pointer_from_block(block: NonNull<u8>) -> NonNull<u8> {
    NonNull::new_unchecked(block.as_ptr().add(SIZE_WORD))
}

/// Inverse of [`user_pointer_from_block`]. Undefined behaviour if `address`
/// was not handed out by a heap using one-word headers.
#[inline]
pub(crate) unsafe fn block_from_user_pointer(address: NonNull<u8>) -> NonNull<u8> {
    NonNull::new_unchecked(address.as_ptr().sub(SIZE_WORD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let flag_combinations = [0, SizeWord::FREE, SizeWord::HOLE, SizeWord::FREE | SizeWord::HOLE];

        for words in [0, 1, 2, 3, 17, 1000, usize::MAX / WORD] {
            let size = words * WORD;
            for flags in flag_combinations {
                let header = SizeWord::encode(size, flags);
                assert_eq!(header.decode(), (size, flags));
                assert_eq!(header.is_free(), flags & SizeWord::FREE != 0);
                assert_eq!(header.is_hole(), flags & SizeWord::HOLE != 0);
            }
        }
    }

    #[test]
    fn with_size_keeps_flags() {
        let header = SizeWord::encode(4 * WORD, SizeWord::FREE);
        let resized = header.with_size(10 * WORD);
        assert_eq!(resized.decode(), (10 * WORD, SizeWord::FREE));

        let used = resized.with_flags(0);
        assert_eq!(used.decode(), (10 * WORD, 0));
    }

    #[test]
    fn block_sizes() {
        let minimum = 4 * WORD;
        assert_eq!(block_size_for(0, WORD, minimum), Some(minimum));
        assert_eq!(block_size_for(3 * WORD, WORD, minimum), Some(minimum));
        assert_eq!(block_size_for(3 * WORD + 1, WORD, minimum), Some(5 * WORD));
        assert_eq!(block_size_for(100 * WORD, WORD, minimum), Some(101 * WORD));
        assert_eq!(block_size_for(usize::MAX - 2, WORD, minimum), None);
        assert_eq!(block_size_for(isize::MAX as usize, WORD, minimum), None);
    }

    #[test]
    fn walk_blocks() {
        let mut memory = [0usize; 8];
        let base = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
            SizeWord::encode(3 * WORD, 0).write(base);
            let second = SizeWord::next_block(base);
            assert_eq!(second.as_ptr() as usize - base.as_ptr() as usize, 3 * WORD);

            SizeWord::encode(5 * WORD, SizeWord::FREE).write(second);
            assert!(SizeWord::read(second).is_free());

            let user = user_pointer_from_block(second);
            assert_eq!(block_from_user_pointer(user), second);
        }
    }
}
