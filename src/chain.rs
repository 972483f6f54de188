//! Singly linked free chain shared by [`crate::Heap1`] and
//! [`crate::Heap2`]. A free block on the chain looks like this:
//!
//! ```text
//! +----------------------------+
//! | size | flags               | <- SizeWord, block address points here.
//! +----------------------------+
//! | next free block or null    |
//! +----------------------------+
//! |            ...             |
//! +----------------------------+
//! ```
//!
//! Heap1 keeps the chain sorted by address, Heap2 doesn't care about the
//! order. Removing a block needs its predecessor, so every search returns
//! `(predecessor, block)` pairs where a `None` predecessor means the head.

use std::ptr::NonNull;

use crate::{
    align::WORD,
    block::{SizeWord, SIZE_WORD},
    heap::HeapStats,
    Pointer,
};

/// Smallest block that can sit on the chain: size word plus next pointer.
pub(crate) const MIN_CHAIN_BLOCK: usize = SIZE_WORD + WORD;

/// How to pick a free block among all the blocks that are big enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
    /// First block that is big enough, scanning from the head.
    #[default]
    First,
    /// Like [`Fit::First`] but the scan resumes where the previous
    /// allocation was found and wraps around at the end.
    Next,
    /// Smallest block that is big enough. Ties go to the block found first.
    Best,
    /// Largest block.
    Worst,
}

/// See the module docs.
pub(crate) struct Chain {
    head: Pointer<u8>,
    len: usize,
    /// Predecessor of the block where the next [`Fit::Next`] scan starts,
    /// `None` for the head. Always a block on the chain.
    rover: Pointer<u8>,
}

/// Reads the link stored in the free block at `block`.
#[inline]
unsafe fn next_of(block: NonNull<u8>) -> Pointer<u8> {
    *block.as_ptr().add(SIZE_WORD).cast::<Pointer<u8>>()
}

#[inline]
unsafe fn set_next(block: NonNull<u8>, next: Pointer<u8>) {
    *block.as_ptr().add(SIZE_WORD).cast::<Pointer<u8>>() = next;
}

impl Chain {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            rover: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First block on the chain.
    #[inline]
    pub fn first(&self) -> Pointer<u8> {
        self.head
    }

    /// Block after `block` on the chain.
    #[inline]
    pub unsafe fn next(block: NonNull<u8>) -> Pointer<u8> {
        next_of(block)
    }

    /// Block after `prev`, or the head when `prev` is `None`.
    #[inline]
    unsafe fn after(&self, prev: Pointer<u8>) -> Pointer<u8> {
        match prev {
            Some(prev) => next_of(prev),
            None => self.head,
        }
    }

    #[inline]
    unsafe fn link_after(&mut self, prev: Pointer<u8>, next: Pointer<u8>) {
        match prev {
            Some(prev) => set_next(prev, next),
            None => self.head = next,
        }
    }

    /// Empties the chain without touching any block.
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
        self.rover = None;
    }

    /// Pushes `block` in front of the chain.
    pub unsafe fn push_front(&mut self, block: NonNull<u8>) {
        set_next(block, self.head);
        self.head = Some(block);
        self.len += 1;
    }

    /// Links `block` right after `prev` (or at the head).
    pub unsafe fn insert_after(&mut self, prev: Pointer<u8>, block: NonNull<u8>) {
        set_next(block, self.after(prev));
        self.link_after(prev, Some(block));
        self.len += 1;
    }

    /// Unlinks `block`, which must follow `prev` on the chain.
    pub unsafe fn unlink(&mut self, prev: Pointer<u8>, block: NonNull<u8>) {
        self.link_after(prev, next_of(block));
        self.len -= 1;

        if self.rover == Some(block) {
            self.rover = prev;
        }
    }

    /// Puts `new` in the chain position of `old`, which follows `prev`.
    /// Used when the remainder of a split block takes over its entry.
    pub unsafe fn replace(&mut self, prev: Pointer<u8>, old: NonNull<u8>, new: NonNull<u8>) {
        set_next(new, next_of(old));
        self.link_after(prev, Some(new));

        if self.rover == Some(old) {
            self.rover = Some(new);
        }
    }

    /// Makes the next [`Fit::Next`] scan start right after `prev`.
    #[inline]
    pub fn set_rover(&mut self, prev: Pointer<u8>) {
        self.rover = prev;
    }

    /// Iterates over `(predecessor, block)` pairs from the head.
    pub unsafe fn pairs(&self) -> Pairs {
        Pairs {
            prev: None,
            current: self.head,
        }
    }

    /// Predecessor of `block`, `Some(None)` when it is the head and `None`
    /// when it isn't on the chain at all.
    pub unsafe fn find_prev(&self, block: NonNull<u8>) -> Option<Pointer<u8>> {
        self.pairs()
            .find(|(_, current)| *current == block)
            .map(|(prev, _)| prev)
    }

    /// Picks a block of at least `needed` bytes according to `fit`.
    pub unsafe fn select(&self, fit: Fit, needed: usize) -> Option<(Pointer<u8>, NonNull<u8>)> {
        let fits = |block: NonNull<u8>| SizeWord::read(block).size() >= needed;

        match fit {
            Fit::First => self.pairs().find(|(_, block)| fits(*block)),
            Fit::Next => self.select_next(needed),
            Fit::Best => self
                .pairs()
                .filter(|(_, block)| fits(*block))
                .min_by_key(|(_, block)| SizeWord::read(*block).size()),
            Fit::Worst => self
                .pairs()
                .filter(|(_, block)| fits(*block))
                // `max_by_key` returns the last maximum, reversing keeps the
                // first one.
                .fold(None, |best: Option<(Pointer<u8>, NonNull<u8>)>, candidate| match best {
                    Some(best)
                        if SizeWord::read(best.1).size() >= SizeWord::read(candidate.1).size() =>
                    {
                        Some(best)
                    }
                    _ => Some(candidate),
                }),
        }
    }

    /// Next fit scan: starts after the rover, wraps around at the end and
    /// looks at every block at most once.
    unsafe fn select_next(&self, needed: usize) -> Option<(Pointer<u8>, NonNull<u8>)> {
        let mut prev = self.rover;
        let mut current = self.after(prev);

        for _ in 0..self.len {
            let block = match current {
                Some(block) => block,
                None => {
                    prev = None;
                    match self.head {
                        Some(head) => head,
                        None => return None,
                    }
                }
            };

            if SizeWord::read(block).size() >= needed {
                return Some((prev, block));
            }

            prev = Some(block);
            current = next_of(block);
        }

        None
    }

    /// Accounts every block on the chain.
    pub unsafe fn collect_stats(&self, stats: &mut HeapStats) {
        for (_, block) in self.pairs() {
            stats.record_free(SizeWord::read(block).size());
        }
    }
}

/// See [`Chain::pairs`].
pub(crate) struct Pairs {
    prev: Pointer<u8>,
    current: Pointer<u8>,
}

impl Iterator for Pairs {
    type Item = (Pointer<u8>, NonNull<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        let pair = (self.prev, block);
        self.prev = Some(block);
        self.current = unsafe { next_of(block) };
        Some(pair)
    }
}
