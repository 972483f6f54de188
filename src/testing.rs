//! Helpers shared by unit tests.

use std::ptr::NonNull;

use crate::align::WORD;

/// Word aligned memory to donate to heaps under test.
pub(crate) struct Arena {
    memory: Vec<usize>,
}

impl Arena {
    pub fn new(bytes: usize) -> Self {
        Self {
            memory: vec![0; bytes / WORD],
        }
    }

    pub fn start(&mut self) -> NonNull<u8> {
        NonNull::new(self.memory.as_mut_ptr().cast()).unwrap()
    }

    pub fn size(&self) -> usize {
        self.memory.len() * WORD
    }

    /// Address `offset` bytes into the arena.
    pub fn at(&mut self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.size());
        unsafe { NonNull::new_unchecked(self.start().as_ptr().add(offset)) }
    }

    /// Whether `length` bytes at `address` lie inside the arena.
    pub fn contains(&mut self, address: NonNull<u8>, length: usize) -> bool {
        let start = self.start().as_ptr() as usize;
        let address = address.as_ptr() as usize;
        address >= start && address + length <= start + self.size()
    }
}

/// Fills `length` bytes at `address` with a pattern derived from `seed`.
pub(crate) unsafe fn fill(address: NonNull<u8>, length: usize, seed: u8) {
    for i in 0..length {
        *address.as_ptr().add(i) = seed.wrapping_add(i as u8);
    }
}

/// Checks the pattern written by [`fill`].
pub(crate) unsafe fn check(address: NonNull<u8>, length: usize, seed: u8) -> bool {
    (0..length).all(|i| *address.as_ptr().add(i) == seed.wrapping_add(i as u8))
}
