use std::ptr::NonNull;

use crate::{
    block::{block_from_user_pointer, block_size_for, user_pointer_from_block, SizeWord, SIZE_WORD},
    heap::{
        check_region, raise_high_water, report_fault, Fault, Heap, HeapStats, NoRefill, OnBroken,
        OnFull, PanicOnBroken, Provide, RegionError,
    },
    realloc::relocate,
    tree::{Key, Tree, TreeFault, TreeShape, TREE_NODE_SIZE},
    Pointer,
};

/// Every free block must be able to hold its size word and one tree node
/// for each tree.
pub(crate) const MIN_TREE_BLOCK: usize = SIZE_WORD + 2 * TREE_NODE_SIZE;

/// Heap that indexes free blocks twice, in a 2-3 tree ordered by
/// `(size, address)` and in another one ordered by address:
///
/// ```text
/// +------+-------------------+-------------------+---------+
/// | size | address tree node | size tree node    |   ...   |
/// +------+-------------------+-------------------+---------+
/// ```
///
/// The size tree gives exact best fit in O(log n), the address tree finds
/// both physical neighbours of a freed block in O(log n). Free blocks never
/// touch each other, merging happens on every free.
pub struct Heap3<F: OnFull = NoRefill, B: OnBroken = PanicOnBroken> {
    core: Core<B>,
    full: F,
}

struct Core<B> {
    by_size: Tree,
    by_address: Tree,
    high_water: usize,
    broken: B,
}

impl<F: OnFull, B: OnBroken> Heap3<F, B> {
    pub const fn new(full: F, broken: B) -> Self {
        Self {
            core: Core {
                by_size: Tree::new(Key::Size),
                by_address: Tree::new(Key::Address),
                high_water: 0,
                broken,
            },
            full,
        }
    }

    /// Checks both trees and returns the shape of the size tree. Both trees
    /// must be balanced and hold the same blocks.
    pub fn verify(&self) -> Result<TreeShape, TreeFault> {
        unsafe {
            let by_size = self.core.by_size.verify()?;
            let by_address = self.core.by_address.verify()?;

            if by_size.values != by_address.values {
                return Err(TreeFault::Count {
                    found: by_size.values,
                    expected: by_address.values,
                });
            }

            Ok(by_size)
        }
    }
}

impl<B: OnBroken> Core<B> {
    /// Unwraps the result of a tree operation, tree faults are fatal.
    fn checked<T>(&mut self, result: Result<T, TreeFault>) -> T {
        match result {
            Ok(value) => value,
            Err(fault) => report_fault(&mut self.broken, fault.into()),
        }
    }

    /// Indexes `block` in both trees.
    unsafe fn index(&mut self, block: NonNull<u8>) {
        let result = self.by_address.insert(block).and_then(|()| self.by_size.insert(block));
        self.checked(result);
    }

    /// Removes `block` from both trees.
    unsafe fn claim(&mut self, block: NonNull<u8>) {
        let result = self.by_size.remove(block).and_then(|()| self.by_address.remove(block));
        self.checked(result);
    }

    /// Frees `block`, merging it with free neighbours.
    unsafe fn release(&mut self, block: NonNull<u8>) {
        let address = block.as_ptr() as usize;
        let mut size = SizeWord::read(block).size();

        if let Some(next) = self.by_address.lower_bound((address + 1, 0)) {
            if next.as_ptr() as usize == address + size {
                self.claim(next);
                size += SizeWord::read(next).size();
            }
        }

        if let Some(prev) = self.by_address.last_below((address, 0)) {
            let prev_size = SizeWord::read(prev).size();
            if prev.as_ptr() as usize + prev_size == address {
                // Only its position in the size tree changes.
                let result = self.by_size.remove(prev);
                self.checked(result);
                SizeWord::encode(prev_size + size, SizeWord::FREE).write(prev);
                let result = self.by_size.insert(prev);
                self.checked(result);
                return;
            }
        }

        SizeWord::encode(size, SizeWord::FREE).write(block);
        self.index(block);
    }

    /// Cuts the used `block` down to `needed` bytes and frees the rest. The
    /// block that follows is never free here, so the rest can't merge.
    unsafe fn trim(&mut self, block: NonNull<u8>, needed: usize) {
        let size = SizeWord::read(block).size();

        if size - needed >= MIN_TREE_BLOCK {
            SizeWord::encode(needed, 0).write(block);
            let rest = NonNull::new_unchecked(block.as_ptr().add(needed));
            SizeWord::encode(size - needed, SizeWord::FREE).write(rest);
            self.index(rest);
        }

        raise_high_water(&mut self.high_water, block, SizeWord::read(block).size());
    }
}

impl<B: OnBroken> Provide for Core<B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        check_region(region, size, MIN_TREE_BLOCK)?;

        SizeWord::encode(size, SizeWord::FREE).write(region);
        self.release(region);

        log::debug!("heap3: {size} bytes donated at {region:p}");

        Ok(())
    }
}

impl<F: OnFull, B: OnBroken> Provide for Heap3<F, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.core.provide_memory(region, size)
    }
}

impl<F: OnFull, B: OnBroken> Heap for Heap3<F, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        let needed = block_size_for(size, SIZE_WORD, MIN_TREE_BLOCK)?;

        loop {
            if let Some(block) = self.core.by_size.lower_bound((needed, 0)) {
                self.core.claim(block);
                SizeWord::read(block).with_flags(0).write(block);
                self.core.trim(block, needed);

                let address = user_pointer_from_block(block);
                log::trace!("heap3: alloc({size}) -> {address:p}");
                return Some(address);
            }

            log::debug!("heap3: no free block of {needed} bytes, calling full handler");

            if !self.full.heap_full(&mut self.core, needed) {
                return None;
            }
        }
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = block_from_user_pointer(address);

        if SizeWord::read(block).is_free() && self.core.by_address.contains(block) {
            report_fault(&mut self.core.broken, Fault::DoubleFree { address: address.as_ptr() as usize });
        }

        log::trace!("heap3: free({address:p})");

        self.core.release(block);
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let block = block_from_user_pointer(address);
        let size = SizeWord::read(block).size();
        let needed = block_size_for(new_size, SIZE_WORD, MIN_TREE_BLOCK)?;

        if needed <= size {
            if size - needed >= MIN_TREE_BLOCK {
                SizeWord::encode(needed, 0).write(block);
                let tail = NonNull::new_unchecked(block.as_ptr().add(needed));
                SizeWord::encode(size - needed, SizeWord::FREE).write(tail);
                self.core.release(tail);
            }
            return Some(address);
        }

        let end = block.as_ptr() as usize + size;

        if let Some(next) = self.core.by_address.lower_bound((end, 0)) {
            let next_size = SizeWord::read(next).size();
            if next.as_ptr() as usize == end && size + next_size >= needed {
                self.core.claim(next);
                SizeWord::encode(size + next_size, 0).write(block);
                self.core.trim(block, needed);
                return Some(address);
            }
        }

        relocate(self, address, new_size)
    }

    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        SizeWord::read(block_from_user_pointer(address)).size() - SIZE_WORD
    }

    fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::new();

        unsafe {
            for block in self.core.by_address.values() {
                stats.record_free(SizeWord::read(block).size());
            }
        }

        stats.high_water = self.core.high_water;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{check, fill, Arena};

    fn heap_with(arena: &mut Arena) -> Heap3 {
        let mut heap = Heap3::new(NoRefill, PanicOnBroken);
        unsafe { heap.provide_memory(arena.start(), arena.size()).unwrap() };
        heap
    }

    #[test]
    fn best_fit_with_lowest_address() {
        let mut arena = Arena::new(16 * 1024);
        let mut heap = heap_with(&mut arena);

        unsafe {
            // Used separators keep the holes apart.
            let mut holes = Vec::new();
            for size in [600, 300, 400, 300, 900] {
                holes.push(heap.alloc(size).unwrap());
                heap.alloc(8).unwrap();
            }
            for hole in &holes {
                heap.free(*hole);
            }

            assert_eq!(heap.verify().unwrap().values, 6);

            // Two holes of 300 bytes, the lower one wins.
            assert_eq!(heap.alloc(250), Some(holes[1]));
            assert_eq!(heap.alloc(250), Some(holes[3]));
            assert_eq!(heap.alloc(350), Some(holes[2]));
            heap.verify().unwrap();
        }
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut arena = Arena::new(8 * 1024);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let blocks: Vec<_> = (0..6).map(|_| heap.alloc(200).unwrap()).collect();

            heap.free(blocks[1]);
            heap.free(blocks[3]);
            assert_eq!(heap.stats().free_blocks, 3);

            // Bridges 1 and 3.
            heap.free(blocks[2]);
            assert_eq!(heap.stats().free_blocks, 2);

            // Merges with its successor only.
            heap.free(blocks[0]);
            assert_eq!(heap.stats().free_blocks, 2);

            heap.free(blocks[5]);
            heap.free(blocks[4]);
            let stats = heap.stats();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, 8 * 1024);
            assert_eq!(heap.verify().unwrap().values, 1);

            assert!(heap.alloc(8 * 1024 - SIZE_WORD).is_some());
            assert_eq!(heap.verify().unwrap().height, 0);
        }
    }

    #[test]
    fn regions_donated_out_of_order_merge() {
        let mut arena = Arena::new(4096);
        let mut heap = Heap3::new(NoRefill, PanicOnBroken);

        unsafe {
            heap.provide_memory(arena.at(2048), 2048).unwrap();
            heap.provide_memory(arena.at(0), 1024).unwrap();
            heap.provide_memory(arena.at(1024), 1024).unwrap();
            assert_eq!(heap.stats().free_blocks, 1);
            assert!(matches!(
                heap.provide_memory(arena.at(8), 8),
                Err(RegionError::TooSmall { .. })
            ));
        }
    }

    #[test]
    fn realloc_grows_into_neighbour() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(200).unwrap();
            fill(a, 200, 5);

            let grown = heap.realloc(a, 1000).unwrap();
            assert_eq!(grown, a);
            assert!(check(a, 200, 5));

            let shrunk = heap.realloc(a, 100).unwrap();
            assert_eq!(shrunk, a);
            assert!(check(a, 100, 5));
            heap.verify().unwrap();

            let b = heap.alloc(100).unwrap();
            let moved = heap.realloc(a, 1000).unwrap();
            assert_ne!(moved, a);
            assert!(check(moved, 100, 5));

            heap.free(b);
            heap.free(moved);
            assert_eq!(heap.stats().free_blocks, 1);
        }
    }

    #[test]
    fn full_handler_is_called() {
        let mut arena = Arena::new(2048);
        let second = arena.at(1024);
        let mut asked = Vec::new();

        let mut heap = Heap3::new(
            |heap: &mut dyn Provide, requested: usize| {
                asked.push(requested);
                asked.len() == 1 && unsafe { heap.provide_memory(second, 1024).is_ok() }
            },
            PanicOnBroken,
        );

        unsafe {
            heap.provide_memory(arena.start(), 1024).unwrap();
            assert!(heap.alloc(1500).is_some());
            assert!(heap.alloc(1500).is_none());
        }

        drop(heap);
        assert_eq!(asked.len(), 2);
        assert!(asked[0] >= 1500);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_reported() {
        let mut arena = Arena::new(1024);
        let mut heap = heap_with(&mut arena);

        unsafe {
            let a = heap.alloc(200).unwrap();
            let _b = heap.alloc(200).unwrap();
            heap.free(a);
            heap.free(a);
        }
    }
}
