use std::ptr::NonNull;

use crate::{
    block::{block_from_user_pointer, block_size_for, user_pointer_from_block, SizeWord, SIZE_WORD},
    chain::{Chain, Fit, MIN_CHAIN_BLOCK},
    header::Header,
    heap::{
        check_region, raise_high_water, report_fault, Fault, Heap, HeapStats, NoRefill, OnBroken,
        OnFull, PanicOnBroken, Provide, RegionError,
    },
    realloc::relocate,
    region::{Region, RegionList, REGION_HEADER_SIZE},
    Pointer,
};

/// Requests of at least this many bytes are cut from the top of the chosen
/// block, smaller ones from the bottom. Keeps big and small blocks apart.
pub const BIG_REQUEST: usize = 512;

/// Zero size header that closes every region.
const SENTINEL: SizeWord = SizeWord::encode(0, 0);

/// Heap that never merges on free. Freed blocks are tagged and pushed on an
/// unordered chain in O(1); adjacent free blocks are only merged when a
/// search fails, by walking every donated region from start to end:
///
/// ```text
/// +--------+-------+-------+-------+-------+----------+
/// | Region | used  | free  | free  | used  | sentinel |
/// +--------+-------+-------+-------+-------+----------+
///                  \_______________/
///                    merged by coalesce
/// ```
///
/// Each region keeps its identity: regions are never merged with each other
/// even when they happen to touch.
pub struct Heap2<F: OnFull = NoRefill, B: OnBroken = PanicOnBroken> {
    core: Core,
    full: F,
    broken: B,
}

struct Core {
    chain: Chain,
    regions: RegionList,
    fit: Fit,
    high_water: usize,
    coalesces: usize,
}

impl<F: OnFull, B: OnBroken> Heap2<F, B> {
    pub const fn new(fit: Fit, full: F, broken: B) -> Self {
        Self {
            core: Core {
                chain: Chain::new(),
                regions: RegionList::new(),
                fit,
                high_water: 0,
                coalesces: 0,
            },
            full,
            broken,
        }
    }

    /// Merges every run of adjacent free blocks now instead of waiting for
    /// a failed search.
    pub fn coalesce(&mut self) {
        unsafe { self.core.coalesce() }
    }
}

impl Core {
    /// Rebuilds the chain from scratch by walking every region.
    unsafe fn coalesce(&mut self) {
        self.chain.clear();
        let mut tail = None;

        for region in self.regions.iter() {
            let mut block = Header::<Region>::start_of(region);

            loop {
                let header = SizeWord::read(block);
                if header.size() == 0 {
                    break;
                }

                if !header.is_free() {
                    block = SizeWord::next_block(block);
                    continue;
                }

                let mut size = header.size();
                let mut next = SizeWord::next_block(block);
                while SizeWord::read(next).is_free() {
                    size += SizeWord::read(next).size();
                    next = SizeWord::next_block(next);
                }

                SizeWord::encode(size, SizeWord::FREE).write(block);
                self.chain.insert_after(tail, block);
                tail = Some(block);
                block = next;
            }
        }

        self.coalesces += 1;
        log::debug!("heap2: coalesced into {} free blocks", self.chain.len());
    }

    /// Hands out `needed` bytes of the free `block` that follows `prev`.
    unsafe fn take(&mut self, prev: Pointer<u8>, block: NonNull<u8>, needed: usize, requested: usize) -> NonNull<u8> {
        let size = SizeWord::read(block).size();
        let leftover = size - needed;

        let taken = if leftover < MIN_CHAIN_BLOCK {
            self.chain.unlink(prev, block);
            SizeWord::encode(size, 0).write(block);
            block
        } else if requested >= BIG_REQUEST {
            // The head stays on the chain where it is.
            SizeWord::encode(leftover, SizeWord::FREE).write(block);
            let top = NonNull::new_unchecked(block.as_ptr().add(leftover));
            SizeWord::encode(needed, 0).write(top);
            top
        } else {
            let remainder = NonNull::new_unchecked(block.as_ptr().add(needed));
            SizeWord::encode(leftover, SizeWord::FREE).write(remainder);
            self.chain.replace(prev, block, remainder);
            SizeWord::encode(needed, 0).write(block);
            block
        };

        self.chain.set_rover(prev);
        raise_high_water(&mut self.high_water, taken, SizeWord::read(taken).size());

        user_pointer_from_block(taken)
    }

    /// Splits everything past `needed` bytes off the used `block` and puts
    /// it on the chain.
    unsafe fn trim(&mut self, block: NonNull<u8>, needed: usize) {
        let size = SizeWord::read(block).size();

        if size - needed >= MIN_CHAIN_BLOCK {
            SizeWord::encode(needed, 0).write(block);
            let tail = NonNull::new_unchecked(block.as_ptr().add(needed));
            SizeWord::encode(size - needed, SizeWord::FREE).write(tail);
            self.chain.push_front(tail);
        }
    }
}

impl Provide for Core {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        check_region(region, size, REGION_HEADER_SIZE + MIN_CHAIN_BLOCK + SIZE_WORD)?;

        let region = self.regions.append(Region { size }, region);
        let block = Header::<Region>::start_of(region);
        let content = region.as_ref().content_size() - SIZE_WORD;

        SizeWord::encode(content, SizeWord::FREE).write(block);
        SENTINEL.write(NonNull::new_unchecked(block.as_ptr().add(content)));
        self.chain.push_front(block);

        log::debug!("heap2: {size} bytes donated at {region:p}");

        Ok(())
    }
}

impl<F: OnFull, B: OnBroken> Provide for Heap2<F, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.core.provide_memory(region, size)
    }
}

impl<F: OnFull, B: OnBroken> Heap for Heap2<F, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        let needed = block_size_for(size, SIZE_WORD, MIN_CHAIN_BLOCK)?;
        let mut coalesced = false;

        loop {
            if let Some((prev, block)) = self.core.chain.select(self.core.fit, needed) {
                let address = self.core.take(prev, block, needed, size);
                log::trace!("heap2: alloc({size}) -> {address:p}");
                return Some(address);
            }

            if !coalesced {
                self.core.coalesce();
                coalesced = true;
                continue;
            }

            log::debug!("heap2: no free block of {needed} bytes after coalesce, calling full handler");

            if !self.full.heap_full(&mut self.core, needed) {
                return None;
            }

            coalesced = false;
        }
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = block_from_user_pointer(address);
        let header = SizeWord::read(block);

        if header.is_free() {
            report_fault(&mut self.broken, Fault::DoubleFree { address: address.as_ptr() as usize });
        }

        log::trace!("heap2: free({address:p})");

        header.with_flags(SizeWord::FREE).write(block);
        self.core.chain.push_front(block);
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let block = block_from_user_pointer(address);
        let needed = block_size_for(new_size, SIZE_WORD, MIN_CHAIN_BLOCK)?;
        let mut size = SizeWord::read(block).size();

        // Absorb free blocks that follow, one at a time. The sentinel is
        // never free so this stops at the end of the region.
        while size < needed {
            let next = NonNull::new_unchecked(block.as_ptr().add(size));
            let header = SizeWord::read(next);
            if !header.is_free() {
                break;
            }

            let Some(prev) = self.core.chain.find_prev(next) else {
                report_fault(&mut self.broken, Fault::CorruptHeader { address: next.as_ptr() as usize });
            };

            self.core.chain.unlink(prev, next);
            size += header.size();
            SizeWord::encode(size, 0).write(block);
        }

        if size >= needed {
            self.core.trim(block, needed);
            raise_high_water(&mut self.core.high_water, block, SizeWord::read(block).size());
            return Some(address);
        }

        relocate(self, address, new_size)
    }

    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        SizeWord::read(block_from_user_pointer(address)).size() - SIZE_WORD
    }

    fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::new();
        unsafe { self.core.chain.collect_stats(&mut stats) };
        stats.high_water = self.core.high_water;
        stats.coalesces = self.core.coalesces;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        align::WORD,
        testing::{check, fill, Arena},
    };

    fn heap_with(arena: &mut Arena, fit: Fit) -> Heap2 {
        let mut heap = Heap2::new(fit, NoRefill, PanicOnBroken);
        unsafe { heap.provide_memory(arena.start(), arena.size()).unwrap() };
        heap
    }

    /// Usable bytes of a fresh heap built from a single region.
    fn capacity(arena: &Arena) -> usize {
        arena.size() - REGION_HEADER_SIZE - 2 * SIZE_WORD
    }

    #[test]
    fn free_defers_merging() {
        let mut arena = Arena::new(1024);
        let mut heap = heap_with(&mut arena, Fit::First);

        unsafe {
            let blocks: Vec<_> = (0..4).map(|_| heap.alloc(64).unwrap()).collect();
            for block in &blocks {
                heap.free(*block);
            }

            // Four separate blocks plus the rest of the region.
            assert_eq!(heap.stats().free_blocks, 5);
            assert_eq!(heap.stats().coalesces, 0);

            // Nothing is big enough until the blocks are merged.
            let all = heap.alloc(capacity(&arena)).unwrap();
            let stats = heap.stats();
            assert_eq!(stats.coalesces, 1);
            assert_eq!(stats.free_blocks, 0);

            heap.free(all);
        }
    }

    #[test]
    fn big_requests_come_from_the_top() {
        let mut arena = Arena::new(4096);
        let mut heap = heap_with(&mut arena, Fit::First);
        let first = unsafe { user_pointer_from_block(arena.at(REGION_HEADER_SIZE)) };

        unsafe {
            let small = heap.alloc(16).unwrap();
            assert_eq!(small, first);

            let big = heap.alloc(BIG_REQUEST).unwrap();
            let end = big.as_ptr() as usize + BIG_REQUEST;
            let sentinel = arena.start().as_ptr() as usize + arena.size() - SIZE_WORD;
            assert_eq!(end, sentinel);

            // The next small request lands right after the first one.
            let next = heap.alloc(16).unwrap();
            let step = block_size_for(16, SIZE_WORD, MIN_CHAIN_BLOCK).unwrap();
            assert_eq!(next.as_ptr() as usize, first.as_ptr() as usize + step);
        }
    }

    #[test]
    fn fit_policies_pick_different_blocks() {
        let mut arena = Arena::new(2048);
        let mut heap = heap_with(&mut arena, Fit::Worst);

        unsafe {
            // Blocks of 4, 8 and 6 words separated by used blocks.
            let a = heap.alloc(3 * WORD).unwrap();
            let _ = heap.alloc(WORD).unwrap();
            let b = heap.alloc(7 * WORD).unwrap();
            let _ = heap.alloc(WORD).unwrap();
            let c = heap.alloc(5 * WORD).unwrap();
            let _ = heap.alloc(WORD).unwrap();
            let rest = heap.alloc(capacity(&arena) - 24 * WORD).unwrap();

            heap.free(a);
            heap.free(b);
            heap.free(c);

            heap.core.fit = Fit::Best;
            assert_eq!(heap.alloc(5 * WORD), Some(c));
            heap.free(c);

            heap.core.fit = Fit::Worst;
            assert_eq!(heap.alloc(3 * WORD), Some(b));
            heap.free(b);

            // b was freed last, so it heads the chain.
            heap.core.fit = Fit::First;
            assert_eq!(heap.alloc(WORD), Some(b));

            heap.free(rest);
        }
    }

    #[test]
    fn realloc_absorbs_following_blocks() {
        let mut arena = Arena::new(1024);
        let mut heap = heap_with(&mut arena, Fit::First);

        unsafe {
            let a = heap.alloc(32).unwrap();
            let b = heap.alloc(32).unwrap();
            let c = heap.alloc(32).unwrap();
            let d = heap.alloc(32).unwrap();
            fill(a, 32, 1);
            heap.free(b);
            heap.free(c);

            // Absorbs b and c but stops at d.
            let grown = heap.realloc(a, 100).unwrap();
            assert_eq!(grown, a);
            assert!(check(a, 32, 1));
            assert!(heap.usable_size(a) >= 100);

            // d is used, so this one has to move.
            let moved = heap.realloc(a, 200).unwrap();
            assert_ne!(moved, a);
            assert!(check(moved, 32, 1));

            heap.free(d);
            heap.free(moved);
        }
    }

    #[test]
    fn full_handler_after_coalesce() {
        let mut arena = Arena::new(2048);
        let second = arena.at(1024);
        let mut calls = 0;

        let mut heap = Heap2::new(
            Fit::Best,
            |heap: &mut dyn Provide, _: usize| {
                calls += 1;
                calls == 1 && unsafe { heap.provide_memory(second, 1024).is_ok() }
            },
            PanicOnBroken,
        );

        unsafe {
            heap.provide_memory(arena.start(), 1024).unwrap();
            let a = heap.alloc(600).unwrap();
            let b = heap.alloc(600).unwrap();
            assert!(heap.alloc(600).is_none());

            // Regions are never merged even though they touch.
            heap.free(a);
            heap.free(b);
            heap.coalesce();
            assert_eq!(heap.stats().free_blocks, 2);
        }

        drop(heap);
        assert_eq!(calls, 2);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_reported() {
        let mut arena = Arena::new(512);
        let mut heap = heap_with(&mut arena, Fit::First);

        unsafe {
            let a = heap.alloc(32).unwrap();
            heap.free(a);
            heap.free(a);
        }
    }
}
