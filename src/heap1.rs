use std::ptr::NonNull;

use crate::{
    block::{block_from_user_pointer, block_size_for, user_pointer_from_block, SizeWord, SIZE_WORD},
    chain::{Chain, Fit, MIN_CHAIN_BLOCK},
    heap::{
        check_region, raise_high_water, report_fault, Fault, Heap, HeapStats, NoRefill, OnBroken,
        OnFull, PanicOnBroken, Provide, RegionError,
    },
    realloc::relocate,
    Pointer,
};

/// Simplest heap: one free chain sorted by address and merged eagerly on
/// every free, so the chain never contains two adjacent blocks.
///
/// ```text
/// +-------+----------+-------+----------+----------+-------+
/// | used  | free     | used  | free     | used     | free  |
/// +-------+----------+-------+----------+----------+-------+
///          |                  ^ |                   ^
///          +------------------+ +-------------------+
/// ```
///
/// Allocation scans the chain with the configured [`Fit`], so both alloc and
/// free are O(n) in the number of free blocks.
pub struct Heap1<F: OnFull = NoRefill, B: OnBroken = PanicOnBroken> {
    core: Core,
    full: F,
    broken: B,
}

/// Everything except the handlers, so that the [`OnFull`] handler can borrow
/// it as `&mut dyn Provide`.
struct Core {
    chain: Chain,
    fit: Fit,
    high_water: usize,
}

impl<F: OnFull, B: OnBroken> Heap1<F, B> {
    /// Creates an empty heap. Nothing can be allocated until memory is
    /// donated, either directly or through `full`.
    pub const fn new(fit: Fit, full: F, broken: B) -> Self {
        Self {
            core: Core {
                chain: Chain::new(),
                fit,
                high_water: 0,
            },
            full,
            broken,
        }
    }

    /// Allocation policy in use.
    pub fn fit(&self) -> Fit {
        self.core.fit
    }
}

impl Core {
    /// Inserts the free block at `block` in address order and merges it
    /// with its neighbours when they touch. Returns `Err` with the block
    /// that is already on the chain at the same address.
    unsafe fn insert_free(&mut self, block: NonNull<u8>) -> Result<(), NonNull<u8>> {
        let mut prev = None;

        for (_, current) in self.chain.pairs() {
            if current >= block {
                if current == block {
                    return Err(block);
                }
                break;
            }
            prev = Some(current);
        }

        let header = SizeWord::read(block).with_flags(SizeWord::FREE);
        header.write(block);
        self.chain.insert_after(prev, block);

        let adjacent = SizeWord::next_block(block);
        if let Some(next) = Chain::next(block).filter(|next| *next == adjacent) {
            let merged = header.size() + SizeWord::read(next).size();
            self.chain.unlink(Some(block), next);
            header.with_size(merged).write(block);
        }

        if let Some(prev) = prev {
            if SizeWord::next_block(prev) == block {
                let merged = SizeWord::read(prev).size() + SizeWord::read(block).size();
                self.chain.unlink(Some(prev), block);
                SizeWord::read(prev).with_size(merged).write(prev);
            }
        }

        Ok(())
    }

    /// Hands out `needed` bytes of the free `block` that follows `prev`.
    unsafe fn take(&mut self, prev: Pointer<u8>, block: NonNull<u8>, needed: usize) -> NonNull<u8> {
        let size = SizeWord::read(block).size();

        if size - needed >= MIN_CHAIN_BLOCK {
            let remainder = NonNull::new_unchecked(block.as_ptr().add(needed));
            SizeWord::encode(size - needed, SizeWord::FREE).write(remainder);
            self.chain.replace(prev, block, remainder);
            SizeWord::encode(needed, 0).write(block);
        } else {
            self.chain.unlink(prev, block);
            SizeWord::encode(size, 0).write(block);
        }

        self.chain.set_rover(prev);
        raise_high_water(&mut self.high_water, block, SizeWord::read(block).size());

        user_pointer_from_block(block)
    }

    /// Free block that starts exactly at `address`, with its predecessor.
    unsafe fn free_block_at(&self, address: NonNull<u8>) -> Option<(Pointer<u8>, NonNull<u8>)> {
        self.chain
            .pairs()
            .take_while(|(_, block)| *block <= address)
            .find(|(_, block)| *block == address)
    }
}

impl Provide for Core {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        check_region(region, size, MIN_CHAIN_BLOCK)?;

        SizeWord::encode(size, SizeWord::FREE).write(region);

        // Overlapping donations are a contract violation, the only one we
        // can see from here is the exact same address twice.
        if self.insert_free(region).is_err() {
            log::warn!("region at {region:p} donated twice, ignored");
        }

        log::debug!("heap1: {size} bytes donated at {region:p}");

        Ok(())
    }
}

impl<F: OnFull, B: OnBroken> Provide for Heap1<F, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.core.provide_memory(region, size)
    }
}

impl<F: OnFull, B: OnBroken> Heap for Heap1<F, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        let needed = block_size_for(size, SIZE_WORD, MIN_CHAIN_BLOCK)?;

        loop {
            if let Some((prev, block)) = self.core.chain.select(self.core.fit, needed) {
                let address = self.core.take(prev, block, needed);
                log::trace!("heap1: alloc({size}) -> {address:p}");
                return Some(address);
            }

            log::debug!("heap1: no free block of {needed} bytes, calling full handler");

            if !self.full.heap_full(&mut self.core, needed) {
                return None;
            }
        }
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = block_from_user_pointer(address);

        log::trace!("heap1: free({address:p})");

        // The address ordered walk finds blocks that are already free for
        // nothing, so report them.
        if self.core.insert_free(block).is_err() {
            report_fault(&mut self.broken, Fault::DoubleFree { address: address.as_ptr() as usize });
        }
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let block = block_from_user_pointer(address);
        let size = SizeWord::read(block).size();
        let needed = block_size_for(new_size, SIZE_WORD, MIN_CHAIN_BLOCK)?;

        if needed <= size {
            if size - needed >= MIN_CHAIN_BLOCK {
                SizeWord::encode(needed, 0).write(block);
                let tail = NonNull::new_unchecked(block.as_ptr().add(needed));
                SizeWord::encode(size - needed, SizeWord::FREE).write(tail);
                // The tail is brand new, it can't be on the chain already.
                let _ = self.core.insert_free(tail);
            }
            return Some(address);
        }

        let next = SizeWord::next_block(block);

        if let Some((prev, next)) = self.core.free_block_at(next) {
            let combined = size + SizeWord::read(next).size();

            if combined >= needed {
                if combined - needed >= MIN_CHAIN_BLOCK {
                    let remainder = NonNull::new_unchecked(block.as_ptr().add(needed));
                    SizeWord::encode(combined - needed, SizeWord::FREE).write(remainder);
                    self.core.chain.replace(prev, next, remainder);
                    SizeWord::encode(needed, 0).write(block);
                } else {
                    self.core.chain.unlink(prev, next);
                    SizeWord::encode(combined, 0).write(block);
                }

                raise_high_water(&mut self.core.high_water, block, SizeWord::read(block).size());
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
        unsafe { self.core.chain.collect_stats(&mut stats) };
        stats.high_water = self.core.high_water;
        stats
    }
}
