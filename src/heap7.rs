use std::{fmt, ptr::NonNull};

use crate::{
    align::WORD,
    block::{block_from_user_pointer, block_size_for, user_pointer_from_block, SizeWord, SIZE_WORD},
    freelist::FreeList,
    heap::{
        check_region, raise_high_water, report_fault, Fault, Heap, HeapStats, NoRefill, OnBroken,
        OnFull, PanicOnBroken, Provide, RegionError,
    },
    realloc::relocate,
    Pointer,
};

/// Number of bins. Bin `i` holds free blocks of exactly
/// `MIN_BLOCK + i * WORD` bytes.
pub const NBINS: usize = 16;

/// Size word plus the two free list links.
const MIN_BLOCK: usize = SIZE_WORD + 2 * WORD;

/// Largest block size served from bins, anything bigger goes to overflow.
const MAX_BIN_SIZE: usize = MIN_BLOCK + (NBINS - 1) * WORD;

/// Blocks of this size or more are searched from the top of the overflow
/// list and cut from their low end.
pub const LARGE_BLOCK: usize = 1024;

/// Free bytes needed on top of the request before a coalesce is tried.
const COALESCE_FLOOR: usize = 4096;

/// Free bytes needed, as a fraction of the user heap, before a coalesce is
/// tried.
const COALESCE_FRACTION: usize = 6;

/// Bounds and double free checks on every free and realloc.
const PARANOID: bool = cfg!(any(feature = "paranoid", debug_assertions));

/// Terminator written in the last word of the heap.
const TERMINATOR: SizeWord = SizeWord::encode(0, 0);

#[inline]
fn bin_index(size: usize) -> Option<usize> {
    (size <= MAX_BIN_SIZE).then(|| (size - MIN_BLOCK) / WORD)
}

#[inline]
unsafe fn offset(block: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    NonNull::new_unchecked(block.as_ptr().add(bytes))
}

/// General purpose heap: [`NBINS`] exact size bins for small blocks plus
/// one overflow list, sorted by address, for everything else.
///
/// ```text
///   heap_low                                               heap_high
///   |                                                              |
///   v                                                              v
///   +------+------+------+-----------+------+----------+------+---+
///   | used | free | used | free      | hole | used     | free | 0 |
///   +------+------+------+-----------+------+----------+------+---+
///             |              |                             |
///          bins[2]        overflow  <------------------>  overflow
/// ```
///
/// [`Heap::free`] doesn't merge anything, it just files the block. Adjacent
/// free blocks are merged by a coalesce pass that walks the whole heap and
/// rebuilds every list. The pass runs when an allocation fails and enough
/// memory is free to make it worthwhile, or as a last resort after the
/// [`OnFull`] handler declines.
///
/// Regions donated later don't need to be contiguous with the heap. They
/// may land above it, below it or inside a gap between earlier regions.
/// Gaps are bridged with hole blocks that the walk skips over. A region
/// that overlaps memory of the heap itself is rejected.
pub struct Heap7<F: OnFull = NoRefill, B: OnBroken = PanicOnBroken> {
    core: Core,
    full: F,
    broken: B,
}

struct Core {
    bins: [FreeList; NBINS],
    /// Blocks bigger than [`MAX_BIN_SIZE`], lowest address first.
    overflow: FreeList,
    /// First byte of the heap.
    heap_low: usize,
    /// Address of the terminator word, 0 before the first donation.
    heap_high: usize,
    /// Bounds of the memory reserved for the system, see
    /// [`Heap7::set_system_top`].
    sys_heap_low: usize,
    sys_heap_top: usize,
    /// Heap bytes below `sys_heap_top`.
    system_bytes: usize,
    /// Bytes in free blocks, filed or not merged yet.
    total_free: usize,
    /// Bytes usable for blocks, holes and terminator excluded.
    heap_bytes: usize,
    hole_bytes: usize,
    /// Free block that ends right at the terminator, if any.
    last_block: Pointer<u8>,
    /// Blocks were freed since the last coalesce.
    dirty: bool,
    coalesces: usize,
    high_water: usize,
}

impl<F: OnFull, B: OnBroken> Heap7<F, B> {
    pub const fn new(full: F, broken: B) -> Self {
        Self {
            core: Core {
                bins: [FreeList::new(); NBINS],
                overflow: FreeList::new(),
                heap_low: 0,
                heap_high: 0,
                sys_heap_low: 0,
                sys_heap_top: 0,
                system_bytes: 0,
                total_free: 0,
                heap_bytes: 0,
                hole_bytes: 0,
                last_block: None,
                dirty: false,
                coalesces: 0,
                high_water: 0,
            },
            full,
            broken,
        }
    }

    /// Merges every run of adjacent free blocks right now.
    pub fn coalesce(&mut self) {
        unsafe { self.core.coalesce() }
    }

    /// Marks all memory donated so far as the system heap. Only memory
    /// donated afterwards counts as user heap when deciding whether a
    /// coalesce is worth it.
    pub fn set_system_top(&mut self) {
        let core = &mut self.core;
        core.sys_heap_low = core.heap_low;
        core.sys_heap_top = if core.heap_high == 0 { 0 } else { core.heap_high + WORD };
        core.system_bytes = core.heap_bytes;
        log::debug!("system heap ends at {:#x} ({} bytes)", core.sys_heap_top, core.system_bytes);
    }

    /// End of the system heap, 0 if [`Self::set_system_top`] was never
    /// called.
    pub fn system_top(&self) -> usize {
        self.core.sys_heap_top
    }

    /// Whether `address` lies in the system heap.
    pub fn is_system(&self, address: NonNull<u8>) -> bool {
        let address = address.as_ptr() as usize;
        address >= self.core.sys_heap_low && address < self.core.sys_heap_top
    }

    /// Walks the whole heap and cross checks headers against the free
    /// lists.
    pub fn check(&self) -> Result<(), Fault> {
        unsafe { self.core.check() }
    }

    /// Header of a block handed out to the user, validated when paranoid
    /// checks are enabled.
    unsafe fn used_block(&mut self, address: NonNull<u8>) -> NonNull<u8> {
        let block = block_from_user_pointer(address);

        if PARANOID {
            if let Err(fault) = self.core.validate_used(block) {
                report_fault(&mut self.broken, fault);
            }
        }

        block
    }
}

impl Core {
    /// Puts the free block at `block` in its bin or in the overflow list
    /// right after `anchor`, which must be the free block before it in
    /// address order.
    unsafe fn file_after(&mut self, block: NonNull<u8>, anchor: Pointer<u8>) {
        let size = SizeWord::read(block).size();

        match bin_index(size) {
            Some(index) => self.bins[index].push_block(block),
            None => match anchor {
                Some(anchor) => self.overflow.insert_block_after(anchor, block),
                None => self.overflow.push_block(block),
            },
        }

        if block.as_ptr() as usize + size == self.heap_high {
            self.last_block = Some(block);
        }
    }

    /// Files `block` wherever it belongs.
    unsafe fn file(&mut self, block: NonNull<u8>) {
        let mut anchor = None;

        if bin_index(SizeWord::read(block).size()).is_none() {
            anchor = self.overflow.last_block();
            while let Some(candidate) = anchor {
                if candidate < block {
                    break;
                }
                anchor = FreeList::prev_block(candidate);
            }
        }

        self.file_after(block, anchor);
    }

    /// Takes `block` off its bin or the overflow list.
    unsafe fn unfile(&mut self, block: NonNull<u8>) {
        match bin_index(SizeWord::read(block).size()) {
            Some(index) => self.bins[index].remove_block(block),
            None => self.overflow.remove_block(block),
        }

        if self.last_block == Some(block) {
            self.last_block = None;
        }
    }

    /// Marks `block` free and files it without merging.
    unsafe fn release(&mut self, block: NonNull<u8>, size: usize) {
        SizeWord::encode(size, SizeWord::FREE).write(block);
        self.file(block);
        self.total_free += size;
        self.dirty = true;
    }

    /// Splits the unfiled free `block` so that one part has `needed` bytes.
    /// Returns that part, marked used, and the free remainder if it is big
    /// enough to be a block. `from_high` decides which end is handed out.
    unsafe fn split(
        &mut self,
        block: NonNull<u8>,
        needed: usize,
        from_high: bool,
    ) -> (NonNull<u8>, Pointer<u8>) {
        let size = SizeWord::read(block).size();
        let leftover = size - needed;

        if leftover < MIN_BLOCK {
            SizeWord::encode(size, 0).write(block);
            return (block, None);
        }

        let (taken, rest) = if from_high {
            (offset(block, leftover), block)
        } else {
            (block, offset(block, needed))
        };

        SizeWord::encode(leftover, SizeWord::FREE).write(rest);
        SizeWord::encode(needed, 0).write(taken);
        self.total_free += leftover;

        (taken, Some(rest))
    }

    /// Bins are searched upwards starting at the exact size. The block is
    /// cut from its high end and the rest goes back to a smaller bin.
    unsafe fn take_from_bins(&mut self, needed: usize) -> Pointer<u8> {
        let start = bin_index(needed)?;
        let block = self.bins[start..].iter().find_map(|bin| bin.first_block())?;

        self.unfile(block);
        self.total_free -= SizeWord::read(block).size();

        let (taken, rest) = self.split(block, needed, true);
        if let Some(rest) = rest {
            self.file_after(rest, None);
        }

        Some(taken)
    }

    /// First fit over the overflow list. Large requests start at the top of
    /// the heap and take the low end of the block, small ones start at the
    /// bottom and take the high end.
    unsafe fn take_from_overflow(&mut self, needed: usize) -> Pointer<u8> {
        let large = needed >= LARGE_BLOCK;

        let mut candidate = if large {
            self.overflow.last_block()
        } else {
            self.overflow.first_block()
        };

        while let Some(block) = candidate {
            if FreeList::size_of(block) >= needed {
                break;
            }
            candidate = if large {
                FreeList::prev_block(block)
            } else {
                FreeList::next_block(block)
            };
        }

        let block = candidate?;
        let anchor = FreeList::prev_block(block);

        self.unfile(block);
        self.total_free -= SizeWord::read(block).size();

        let (taken, rest) = self.split(block, needed, !large);
        if let Some(rest) = rest {
            self.file_after(rest, anchor);
        }

        Some(taken)
    }

    unsafe fn find(&mut self, needed: usize) -> Pointer<u8> {
        let block = match self.take_from_bins(needed) {
            Some(block) => block,
            None => self.take_from_overflow(needed)?,
        };

        raise_high_water(&mut self.high_water, block, SizeWord::read(block).size());

        Some(block)
    }

    /// A coalesce only pays off when plenty of memory is free, otherwise the
    /// heap should grow instead.
    fn worth_coalescing(&self, needed: usize) -> bool {
        let user_bytes = self.heap_bytes - self.system_bytes;

        self.total_free >= needed.saturating_add(COALESCE_FLOOR)
            && self.total_free >= user_bytes / COALESCE_FRACTION
    }

    /// Rebuilds every bin and the overflow list from a walk over the whole
    /// heap, merging runs of free blocks on the way.
    unsafe fn coalesce(&mut self) {
        self.bins = [FreeList::new(); NBINS];
        self.overflow = FreeList::new();
        self.last_block = None;

        let mut merged = 0;
        let mut address = self.heap_low;

        while address < self.heap_high {
            let block = NonNull::new_unchecked(address as *mut u8);
            let header = SizeWord::read(block);

            if header.size() == 0 {
                break;
            }

            if !header.is_free() {
                address += header.size();
                continue;
            }

            let mut size = header.size();
            loop {
                let next = SizeWord::read(offset(block, size));
                if !next.is_free() {
                    break;
                }
                size += next.size();
                merged += 1;
            }

            SizeWord::encode(size, SizeWord::FREE).write(block);
            let anchor = self.overflow.last_block();
            self.file_after(block, anchor);

            address += size;
        }

        self.dirty = false;
        self.coalesces += 1;

        log::debug!(
            "coalesce pass {}: merged {merged} blocks, {} bytes free",
            self.coalesces,
            self.total_free
        );
    }

    /// Checks that `block` looks like a block handed out by this heap.
    unsafe fn validate_used(&self, block: NonNull<u8>) -> Result<(), Fault> {
        let address = block.as_ptr() as usize;

        if address < self.heap_low || address >= self.heap_high {
            return Err(Fault::OutOfBounds { address: address + SIZE_WORD });
        }

        let header = SizeWord::read(block);

        if header.is_free() {
            return Err(Fault::DoubleFree { address: address + SIZE_WORD });
        }

        if header.is_hole() || header.size() < MIN_BLOCK || address + header.size() > self.heap_high {
            return Err(Fault::CorruptHeader { address });
        }

        Ok(())
    }

    unsafe fn check(&self) -> Result<(), Fault> {
        if self.heap_high == 0 {
            return Ok(());
        }

        let mut address = self.heap_low;
        let (mut free_bytes, mut free_blocks) = (0, 0);

        while address < self.heap_high {
            let header = SizeWord::read(NonNull::new_unchecked(address as *mut u8));
            let size = header.size();

            if size < WORD || address + size > self.heap_high || (!header.is_hole() && size < MIN_BLOCK) {
                return Err(Fault::CorruptHeader { address });
            }

            if header.is_free() {
                free_bytes += size;
                free_blocks += 1;
            }

            address += size;
        }

        let terminator = NonNull::new_unchecked(self.heap_high as *mut u8);
        if address != self.heap_high || SizeWord::read(terminator) != TERMINATOR {
            return Err(Fault::CorruptHeader { address: self.heap_high });
        }

        for (index, bin) in self.bins.iter().enumerate() {
            if bin.iter_blocks().any(|block| bin_index(FreeList::size_of(block)) != Some(index)) {
                return Err(Fault::CorruptHeader { address: self.heap_low });
            }
        }

        let mut previous = None;
        for block in self.overflow.iter_blocks() {
            if previous >= Some(block) || FreeList::size_of(block) <= MAX_BIN_SIZE {
                return Err(Fault::CorruptHeader { address: block.as_ptr() as usize });
            }
            previous = Some(block);
        }

        let filed = self.overflow.len() + self.bins.iter().map(|bin| bin.len()).sum::<usize>();

        if free_bytes != self.total_free || free_blocks != filed {
            return Err(Fault::CorruptHeader { address: self.heap_low });
        }

        Ok(())
    }
}

impl Core {
    /// Region at or above the terminator. Extends the last free block when
    /// contiguous, bridges the gap with a hole otherwise.
    unsafe fn extend_up(&mut self, region: NonNull<u8>, size: usize) {
        let start = region.as_ptr() as usize;

        let (block, block_size, contiguous) = if self.heap_high == 0 {
            self.heap_low = start;
            (region, size - WORD, false)
        } else if start == self.heap_high + WORD {
            (NonNull::new_unchecked(self.heap_high as *mut u8), size, true)
        } else {
            let hole = NonNull::new_unchecked(self.heap_high as *mut u8);
            let hole_size = start - self.heap_high;
            SizeWord::encode(hole_size, SizeWord::HOLE).write(hole);
            self.hole_bytes += hole_size;
            log::debug!("bridging {hole_size} bytes between {:#x} and {start:#x}", self.heap_high);
            (region, size - WORD, false)
        };

        self.heap_high = start + size - WORD;
        TERMINATOR.write(NonNull::new_unchecked(self.heap_high as *mut u8));
        self.heap_bytes += block_size;

        log::debug!("heap extended to {:#x}..{:#x}", self.heap_low, self.heap_high);

        match self.last_block {
            Some(last) if contiguous => {
                self.unfile(last);
                let merged = SizeWord::read(last).size() + block_size;
                SizeWord::encode(merged, SizeWord::FREE).write(last);
                self.file(last);
                self.total_free += block_size;
            }
            _ => self.release(block, block_size),
        }
    }

    /// Region that ends at or below `heap_low`. Its last word starts a hole
    /// that reaches up to the old bottom of the heap.
    unsafe fn extend_down(&mut self, region: NonNull<u8>, size: usize) {
        let hole = offset(region, size - WORD);
        let hole_size = self.heap_low - hole.as_ptr() as usize;
        SizeWord::encode(hole_size, SizeWord::HOLE).write(hole);

        self.hole_bytes += hole_size;
        self.heap_bytes += size - WORD;
        self.heap_low = region.as_ptr() as usize;

        log::debug!("heap extended down to {:#x}, bridging {hole_size} bytes", self.heap_low);

        self.release(region, size - WORD);
    }

    /// Hole that fully contains `start..end`, if any.
    unsafe fn hole_around(&self, start: usize, end: usize) -> Pointer<u8> {
        let mut address = self.heap_low;

        while address < self.heap_high {
            let header = SizeWord::read(NonNull::new_unchecked(address as *mut u8));

            if header.size() == 0 {
                break;
            }

            if header.is_hole() && address < start && end <= address + header.size() {
                return NonNull::new(address as *mut u8);
            }

            address += header.size();
        }

        None
    }

    /// Region inside `hole`. The hole is cut in two, one part below the
    /// region and one starting at its last word.
    unsafe fn fill_hole(&mut self, hole: NonNull<u8>, region: NonNull<u8>, size: usize) {
        let hole_end = hole.as_ptr() as usize + SizeWord::read(hole).size();
        let upper = offset(region, size - WORD);

        SizeWord::encode(region.as_ptr() as usize - hole.as_ptr() as usize, SizeWord::HOLE).write(hole);
        SizeWord::encode(hole_end - upper.as_ptr() as usize, SizeWord::HOLE).write(upper);

        self.hole_bytes -= size - WORD;
        self.heap_bytes += size - WORD;

        log::debug!("region at {region:p} fills part of the hole at {hole:p}");

        self.release(region, size - WORD);
    }
}

impl Provide for Core {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        check_region(region, size, MIN_BLOCK + WORD)?;

        let start = region.as_ptr() as usize;
        let end = start + size;

        if self.heap_high == 0 || start >= self.heap_high + WORD {
            self.extend_up(region, size);
        } else if end <= self.heap_low {
            self.extend_down(region, size);
        } else if let Some(hole) = self.hole_around(start, end) {
            self.fill_hole(hole, region, size);
        } else {
            return Err(RegionError::Overlap { address: start, size });
        }

        Ok(())
    }
}

impl<F: OnFull, B: OnBroken> Provide for Heap7<F, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.core.provide_memory(region, size)
    }
}

impl<F: OnFull, B: OnBroken> Heap for Heap7<F, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        let needed = block_size_for(size, SIZE_WORD, MIN_BLOCK)?;
        let mut forced = false;

        loop {
            if let Some(block) = self.core.find(needed) {
                log::trace!("allocated {needed} bytes at {block:p}");
                return Some(user_pointer_from_block(block));
            }

            if self.core.dirty && self.core.worth_coalescing(needed) {
                self.core.coalesce();
                continue;
            }

            log::debug!("heap full, requesting {needed} bytes");
            if self.full.heap_full(&mut self.core, needed) {
                continue;
            }

            // Not worth it before, but it's all we have left.
            if self.core.dirty && !forced {
                forced = true;
                self.core.coalesce();
                continue;
            }

            return None;
        }
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = self.used_block(address);
        let size = SizeWord::read(block).size();

        log::trace!("freeing {size} bytes at {block:p}");
        self.core.release(block, size);
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        let block = self.used_block(address);
        let header = SizeWord::read(block);
        let current = header.size();
        let needed = block_size_for(new_size, SIZE_WORD, MIN_BLOCK)?;

        if needed <= current {
            if current - needed >= MIN_BLOCK {
                header.with_size(needed).write(block);
                self.core.release(offset(block, needed), current - needed);
            }
            return Some(address);
        }

        // The terminator and holes are never free, so this can't run off the
        // heap.
        let next = offset(block, current);
        let next_header = SizeWord::read(next);

        if next_header.is_free() && current + next_header.size() >= needed {
            self.core.unfile(next);
            self.core.total_free -= next_header.size();

            let combined = current + next_header.size();
            if combined - needed >= MIN_BLOCK {
                header.with_size(needed).write(block);
                self.core.release(offset(block, needed), combined - needed);
            } else {
                header.with_size(combined).write(block);
            }

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

        unsafe {
            for list in self.core.bins.iter().chain(std::iter::once(&self.core.overflow)) {
                for block in list.iter_blocks() {
                    stats.record_free(FreeList::size_of(block));
                }
            }
        }

        stats.high_water = self.core.high_water;
        stats.coalesces = self.core.coalesces;
        stats
    }

    fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let core = &self.core;

        writeln!(
            out,
            "heap {:#x}..{:#x}: {} bytes, {} in holes",
            core.heap_low, core.heap_high, core.heap_bytes, core.hole_bytes
        )?;
        if core.sys_heap_top != 0 {
            writeln!(out, "system heap: {} bytes up to {:#x}", core.system_bytes, core.sys_heap_top)?;
        }
        if core.dirty {
            writeln!(out, "uncoalesced frees pending")?;
        }

        write!(out, "{}", self.stats())
    }
}
