use std::{fmt, ptr::NonNull};

use crate::{
    align::WORD,
    bucket::{bucket_bytes, class_of, stride, Bucket, BucketList, CLASS_COUNT, CLASS_SIZES, LARGE_TAG},
    header::Header,
    heap::{
        raise_high_water, report_fault, Fault, Heap, HeapStats, NoRefill, OnBroken, OnFull,
        PanicOnBroken, Provide, RegionError,
    },
    realloc::relocate,
    Heap1, Heap2, Heap3, Heap5, Heap6, Heap7, Pointer,
};

/// Heap that never asks for memory on its own when it runs out. [`Heap4`]
/// gives its empty buckets back before calling its own `full` handler, which
/// only works if the backing heap doesn't call a handler of its own first.
/// So every heap built with [`NoRefill`] is a backing heap, and so are the
/// wrappers around one.
pub trait Backing: Heap {}

impl<B: OnBroken> Backing for Heap1<NoRefill, B> {}
impl<B: OnBroken> Backing for Heap2<NoRefill, B> {}
impl<B: OnBroken> Backing for Heap3<NoRefill, B> {}
impl<B: OnBroken> Backing for Heap7<NoRefill, B> {}
impl<H: Backing, B: OnBroken> Backing for Heap5<H, B> {}
impl<H: Backing> Backing for Heap6<H> {}
impl<H: Backing, B: OnBroken> Backing for Heap4<H, NoRefill, B> {}

/// Buckets of one size class.
#[derive(Clone, Copy)]
struct SizeClass {
    /// Buckets with at least one used and one free slot, most used first.
    /// Allocating from the fullest bucket gives the others a chance to
    /// become empty.
    used: BucketList,
    /// Buckets with no used slots. They are kept around until memory runs
    /// short, see [`Heap4::release_empty_buckets`].
    empty: BucketList,
}

impl SizeClass {
    const fn new() -> Self {
        Self {
            used: BucketList::new(),
            empty: BucketList::new(),
        }
    }
}

/// Bucket counts of one size class, see [`Heap4::bucket_census`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassCensus {
    /// Usable bytes of the class.
    pub size: usize,
    /// Buckets with free and used slots.
    pub used_buckets: usize,
    /// Buckets with no used slots.
    pub empty_buckets: usize,
    /// Slots handed out from the partially used buckets.
    pub used_slots: usize,
}

/// Two level heap. Small requests are served from buckets of same size
/// slots in one of [`CLASS_COUNT`] size classes, everything else goes
/// straight to the `backing` heap, which also provides the memory for the
/// buckets themselves.
///
/// Every block handed out, small or large, has a one word tag in front of
/// it. Slots point back to their bucket, large blocks carry an odd marker.
///
/// Full buckets are not linked anywhere: they have nothing to give until one
/// of their slots is freed.
///
/// More memory comes from `full`, which donates to the backing heap. The
/// backing heap itself must be a [`Backing`] heap.
pub struct Heap4<H, F: OnFull = NoRefill, B: OnBroken = PanicOnBroken> {
    backing: H,
    classes: [SizeClass; CLASS_COUNT],
    full: F,
    broken: B,
    high_water: usize,
}

impl<H: Backing, F: OnFull, B: OnBroken> Heap4<H, F, B> {
    /// Builds a bucket heap on top of `backing`. `full` is asked for more
    /// memory only after all empty buckets were given back to `backing`.
    pub const fn new(backing: H, full: F, broken: B) -> Self {
        Self {
            backing,
            classes: [SizeClass::new(); CLASS_COUNT],
            full,
            broken,
            high_water: 0,
        }
    }

    /// Heap that provides large blocks and bucket storage.
    pub fn backing(&self) -> &H {
        &self.backing
    }

    /// Returns every empty bucket to the backing heap. Returns the number of
    /// buckets released.
    pub fn release_empty_buckets(&mut self) -> usize {
        let mut released = 0;

        for class in self.classes.iter_mut() {
            unsafe {
                for bucket in class.empty.iter() {
                    class.empty.remove(bucket);
                    self.backing.free(bucket.cast());
                    released += 1;
                }
            }
        }

        if released > 0 {
            log::debug!("heap4: released {released} empty buckets");
        }

        released
    }

    /// Bucket counts per size class.
    pub fn bucket_census(&self) -> [ClassCensus; CLASS_COUNT] {
        let mut census = [ClassCensus::default(); CLASS_COUNT];

        for (class, entry) in self.classes.iter().zip(census.iter_mut()) {
            entry.used_buckets = class.used.len();
            entry.empty_buckets = class.empty.len();
            unsafe {
                entry.used_slots = class.used.iter().map(|bucket| bucket.as_ref().data.used).sum();
            }
        }

        for (size, entry) in CLASS_SIZES.iter().zip(census.iter_mut()) {
            entry.size = *size;
        }

        census
    }

    /// Serves `class` from a bucket, creating one if needed. `None` when the
    /// backing heap has no room for a new bucket.
    unsafe fn alloc_small(&mut self, class: usize) -> Pointer<u8> {
        let lists = &mut self.classes[class];

        let bucket = match (lists.used.first(), lists.empty.first()) {
            (Some(bucket), _) => bucket,
            (None, Some(bucket)) => {
                lists.empty.remove(bucket);
                lists.used.link_front(bucket);
                bucket
            }
            (None, None) => {
                let address = self.backing.alloc(bucket_bytes(class))?;
                let bucket = Header::<Bucket>::build(class, address);
                lists.used.link_front(bucket);
                log::debug!("heap4: new bucket for {} byte blocks at {address:p}", CLASS_SIZES[class]);
                bucket
            }
        };

        let slot = Header::<Bucket>::pop_slot(bucket)?;

        if bucket.as_ref().data.is_full() {
            lists.used.remove(bucket);
        }

        raise_high_water(&mut self.high_water, slot, CLASS_SIZES[class]);

        Some(slot)
    }

    /// Serves `size` bytes straight from the backing heap, releasing empty
    /// buckets and then asking `full` for memory when it runs out.
    unsafe fn alloc_large(&mut self, size: usize) -> Pointer<u8> {
        let total = size.checked_add(WORD)?;

        loop {
            if let Some(block) = self.backing.alloc(total) {
                *block.as_ptr().cast::<usize>() = LARGE_TAG;
                let address = NonNull::new_unchecked(block.as_ptr().add(WORD));
                raise_high_water(&mut self.high_water, address, size);
                return Some(address);
            }

            if self.release_empty_buckets() > 0 {
                continue;
            }

            log::debug!("heap4: backing heap has no block of {total} bytes, calling full handler");

            if !self.full.heap_full(&mut self.backing, total) {
                return None;
            }
        }
    }

    /// Puts a slot back into `bucket` and moves the bucket to where it
    /// belongs.
    unsafe fn free_small(&mut self, bucket: NonNull<Header<Bucket>>, address: NonNull<u8>) {
        let data = &bucket.as_ref().data;

        if data.class >= CLASS_COUNT {
            report_fault(&mut self.broken, Fault::CorruptHeader { address: address.as_ptr() as usize });
        }

        if data.is_empty() {
            report_fault(&mut self.broken, Fault::DoubleFree { address: address.as_ptr() as usize });
        }

        let was_full = data.is_full();
        let lists = &mut self.classes[data.class];

        Header::<Bucket>::push_slot(bucket, address);

        if was_full {
            lists.used.link_back(bucket);
        } else if bucket.as_ref().data.is_empty() {
            lists.used.remove(bucket);
            lists.empty.link_back(bucket);
        } else if let Some(next) = bucket.as_ref().next {
            // One step towards the tail keeps the fullest buckets in front.
            if next.as_ref().data.used > bucket.as_ref().data.used {
                lists.used.remove(bucket);
                lists.used.link_after(next, bucket);
            }
        }
    }
}

impl<H: Backing, F: OnFull, B: OnBroken> Provide for Heap4<H, F, B> {
    unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
        self.backing.provide_memory(region, size)
    }
}

impl<H: Backing, F: OnFull, B: OnBroken> Heap for Heap4<H, F, B> {
    unsafe fn alloc(&mut self, size: usize) -> Pointer<u8> {
        if let Some(class) = class_of(size) {
            if let Some(address) = self.alloc_small(class) {
                log::trace!("heap4: alloc({size}) -> {address:p} from class {class}");
                return Some(address);
            }
        }

        let address = self.alloc_large(size)?;
        log::trace!("heap4: alloc({size}) -> {address:p}");
        Some(address)
    }

    unsafe fn free(&mut self, address: NonNull<u8>) {
        log::trace!("heap4: free({address:p})");

        match Header::<Bucket>::tag_of(address) {
            LARGE_TAG => self.backing.free(NonNull::new_unchecked(address.as_ptr().sub(WORD))),
            tag => match NonNull::new(tag as *mut Header<Bucket>) {
                Some(bucket) => self.free_small(bucket, address),
                None => report_fault(&mut self.broken, Fault::CorruptHeader { address: address.as_ptr() as usize }),
            },
        }
    }

    unsafe fn realloc(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        if Header::<Bucket>::tag_of(address) != LARGE_TAG {
            if new_size <= self.usable_size(address) {
                return Some(address);
            }
            return relocate(self, address, new_size);
        }

        // Small enough for a bucket now, move it there.
        if class_of(new_size).is_some() {
            return relocate(self, address, new_size);
        }

        let block = NonNull::new_unchecked(address.as_ptr().sub(WORD));
        let total = new_size.checked_add(WORD)?;

        match self.backing.realloc(block, total) {
            Some(block) => {
                let address = NonNull::new_unchecked(block.as_ptr().add(WORD));
                raise_high_water(&mut self.high_water, address, new_size);
                Some(address)
            }
            None => relocate(self, address, new_size),
        }
    }

    unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        match Header::<Bucket>::tag_of(address) {
            LARGE_TAG => self.backing.usable_size(NonNull::new_unchecked(address.as_ptr().sub(WORD))) - WORD,
            tag => stride((*(tag as *const Header<Bucket>)).data.class) - WORD,
        }
    }

    fn stats(&self) -> HeapStats {
        let mut stats = self.backing.stats();
        stats.high_water = self.high_water;
        stats
    }

    fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "buckets by class:")?;
        for census in self.bucket_census() {
            if census.used_buckets + census.empty_buckets == 0 {
                continue;
            }
            writeln!(
                out,
                "  {:>4} bytes: {} used ({} slots), {} empty",
                census.size, census.used_buckets, census.used_slots, census.empty_buckets
            )?;
        }
        self.backing.report(out)
    }
}
