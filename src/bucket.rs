use std::{mem, ptr::NonNull};

use crate::{
    align::{align, WORD},
    header::Header,
    list::{LinkedList, Node},
    Pointer,
};

/// Number of size classes served from buckets.
pub const CLASS_COUNT: usize = 12;

/// Usable bytes of each size class. Every class is about 1.5 times the one
/// before it, so a request never wastes much more than half its size.
pub const CLASS_SIZES: [usize; CLASS_COUNT] = [8, 12, 20, 28, 44, 64, 92, 140, 208, 308, 464, 692];

/// Target size of the slot area of a bucket.
const BUCKET_BYTES: usize = 512;

/// Buckets always hold at least this many slots.
const MIN_SLOTS: usize = 8;

/// Tag stored in front of blocks that don't live in a bucket. Bucket headers
/// are word aligned, so their address can never be odd.
pub(crate) const LARGE_TAG: usize = 1;

/// Returns the smallest size class that can hold `size` bytes, or `None` if
/// the request is too big for any bucket.
///
/// The search is a binary chop over [`CLASS_SIZES`] with power of two steps:
/// the result is the number of classes smaller than `size`.
///
/// ```rust
/// use heapkit::class_of;
///
/// assert_eq!(class_of(5), Some(0));
/// assert_eq!(class_of(8), Some(0));
/// assert_eq!(class_of(9), Some(1));
/// assert_eq!(class_of(692), Some(11));
/// assert_eq!(class_of(693), None);
/// ```
pub const fn class_of(size: usize) -> Option<usize> {
    if size > CLASS_SIZES[CLASS_COUNT - 1] {
        return None;
    }

    let mut index = 0;
    let mut step = (CLASS_COUNT + 1).next_power_of_two() / 2;

    while step > 0 {
        if index + step <= CLASS_COUNT && CLASS_SIZES[index + step - 1] < size {
            index += step;
        }
        step /= 2;
    }

    Some(index)
}

/// Distance between two slots of `class`: the tag word plus the class size,
/// rounded up so every slot stays word aligned.
pub(crate) const fn stride(class: usize) -> usize {
    align(WORD + CLASS_SIZES[class])
}

/// Number of slots in a bucket of `class`.
pub(crate) const fn capacity(class: usize) -> usize {
    let slots = BUCKET_BYTES / stride(class);
    if slots > MIN_SLOTS {
        slots
    } else {
        MIN_SLOTS
    }
}

/// Bytes to request from the backing heap for one bucket of `class`.
pub(crate) const fn bucket_bytes(class: usize) -> usize {
    BUCKET_HEADER_SIZE + capacity(class) * stride(class)
}

/// A slab of same size slots carved out of one backing allocation:
///
/// ```text
/// +--------+-----+--------+-----+--------+-----+--------+
/// | Bucket | tag | slot   | tag | slot   | tag | slot   |  ...
/// +--------+-----+--------+-----+--------+-----+--------+
///     ^       |               |               |
///     +-------+---------------+---------------+
/// ```
///
/// The tag in front of every slot points back to the bucket header so that
/// freeing a slot finds its bucket in O(1). Free slots are chained through
/// their first word.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Size class index.
    pub class: usize,
    /// Slots currently handed out.
    pub used: usize,
    /// Total number of slots.
    pub capacity: usize,
    /// First free slot.
    free: Pointer<u8>,
}

/// Size of the bucket header in bytes.
pub(crate) const BUCKET_HEADER_SIZE: usize = mem::size_of::<Header<Bucket>>();

/// Buckets of one class are chained in one of two lists, see
/// [`crate::Heap4`].
pub(crate) type BucketList = LinkedList<Bucket>;

impl Bucket {
    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

impl Header<Bucket> {
    /// Builds an unlinked bucket of `class` at `address`, which must hold
    /// [`bucket_bytes`] bytes.
    pub unsafe fn build(class: usize, address: NonNull<u8>) -> NonNull<Self> {
        let bucket = address.cast::<Self>();
        let capacity = capacity(class);
        let stride = stride(class);

        bucket.as_ptr().write(Node {
            next: None,
            prev: None,
            data: Bucket {
                class,
                used: 0,
                capacity,
                free: None,
            },
        });

        let slots = Self::content_address_of(bucket);

        // Chain slots back to front so the lowest one is handed out first.
        for i in (0..capacity).rev() {
            let tag = slots.as_ptr().add(i * stride);
            *tag.cast::<usize>() = bucket.as_ptr() as usize;
            let slot = NonNull::new_unchecked(tag.add(WORD));
            *slot.as_ptr().cast::<Pointer<u8>>() = (*bucket.as_ptr()).data.free;
            (*bucket.as_ptr()).data.free = Some(slot);
        }

        bucket
    }

    /// Hands out one free slot.
    pub unsafe fn pop_slot(mut bucket: NonNull<Self>) -> Pointer<u8> {
        let data = &mut bucket.as_mut().data;
        let slot = data.free?;
        data.free = *slot.as_ptr().cast::<Pointer<u8>>();
        data.used += 1;
        Some(slot)
    }

    /// Takes `slot` back.
    pub unsafe fn push_slot(mut bucket: NonNull<Self>, slot: NonNull<u8>) {
        let data = &mut bucket.as_mut().data;
        *slot.as_ptr().cast::<Pointer<u8>>() = data.free;
        data.free = Some(slot);
        data.used -= 1;
    }

    /// Tag word stored right before `address`.
    #[inline]
    pub unsafe fn tag_of(address: NonNull<u8>) -> usize {
        *address.as_ptr().sub(WORD).cast::<usize>()
    }
}
