use crate::{
    align::{align, WORD},
    header::Header,
    heap::{OnFull, Provide},
    platform,
    region::{determine_region_length, Region, RegionList, REGION_HEADER_SIZE},
};

/// Bookkeeping headroom added to every refill so that the heap receiving the
/// pages can satisfy the request after its own headers are written. Heap3
/// has the largest minimum block, this covers it with room to spare.
const REFILL_HEADROOM: usize = 32 * WORD;

/// [`OnFull`] handler that maps fresh pages from the OS whenever a heap runs
/// out of memory and donates them. Every chunk keeps a [`Region`] header so
/// that all of them can be unmapped again when the handler is dropped.
///
/// Pointers handed out by the heap are backed by these pages, so the handler
/// must outlive every allocation. Storing it inside the heap it refills
/// takes care of that.
///
/// # Examples
///
/// ```rust
/// use heapkit::{Heap, Heap1, Fit, OsPages, PanicOnBroken};
///
/// let mut heap = Heap1::new(Fit::First, OsPages::new(), PanicOnBroken);
///
/// unsafe {
///     let address = heap.alloc(10_000).unwrap();
///     address.as_ptr().write_bytes(7, 10_000);
///     heap.free(address);
/// }
/// ```
pub struct OsPages {
    /// Chunks mapped so far.
    chunks: RegionList,
    /// Sum of the lengths of all chunks.
    mapped: usize,
    /// Maximum number of bytes this handler may map, if any.
    budget: Option<usize>,
}

// Chunks are only reachable through this handler.
unsafe impl Send for OsPages {}

impl OsPages {
    /// Handler without a mapping limit.
    pub const fn new() -> Self {
        Self {
            chunks: RegionList::new(),
            mapped: 0,
            budget: None,
        }
    }

    /// Handler that declines once `bytes` have been mapped in total.
    pub const fn with_budget(bytes: usize) -> Self {
        Self {
            chunks: RegionList::new(),
            mapped: 0,
            budget: Some(bytes),
        }
    }

    /// Bytes mapped so far, headers included.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped
    }

    /// Number of chunks mapped so far.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for OsPages {
    fn default() -> Self {
        Self::new()
    }
}

impl OnFull for OsPages {
    fn heap_full(&mut self, heap: &mut dyn Provide, requested: usize) -> bool {
        let length = determine_region_length(align(requested), REFILL_HEADROOM, platform::page_size());

        if self.budget.is_some_and(|budget| self.mapped + length > budget) {
            log::debug!("page budget exhausted, declining refill of {requested} bytes");
            return false;
        }

        unsafe {
            let Some(address) = platform::request_memory(length) else {
                log::debug!("OS refused {length} bytes for a refill");
                return false;
            };

            let region = self.chunks.append(Region { size: length }, address);
            let content = Header::<Region>::start_of(region);

            match heap.provide_memory(content, length - REGION_HEADER_SIZE) {
                Ok(()) => {
                    self.mapped += length;
                    log::debug!("mapped {length} bytes at {address:p} for a request of {requested}");
                    true
                }
                Err(error) => {
                    log::warn!("heap rejected mapped chunk: {error}");
                    self.chunks.remove(region);
                    platform::return_memory(address, length);
                    false
                }
            }
        }
    }
}

impl Drop for OsPages {
    fn drop(&mut self) {
        unsafe {
            for region in self.chunks.iter() {
                let length = region.as_ref().total_size();
                self.chunks.remove(region);
                platform::return_memory(region.cast(), length);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::heap::RegionError;

    /// Records donations without touching the memory.
    #[derive(Default)]
    struct Recorder {
        donated: Vec<(usize, usize)>,
    }

    impl Provide for Recorder {
        unsafe fn provide_memory(&mut self, region: NonNull<u8>, size: usize) -> Result<(), RegionError> {
            region.as_ptr().write_bytes(0, size);
            self.donated.push((region.as_ptr() as usize, size));
            Ok(())
        }
    }

    #[test]
    fn maps_and_donates() {
        let mut pages = OsPages::new();
        let mut recorder = Recorder::default();

        assert!(pages.heap_full(&mut recorder, 100));
        assert!(pages.heap_full(&mut recorder, 3 * platform::page_size()));

        assert_eq!(pages.chunks(), 2);
        assert_eq!(recorder.donated.len(), 2);
        assert!(recorder.donated[0].1 >= 100 + REFILL_HEADROOM);
        assert!(recorder.donated[1].1 >= 3 * platform::page_size());
        assert_eq!(pages.mapped_bytes() % platform::page_size(), 0);
    }

    #[test]
    fn budget_is_respected() {
        let page = platform::page_size();
        let mut pages = OsPages::with_budget(page);
        let mut recorder = Recorder::default();

        assert!(pages.heap_full(&mut recorder, 16));
        assert!(!pages.heap_full(&mut recorder, 16));
        assert_eq!(pages.mapped_bytes(), page);
    }

    #[test]
    fn rejected_chunks_are_returned() {
        struct Picky;
        impl Provide for Picky {
            unsafe fn provide_memory(&mut self, _: NonNull<u8>, size: usize) -> Result<(), RegionError> {
                Err(RegionError::TooSmall { size, minimum: usize::MAX })
            }
        }

        let mut pages = OsPages::new();
        assert!(!pages.heap_full(&mut Picky, 16));
        assert_eq!(pages.chunks(), 0);
        assert_eq!(pages.mapped_bytes(), 0);
    }
}
