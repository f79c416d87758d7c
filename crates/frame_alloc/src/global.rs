use core::ptr::NonNull;

use mutex_api::Mutex;

use crate::{
    ALLOC_POISON, FREE_POISON,
    free_list::{self, FreeList},
    ref_table::{RefCounts, RefTable},
    region::FrameRegion,
};

/// Frame allocator with a single free pool shared by every processing
/// unit.
pub struct FrameAllocator<P, R, const PAGE_SIZE: usize> {
    region: FrameRegion<PAGE_SIZE>,
    pool: P,
    refs: RefTable<R>,
}

unsafe impl<P, R, const PAGE_SIZE: usize> Send for FrameAllocator<P, R, PAGE_SIZE>
where
    P: Send,
    R: Send,
{
}

unsafe impl<P, R, const PAGE_SIZE: usize> Sync for FrameAllocator<P, R, PAGE_SIZE>
where
    P: Sync,
    R: Sync,
{
}

impl<P, R, const PAGE_SIZE: usize> FrameAllocator<P, R, PAGE_SIZE>
where
    P: Mutex<Data = FreeList>,
    R: Mutex<Data = RefCounts>,
{
    /// Creates the allocator and donates every frame of `region` to the
    /// pool.
    ///
    /// Runs once at boot, before any concurrent caller exists. Donation
    /// reuses the release path: each frame is marked owned by the boot
    /// code, then freed.
    ///
    /// # Safety
    ///
    /// `region` must describe memory that is valid, unused by anything
    /// else, and managed by no other allocator.
    pub unsafe fn new(region: FrameRegion<PAGE_SIZE>) -> Self {
        assert!(free_list::LINK_SIZE <= PAGE_SIZE);

        let allocator = Self {
            pool: P::new(FreeList::new()),
            refs: RefTable::new(region.frames()),
            region,
        };
        for index in 0..allocator.region.frames() {
            allocator.refs.acquire(index);
            unsafe {
                allocator.free(allocator.region.frame_at(index));
            }
        }
        allocator
    }

    /// Allocates one page-sized frame of physical memory.
    ///
    /// The frame comes back filled with [`ALLOC_POISON`] and owned by
    /// exactly one holder. Returns `None` when no frame is left;
    /// exhaustion is ordinary data for the caller, not a fault.
    #[must_use]
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let frame = self.pool.lock().pop()?;
        Some(self.take(frame, ALLOC_POISON))
    }

    /// Allocates one zeroed frame (page-table pages want zeroes, not
    /// poison).
    #[must_use]
    pub fn alloc_zeroed(&self) -> Option<NonNull<u8>> {
        let frame = self.pool.lock().pop()?;
        Some(self.take(frame, 0))
    }

    fn take(&self, frame: NonNull<u8>, fill: u8) -> NonNull<u8> {
        unsafe {
            frame.write_bytes(fill, PAGE_SIZE);
        }
        self.refs.acquire(self.region.index_of(frame));
        frame
    }

    /// Frees the frame of physical memory pointed at by `frame`, which
    /// normally should have been returned by a call to [`Self::alloc`].
    ///
    /// A frame shared via [`Self::dup`] stays owned until its last holder
    /// frees it; only then is it scrubbed and pooled again.
    ///
    /// # Safety
    ///
    /// `frame` must have been returned by this allocator and must not be
    /// accessed afterwards by the caller dropping it.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is misaligned or outside the managed range, or
    /// if the frame has no owners left (double free).
    pub unsafe fn free(&self, frame: NonNull<u8>) {
        let index = self.region.index_of(frame);
        if !self.refs.release(index) {
            return;
        }
        // Fill with junk to catch dangling refs.
        unsafe {
            frame.write_bytes(FREE_POISON, PAGE_SIZE);
        }
        unsafe {
            self.pool.lock().push(frame);
        }
    }

    /// Adds one owner to an already-owned frame, so a second mapping can
    /// share it (copy-on-write). Every `dup` obligates one more
    /// [`Self::free`].
    ///
    /// # Safety
    ///
    /// `frame` must be a live allocation of this allocator.
    pub unsafe fn dup(&self, frame: NonNull<u8>) {
        self.refs.dup(self.region.index_of(frame));
    }

    /// Number of frames currently sitting in the pool.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.pool.lock().len()
    }

    #[must_use]
    pub fn region(&self) -> &FrameRegion<PAGE_SIZE> {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use core::cell::UnsafeCell;
    use std::collections::HashSet;

    use mutex_api::StdMutex;

    use super::*;

    const PAGE_SIZE: usize = 64;
    const FRAMES: usize = 10;

    #[repr(align(64))]
    struct Heap(UnsafeCell<[u8; PAGE_SIZE * FRAMES]>);

    type TestAllocator = FrameAllocator<StdMutex<FreeList>, StdMutex<RefCounts>, PAGE_SIZE>;

    fn new_heap() -> Heap {
        Heap(UnsafeCell::new([0; PAGE_SIZE * FRAMES]))
    }

    fn new_allocator(heap: &Heap) -> TestAllocator {
        let range = unsafe { (*heap.0.get()).as_mut_ptr_range() };
        let region = FrameRegion::new(range).unwrap();
        unsafe { FrameAllocator::new(region) }
    }

    #[test]
    fn test_init_donates_every_frame() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);
        assert_eq!(allocator.free_frames(), FRAMES);
    }

    #[test]
    fn test_alloc_until_exhaustion() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let mut addrs = HashSet::new();
        for _ in 0..FRAMES {
            let frame = allocator.alloc().unwrap();
            assert_eq!(frame.addr().get() % PAGE_SIZE, 0, "frame is not aligned");
            assert!(allocator.region().contains(frame.addr().get()));
            assert!(addrs.insert(frame.addr()), "frame is duplicated");
        }
        assert!(allocator.alloc().is_none());
        assert_eq!(allocator.free_frames(), 0);
    }

    #[test]
    fn test_realloc_after_free_stays_in_range() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frames: Vec<_> = (0..FRAMES).map(|_| allocator.alloc().unwrap()).collect();
        let addrs: HashSet<_> = frames.iter().map(|frame| frame.addr()).collect();

        unsafe {
            allocator.free(frames[3]);
        }
        let frame = allocator.alloc().unwrap();
        assert!(addrs.contains(&frame.addr()));
        assert!(allocator.alloc().is_none());
    }

    #[test]
    fn test_alloc_fills_with_poison() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frame = allocator.alloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == ALLOC_POISON));

        let zeroed = allocator.alloc_zeroed().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_scrubs_past_the_link() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frame = allocator.alloc().unwrap();
        unsafe {
            frame.write_bytes(0xaa, PAGE_SIZE);
            allocator.free(frame);
        }
        // The link node reuses the frame's first bytes; everything past it
        // must carry the free fill.
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes[free_list::LINK_SIZE..].iter().all(|&b| b == FREE_POISON));
    }

    #[test]
    fn test_shared_frame_survives_until_last_free() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frame = allocator.alloc().unwrap();
        unsafe {
            allocator.dup(frame);
            allocator.dup(frame);
        }

        unsafe {
            allocator.free(frame);
            allocator.free(frame);
        }
        // Two owners dropped, one left: the frame must stay out of the pool
        // and keep its contents.
        assert_eq!(allocator.free_frames(), FRAMES - 1);
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == ALLOC_POISON));

        unsafe {
            allocator.free(frame);
        }
        assert_eq!(allocator.free_frames(), FRAMES);
    }

    #[test]
    #[should_panic(expected = "frame reference count underflow")]
    fn test_double_free() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frame = allocator.alloc().unwrap();
        unsafe {
            allocator.free(frame);
            allocator.free(frame);
        }
    }

    #[test]
    #[should_panic(expected = "frame address is not page-aligned")]
    fn test_free_unaligned_address() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let frame = allocator.alloc().unwrap();
        unsafe {
            allocator.free(frame.byte_add(1));
        }
    }

    #[test]
    #[should_panic(expected = "frame address outside the managed range")]
    fn test_free_address_below_the_base() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let below = allocator
            .region()
            .base()
            .map_addr(|addr| core::num::NonZero::new(addr.get() - PAGE_SIZE).unwrap());
        unsafe {
            allocator.free(below);
        }
    }

    #[test]
    #[should_panic(expected = "frame address outside the managed range")]
    fn test_free_address_at_the_top() {
        let heap = new_heap();
        let allocator = new_allocator(&heap);

        let top = NonNull::new(core::ptr::without_provenance_mut(allocator.region().top())).unwrap();
        unsafe {
            allocator.free(top);
        }
    }

    #[test]
    fn test_full_size_pages() {
        const FULL: usize = crate::PAGE_SIZE;
        #[repr(align(4096))]
        struct Page([u8; FULL]);

        let mut pages = Box::new([const { Page([0; FULL]) }; 4]);
        let start = pages.as_mut_ptr().cast::<u8>();
        let range = start..unsafe { start.add(4 * FULL) };
        let region = FrameRegion::<FULL>::new(range).unwrap();
        let allocator: FrameAllocator<StdMutex<FreeList>, StdMutex<RefCounts>, FULL> =
            unsafe { FrameAllocator::new(region) };

        let frames: Vec<_> = (0..4).map(|_| allocator.alloc().unwrap()).collect();
        assert!(allocator.alloc().is_none());
        for frame in frames {
            assert_eq!(frame.addr().get() % FULL, 0);
            unsafe {
                allocator.free(frame);
            }
        }
        assert_eq!(allocator.free_frames(), 4);
    }

    #[test]
    fn test_parallel_alloc_free_conserves_frames() {
        use spin_mutex::SpinLock;

        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        let heap = new_heap();
        let range = unsafe { (*heap.0.get()).as_mut_ptr_range() };
        let region = FrameRegion::new(range).unwrap();
        let allocator: FrameAllocator<SpinLock<FreeList>, SpinLock<RefCounts>, PAGE_SIZE> =
            unsafe { FrameAllocator::new(region) };

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let mut held = Vec::new();
                        while let Some(frame) = allocator.alloc() {
                            held.push(frame);
                            if held.len() == FRAMES / THREADS {
                                break;
                            }
                        }
                        for frame in held {
                            unsafe {
                                allocator.free(frame);
                            }
                        }
                    }
                });
            }
        });
        assert_eq!(allocator.free_frames(), FRAMES);
    }
}
