use core::ptr::NonNull;

use arrayvec::ArrayVec;
use mutex_api::Mutex;

use crate::{
    ALLOC_POISON, FREE_POISON,
    cpu::CpuPin,
    free_list::{self, FreeList},
    ref_table::{RefCounts, RefTable},
    region::FrameRegion,
};

/// Maximum number of processing units the sharded allocator supports.
pub const MAX_CPUS: usize = 8;

/// Frame allocator with one free pool per processing unit.
///
/// Each unit allocates and frees through its own pool under its own lock,
/// so units do not contend on a single list head. A unit whose pool runs
/// dry imports one frame at a time from a peer (stealing); allocation
/// fails only when every pool is empty at once.
pub struct PerCpuFrameAllocator<P, R, const PAGE_SIZE: usize> {
    region: FrameRegion<PAGE_SIZE>,
    shards: ArrayVec<P, MAX_CPUS>,
    refs: RefTable<R>,
}

unsafe impl<P, R, const PAGE_SIZE: usize> Send for PerCpuFrameAllocator<P, R, PAGE_SIZE>
where
    P: Send,
    R: Send,
{
}

unsafe impl<P, R, const PAGE_SIZE: usize> Sync for PerCpuFrameAllocator<P, R, PAGE_SIZE>
where
    P: Sync,
    R: Sync,
{
}

impl<P, R, const PAGE_SIZE: usize> PerCpuFrameAllocator<P, R, PAGE_SIZE>
where
    P: Mutex<Data = FreeList>,
    R: Mutex<Data = RefCounts>,
{
    /// Creates the allocator and donates every frame of `region` to the
    /// booting unit's pool; the other units fill up by stealing.
    ///
    /// Runs once at boot, before any concurrent caller exists. Donation
    /// reuses the release path: each frame is marked owned by the boot
    /// code, then freed on the booting unit.
    ///
    /// # Safety
    ///
    /// `region` must describe memory that is valid, unused by anything
    /// else, and managed by no other allocator.
    ///
    /// # Panics
    ///
    /// Panics if `cpus` is zero or exceeds [`MAX_CPUS`].
    pub unsafe fn new(region: FrameRegion<PAGE_SIZE>, cpus: usize, boot: &impl CpuPin) -> Self {
        assert!(free_list::LINK_SIZE <= PAGE_SIZE);
        assert!(cpus >= 1 && cpus <= MAX_CPUS, "cpu count out of range");

        let mut shards = ArrayVec::new();
        for _ in 0..cpus {
            shards.push(P::new(FreeList::new()));
        }
        let allocator = Self {
            shards,
            refs: RefTable::new(region.frames()),
            region,
        };
        for index in 0..allocator.region.frames() {
            allocator.refs.acquire(index);
            unsafe {
                allocator.free(boot, allocator.region.frame_at(index));
            }
        }
        allocator
    }

    /// The shard owned by the unit `cpu` is pinned to.
    fn home(&self, cpu: &impl CpuPin) -> usize {
        cpu.id() % self.shards.len()
    }

    /// Allocates one page-sized frame of physical memory, preferring the
    /// calling unit's own pool.
    ///
    /// When the home pool is empty, one frame is stolen from a peer and
    /// the pop retried. The frame comes back filled with [`ALLOC_POISON`]
    /// and owned by exactly one holder. Returns `None` only after a full
    /// steal scan finds every peer empty as well.
    #[must_use]
    pub fn alloc(&self, cpu: &impl CpuPin) -> Option<NonNull<u8>> {
        self.alloc_filled(cpu, ALLOC_POISON)
    }

    /// Allocates one zeroed frame (page-table pages want zeroes, not
    /// poison).
    #[must_use]
    pub fn alloc_zeroed(&self, cpu: &impl CpuPin) -> Option<NonNull<u8>> {
        self.alloc_filled(cpu, 0)
    }

    fn alloc_filled(&self, cpu: &impl CpuPin, fill: u8) -> Option<NonNull<u8>> {
        let home = self.home(cpu);
        loop {
            if let Some(frame) = self.shards[home].lock().pop() {
                unsafe {
                    frame.write_bytes(fill, PAGE_SIZE);
                }
                self.refs.acquire(self.region.index_of(frame));
                return Some(frame);
            }
            if !self.steal_into(home) {
                return None;
            }
        }
    }

    /// Imports one frame from the first nonempty peer pool into `home`.
    ///
    /// Peers are scanned in ascending unit order, skipping `home`. At most
    /// one shard lock is held at any instant: the peer's lock is dropped
    /// before the home lock is taken, so two units stealing from each
    /// other cannot wait on each other in a cycle. Moves at most one
    /// frame; returns `false` if every peer was empty.
    fn steal_into(&self, home: usize) -> bool {
        for peer in 0..self.shards.len() {
            if peer == home {
                continue;
            }
            let stolen = self.shards[peer].lock().pop();
            if let Some(frame) = stolen {
                unsafe {
                    self.shards[home].lock().push(frame);
                }
                return true;
            }
        }
        false
    }

    /// Frees the frame of physical memory pointed at by `frame`, which
    /// normally should have been returned by a call to [`Self::alloc`].
    ///
    /// A frame shared via [`Self::dup`] stays owned until its last holder
    /// frees it; only then is it scrubbed and pushed onto the releasing
    /// unit's own pool.
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
    pub unsafe fn free(&self, cpu: &impl CpuPin, frame: NonNull<u8>) {
        let index = self.region.index_of(frame);
        if !self.refs.release(index) {
            return;
        }
        // Fill with junk to catch dangling refs.
        unsafe {
            frame.write_bytes(FREE_POISON, PAGE_SIZE);
        }
        let home = self.home(cpu);
        unsafe {
            self.shards[home].lock().push(frame);
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

    /// Number of processing-unit pools.
    #[must_use]
    pub fn cpus(&self) -> usize {
        self.shards.len()
    }

    /// Number of frames currently sitting in one unit's pool.
    #[must_use]
    pub fn shard_frames(&self, unit: usize) -> usize {
        self.shards[unit].lock().len()
    }

    /// Number of free frames across every pool.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    #[must_use]
    pub fn region(&self) -> &FrameRegion<PAGE_SIZE> {
        &self.region
    }
}
