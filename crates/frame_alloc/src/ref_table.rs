use alloc::{boxed::Box, vec};

use mutex_api::Mutex;

/// One owner count per frame index.
///
/// 0 means the frame is free to live in a pool; a positive count is the
/// number of logical owners currently holding the frame.
pub struct RefCounts(Box<[u32]>);

impl RefCounts {
    fn new(frames: usize) -> Self {
        Self(vec![0; frames].into_boxed_slice())
    }
}

/// Per-frame owner counts behind a single lock.
///
/// Every critical section is one counter read and write, so a single lock
/// over the whole table suffices.
pub(crate) struct RefTable<R> {
    counts: R,
}

impl<R> RefTable<R>
where
    R: Mutex<Data = RefCounts>,
{
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            counts: R::new(RefCounts::new(frames)),
        }
    }

    /// Marks a frame leaving a pool as owned by exactly one holder.
    ///
    /// # Panics
    ///
    /// Panics if the frame already has owners; a pooled frame with live
    /// references means the pool metadata is corrupted.
    pub(crate) fn acquire(&self, index: usize) {
        let mut counts = self.counts.lock();
        assert_eq!(
            counts.0[index], 0,
            "frame taken from a pool has live references"
        );
        counts.0[index] = 1;
    }

    /// Adds one owner to an already-owned frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no owner to share from.
    pub(crate) fn dup(&self, index: usize) {
        let mut counts = self.counts.lock();
        assert!(counts.0[index] > 0, "shared frame has no owner");
        counts.0[index] += 1;
    }

    /// Drops one owner; returns `true` when the frame has no owners left
    /// and must rejoin a pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no owners to drop: a double free, or a
    /// lost increment.
    pub(crate) fn release(&self, index: usize) -> bool {
        let mut counts = self.counts.lock();
        assert!(counts.0[index] > 0, "frame reference count underflow");
        counts.0[index] -= 1;
        counts.0[index] == 0
    }
}
