use crate::error::AllocError;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

const SLAB_ALIGN: usize = 4096;

/// Default per-call `sbrk` maximum, matching hosts whose increment
/// argument is a C `int`.
pub const DEFAULT_SBRK_MAX: usize = i32::MAX as usize;

/// A fixed-capacity linear region with an sbrk-style break cursor.
///
/// The region is reserved once at construction and handed to the
/// allocator, which owns its bytes for the lifetime of the arena. The
/// break only moves forward through [`sbrk`](HostHeap::sbrk), except for
/// [`reset_brk`](HostHeap::reset_brk), which the allocator uses to
/// restore a prior size after a failed growth.
pub struct HostHeap {
    slab: NonNull<u8>,
    layout: Layout,
    brk: usize,
    sbrk_max: usize,
}

impl HostHeap {
    pub fn new(capacity: usize) -> Result<HostHeap, AllocError> {
        Self::with_sbrk_limit(capacity, DEFAULT_SBRK_MAX)
    }

    /// A host whose `sbrk` refuses increments above `limit` bytes.
    pub fn with_sbrk_limit(capacity: usize, limit: usize) -> Result<HostHeap, AllocError> {
        debug_assert!(limit > 0);
        let layout = Layout::from_size_align(capacity.max(1), SLAB_ALIGN)
            .map_err(|_| AllocError::HeapExhausted)?;
        let ptr = unsafe { alloc(layout) };

        match NonNull::new(ptr) {
            Some(slab) => Ok(HostHeap {
                slab,
                layout,
                brk: 0,
                sbrk_max: limit,
            }),
            None => Err(AllocError::HeapExhausted),
        }
    }

    /// Advances the break by `incr` bytes and returns the old break.
    /// Fails without partial effect if `incr` exceeds the per-call limit
    /// or would pass the capacity.
    pub fn sbrk(&mut self, incr: usize) -> Result<*mut u8, AllocError> {
        if incr > self.sbrk_max {
            return Err(AllocError::HeapExhausted);
        }
        match self.brk.checked_add(incr) {
            Some(new_brk) if new_brk <= self.capacity() => {
                let old = unsafe { self.slab.as_ptr().add(self.brk) };
                self.brk = new_brk;
                Ok(old)
            }
            _ => Err(AllocError::HeapExhausted),
        }
    }

    pub fn heap_lo(&self) -> *mut u8 {
        self.slab.as_ptr()
    }

    /// Bytes currently assigned, from the base to the break.
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn sbrk_max(&self) -> usize {
        self.sbrk_max
    }

    /// Moves the break back to the base of the region.
    pub fn reset_brk(&mut self) {
        self.brk = 0;
    }
}

impl Drop for HostHeap {
    fn drop(&mut self) {
        unsafe { dealloc(self.slab.as_ptr(), self.layout) }
    }
}
