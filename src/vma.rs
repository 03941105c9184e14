//! A simple stack allocator for the module load window.
//!
//! Module unloads are LIFO-biased but not strictly LIFO: closing the most
//! recently opened module rewinds the stack immediately, while an interior
//! free leaves a tombstone that is reclaimed once everything above it is
//! gone.

use crate::arch::{PAGE_SIZE, align_up};
use core::ops::Range;
use log::{debug, warn};

/// Approximate borders of the free virtual address space the loader can
/// use on the target.
pub const DEFAULT_VMA_WINDOW: Range<usize> = 0x9800_0000..0xA200_0000;

/// Upper bound on simultaneously tracked reservations.
pub const MAX_ALLOCS: usize = 256;

struct Record {
    ptr: usize,
    size: usize,
    live: bool,
}

pub(crate) struct VmaAllocator {
    start: usize,
    end: usize,
    top: usize,
    free: usize,
    allocs: Vec<Record>,
}

impl VmaAllocator {
    pub(crate) fn new(window: Range<usize>) -> VmaAllocator {
        debug!(
            "vma: window {:#010x}..{:#010x} ({:#x} bytes)",
            window.start,
            window.end,
            window.end - window.start
        );
        VmaAllocator {
            start: window.start,
            end: window.end,
            top: window.start,
            free: window.end - window.start,
            allocs: Vec::new(),
        }
    }

    /// Reserve `size` bytes, rounded up to page alignment.
    ///
    /// Returns the base of the reservation, or `None` if the size is
    /// zero, the window is exhausted, or the record table is full.
    pub(crate) fn alloc(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size, PAGE_SIZE);

        if size == 0 {
            debug!("vma: refusing zero-sized reservation");
            return None;
        }
        if self.free < size {
            debug!("vma: failed to reserve {size:#x} bytes, {:#x} free", self.free);
            return None;
        }
        if self.allocs.len() == MAX_ALLOCS {
            warn!("vma: reservation table is full");
            return None;
        }

        let ptr = self.top;
        self.top += size;
        self.free -= size;
        self.allocs.push(Record {
            ptr,
            size,
            live: true,
        });

        debug!("vma: reserved {size:#x} bytes at {ptr:#010x}, {:#x} free", self.free);
        Some(ptr)
    }

    /// Release a reservation previously returned by [`VmaAllocator::alloc`].
    ///
    /// Freeing the top of the stack rewinds it past any tombstoned
    /// records below; freeing an interior reservation only tombstones it.
    pub(crate) fn free(&mut self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        if self.allocs.is_empty() {
            debug!("vma: nothing to free");
            return;
        }

        let is_top = self
            .allocs
            .last()
            .is_some_and(|rec| rec.live && rec.ptr == ptr);
        if is_top {
            // rewind past the top record and every dead record below it
            if let Some(rec) = self.allocs.pop() {
                self.top = rec.ptr;
                self.free += rec.size;
            }
            while self.allocs.last().is_some_and(|rec| !rec.live) {
                if let Some(rec) = self.allocs.pop() {
                    self.top = rec.ptr;
                    self.free += rec.size;
                    debug!("vma: chain-freeing {:#x} bytes", rec.size);
                }
            }
            debug!("vma: rewound to {:#010x}, {:#x} free", self.top, self.free);
            return;
        }

        // not the top of the stack; just find it and mark it dead
        if let Some(rec) = self
            .allocs
            .iter_mut()
            .find(|rec| rec.live && rec.ptr == ptr)
        {
            debug!("vma: marking {:#x} bytes at {:#010x} as free", rec.size, rec.ptr);
            rec.live = false;
            return;
        }

        warn!("vma: tried to free unknown pointer {ptr:#010x}");
    }

    /// Bytes still available for reservation.
    #[inline]
    pub(crate) fn free_bytes(&self) -> usize {
        self.free
    }

    #[inline]
    pub(crate) fn window(&self) -> Range<usize> {
        self.start..self.end
    }
}
