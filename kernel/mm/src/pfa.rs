//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame, bit = 1 meaning allocated or reserved. The
//! bitmap storage is placed by the boot code immediately above the kernel
//! image and self-reserved during construction. Allocation is a first-fit
//! scan with word-level skipping (`trailing_zeros` on the inverted word).

use muon_core::addr::PhysAddr;

use crate::{FrameAllocator, FrameDeallocator, MemoryRegion, PAGE_SIZE, PfaError};

const BITS_PER_WORD: usize = 32;

/// Frames below this index (the low 1 MiB) are never handed out by
/// [`BitmapAllocator::alloc`] and never reclaimed by
/// [`BitmapAllocator::free`].
pub const RESERVED_LOW_FRAMES: usize = 256;

/// A bitmap-based physical frame allocator.
///
/// All mutation goes through `&mut self`; the kernel wraps the allocator in
/// a `SpinLock<Option<…>>` global, so no interior locking is needed here.
pub struct BitmapAllocator {
    /// Bitmap words. Bit set = frame used.
    bitmap: &'static mut [u32],
    /// Total number of frames tracked.
    total_frames: usize,
    /// Number of frames currently marked used.
    used_frames: usize,
}

impl BitmapAllocator {
    /// Creates a frame allocator covering `total_memory` bytes of physical
    /// address space, using `storage` as the bitmap backing store.
    ///
    /// Every frame starts out reserved; the usable `regions` are then
    /// cleared. The caller is responsible for re-reserving the kernel image
    /// and the bitmap's own frames afterwards (via
    /// [`reserve_region`](Self::reserve_region)): the low 1 MiB is
    /// protected by the allocation policy regardless of bitmap state.
    ///
    /// # Safety
    ///
    /// - `storage` must point to writable memory of at least
    ///   `total_memory / PAGE_SIZE / 8` bytes, unaliased for the lifetime
    ///   of the allocator.
    /// - `regions` must accurately describe physical memory.
    pub unsafe fn new(
        total_memory: u32,
        regions: &[MemoryRegion],
        storage: *mut u32,
    ) -> Result<Self, PfaError> {
        let total_frames = total_memory as usize / PAGE_SIZE;
        if total_frames == 0 || regions.iter().all(|r| !r.usable) {
            return Err(PfaError::NoUsableMemory);
        }
        let words = total_frames.div_ceil(BITS_PER_WORD);

        // SAFETY: The caller guarantees `storage` covers `words` u32s and
        // is unaliased.
        let bitmap = unsafe { core::slice::from_raw_parts_mut(storage, words) };
        bitmap.fill(u32::MAX);

        let mut pfa = Self {
            bitmap,
            total_frames,
            used_frames: total_frames,
        };
        for region in regions.iter().filter(|r| r.usable) {
            pfa.reserve_region(PhysAddr::new(region.base), region.size, false);
        }
        Ok(pfa)
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn mark(&mut self, frame: usize) {
        self.bitmap[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
    }

    #[inline]
    fn unmark(&mut self, frame: usize) {
        self.bitmap[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
    }

    /// Allocates the lowest free frame outside the reserved low region.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        if self.used_frames == self.total_frames {
            return None;
        }

        // The reserved low region is word-aligned (256 % 32 == 0), so the
        // scan can start at its first word.
        for word_idx in RESERVED_LOW_FRAMES / BITS_PER_WORD..self.bitmap.len() {
            let word = self.bitmap[word_idx];
            if word == u32::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame = word_idx * BITS_PER_WORD + bit;
            if frame >= self.total_frames {
                return None;
            }
            self.mark(frame);
            self.used_frames += 1;
            return Some(PhysAddr::new((frame * PAGE_SIZE) as u32));
        }
        None
    }

    /// Returns a frame to the allocator.
    ///
    /// Out-of-range frames, frames in the reserved low region, and frames
    /// that are already free are ignored silently.
    pub fn free(&mut self, frame: PhysAddr) {
        let index = frame.frame_index() as usize;
        if index >= self.total_frames || index < RESERVED_LOW_FRAMES {
            return;
        }
        if !self.is_used(index) {
            return;
        }
        self.unmark(index);
        self.used_frames -= 1;
    }

    /// Marks (`reserved = true`) or clears (`reserved = false`) a
    /// contiguous physical range, rounding to whole frames.
    ///
    /// Idempotent: frames already in the requested state are skipped so the
    /// used-frame counter stays equal to the bitmap population count.
    pub fn reserve_region(&mut self, base: PhysAddr, size: u32, reserved: bool) {
        let start = base.frame_index() as usize;
        let end = ((base.as_u32() as u64 + size as u64) / PAGE_SIZE as u64) as usize;

        for frame in start..end.min(self.total_frames) {
            if reserved && !self.is_used(frame) {
                self.mark(frame);
                self.used_frames += 1;
            } else if !reserved && self.is_used(frame) {
                self.unmark(frame);
                self.used_frames -= 1;
            }
        }
    }

    /// Returns the total number of tracked frames.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of used (allocated or reserved) frames.
    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    /// Counts set bits across the whole bitmap, clamped to tracked frames.
    ///
    /// `used_frames() == popcount()` holds at every quiescent point; the
    /// test suite checks it after every operation sequence.
    #[must_use]
    pub fn popcount(&self) -> usize {
        let mut count = 0usize;
        for frame in 0..self.total_frames {
            if self.is_used(frame) {
                count += 1;
            }
        }
        count
    }
}

impl FrameAllocator for BitmapAllocator {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        self.alloc()
    }
}

impl FrameDeallocator for BitmapAllocator {
    fn deallocate_frame(&mut self, frame: PhysAddr) {
        self.free(frame);
    }
}
