//! Bitmap frame allocator.
//!
//! One bit per 4 KiB frame, set when the frame is allocated or permanently
//! reserved. The bitmap covers the first `total_usable_bytes / 4096` frames and
//! lives at the start of the largest usable region, reached through a
//! [`PhysicalMapper`]. Frames below 1 MiB and the bitmap's own frames are
//! reserved before the first allocation.

use core::fmt;
use core::ptr::NonNull;

use crate::{BootMemoryRegion, PAGE_SIZE, PhysicalAddress, PhysicalMapper, UsableMemory};

/// Physical memory below this address is never handed out.
pub const LOW_MEMORY_LIMIT: usize = 1024 * 1024;

/// Reasons the allocator could not be initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    /// The memory map has no usable region.
    NoUsableMemory,
    /// The largest usable region cannot hold the bitmap.
    BitmapDoesNotFit { bitmap_bytes: usize, region_bytes: usize },
}

impl fmt::Display for FrameAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUsableMemory => write!(f, "memory map contains no usable memory"),
            Self::BitmapDoesNotFit {
                bitmap_bytes,
                region_bytes,
            } => write!(
                f,
                "a {} byte bitmap does not fit in the largest usable region ({} bytes)",
                bitmap_bytes, region_bytes
            ),
        }
    }
}

/// Allocates and frees single 4 KiB frames.
///
/// The allocator is not synchronized. The kernel wraps it in a lock; tests own
/// it outright.
pub struct FrameAllocator {
    bitmap: NonNull<u8>,
    bitmap_len: usize,
    bitmap_base: PhysicalAddress,
    total_frames: usize,
    used_frames: usize,
}

// SAFETY: The allocator is the sole owner of the bitmap storage it points at.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// # Safety
    ///
    /// `mapper` must make the start of the largest usable region writable, and
    /// that memory must not be in use by anything else.
    pub unsafe fn from_boot_map<R: BootMemoryRegion, M: PhysicalMapper>(
        regions: &[R],
        mapper: &M,
    ) -> Result<Self, FrameAllocatorError> {
        let usable = UsableMemory::survey(regions).ok_or(FrameAllocatorError::NoUsableMemory)?;

        let total_frames = usable.total_bytes / PAGE_SIZE;
        let bitmap_len = total_frames.div_ceil(8);
        let (bitmap_base, region_bytes) = usable.largest;
        if bitmap_len > region_bytes {
            return Err(FrameAllocatorError::BitmapDoesNotFit {
                bitmap_bytes: bitmap_len,
                region_bytes,
            });
        }

        let bitmap = NonNull::new(mapper.phys_to_ptr(bitmap_base))
            .ok_or(FrameAllocatorError::NoUsableMemory)?;

        let mut allocator = Self {
            bitmap,
            bitmap_len,
            bitmap_base,
            total_frames,
            used_frames: 0,
        };

        allocator.bitmap_mut().fill(0xFF);

        for region in regions.iter().filter(|r| r.is_usable()) {
            let start = region.base().as_usize().max(LOW_MEMORY_LIMIT);
            let end = region.end().as_usize();
            if end <= start {
                continue;
            }
            // Partial frames at either end are not usable.
            let first = start.div_ceil(PAGE_SIZE);
            let last = end / PAGE_SIZE;
            for frame in first..last.min(total_frames) {
                allocator.clear_bit(frame);
            }
        }

        allocator.reserve(PhysicalAddress::new(0), LOW_MEMORY_LIMIT);
        allocator.reserve(bitmap_base, bitmap_len);
        allocator.used_frames = allocator.count_used();

        log::info!(
            "frame allocator: {} MiB usable, {} frames, bitmap of {} bytes at {}",
            usable.total_bytes / (1024 * 1024),
            total_frames,
            bitmap_len,
            bitmap_base
        );
        log::info!(
            "frame allocator: {} used, {} free",
            allocator.used_frames,
            allocator.free_frames()
        );

        Ok(allocator)
    }

    /// Allocates the lowest free frame.
    ///
    /// Returns `None` when memory is exhausted. Frame 0 is always reserved, so a
    /// returned address is never zero.
    pub fn allocate(&mut self) -> Option<PhysicalAddress> {
        let total_frames = self.total_frames;
        let bitmap = self.bitmap_mut();

        let byte = bitmap.iter().position(|&b| b != 0xFF)?;
        let frame = byte * 8 + bitmap[byte].trailing_ones() as usize;
        if frame >= total_frames {
            return None;
        }
        bitmap[byte] |= 1 << (frame % 8);
        self.used_frames += 1;

        let address = PhysicalAddress::from_frame_index(frame);
        log::trace!("allocated frame {}", address);
        Some(address)
    }

    /// Returns a frame to the allocator.
    ///
    /// Freeing a frame twice is not detected: the second call still lowers the
    /// used count, after which the counters no longer describe the bitmap.
    /// Frames below [`LOW_MEMORY_LIMIT`] and the bitmap's own frames can never be
    /// freed; such calls are logged and ignored.
    pub fn free(&mut self, address: PhysicalAddress) {
        let frame = address.frame_index();
        if frame >= self.total_frames {
            log::warn!("ignoring free of untracked frame {}", address);
            return;
        }
        if self.is_permanently_reserved(frame) {
            log::warn!("ignoring free of reserved frame {}", address);
            return;
        }
        self.clear_bit(frame);
        self.used_frames = self.used_frames.saturating_sub(1);
        log::trace!("freed frame {}", address);
    }

    /// Returns true if the frame containing `address` is allocated or reserved.
    /// Frames beyond the bitmap count as in use.
    pub fn is_used(&self, address: PhysicalAddress) -> bool {
        let frame = address.frame_index();
        frame >= self.total_frames || self.bitmap()[frame / 8] & (1 << (frame % 8)) != 0
    }

    /// Number of frames the bitmap tracks.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames.min(self.total_frames)
    }

    /// Physical location and size in bytes of the bitmap.
    pub fn bitmap_region(&self) -> (PhysicalAddress, usize) {
        (self.bitmap_base, self.bitmap_len)
    }

    fn bitmap(&self) -> &[u8] {
        // SAFETY: `bitmap` points at `bitmap_len` bytes owned by this allocator.
        unsafe { core::slice::from_raw_parts(self.bitmap.as_ptr(), self.bitmap_len) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        // SAFETY: As in `bitmap`, and `&mut self` makes the access exclusive.
        unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_ptr(), self.bitmap_len) }
    }

    /// True for frames below 1 MiB and frames holding the bitmap.
    fn is_permanently_reserved(&self, frame: usize) -> bool {
        let bitmap_first = self.bitmap_base.frame_index();
        let bitmap_end = (self.bitmap_base.as_usize() + self.bitmap_len).div_ceil(PAGE_SIZE);
        frame < LOW_MEMORY_LIMIT / PAGE_SIZE || (bitmap_first..bitmap_end).contains(&frame)
    }

    fn clear_bit(&mut self, frame: usize) {
        self.bitmap_mut()[frame / 8] &= !(1 << (frame % 8));
    }

    /// Marks every tracked frame overlapping `[base, base + len)` as used.
    fn reserve(&mut self, base: PhysicalAddress, len: usize) {
        let first = base.frame_index();
        let last = (base.as_usize() + len).div_ceil(PAGE_SIZE).min(self.total_frames);
        for frame in first..last {
            self.bitmap_mut()[frame / 8] |= 1 << (frame % 8);
        }
    }

    fn count_used(&self) -> usize {
        (0..self.total_frames)
            .filter(|&frame| self.bitmap()[frame / 8] & (1 << (frame % 8)) != 0)
            .count()
    }
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("bitmap_base", &self.bitmap_base)
            .field("bitmap_len", &self.bitmap_len)
            .field("total_frames", &self.total_frames)
            .field("used_frames", &self.used_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::EmulatedMemory;
    use crate::memmap::tests::TestRegion;

    const MIB: usize = 1024 * 1024;

    fn allocator(memory: &EmulatedMemory, regions: &[TestRegion]) -> FrameAllocator {
        unsafe { FrameAllocator::from_boot_map(regions, memory) }.unwrap()
    }

    /// A small xorshift generator so sequences are varied but reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn boot_scenario_single_region_at_2_mib() {
        let memory = EmulatedMemory::new(18 * MIB);
        let frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 16 * MIB)]);

        assert_eq!(frames.total_frames(), 4096);

        // The bitmap covers frames 0..4096. Nothing below 2 MiB is usable, which
        // includes all of low memory, and the 512 byte bitmap takes one frame.
        let below_region = (2 * MIB) / PAGE_SIZE;
        let bitmap_frames = 1;
        let reserved = below_region + bitmap_frames;
        assert_eq!(frames.used_frames(), reserved);
        assert_eq!(frames.free_frames(), 4096 - reserved);

        assert_eq!(frames.bitmap_region(), (PhysicalAddress::new(2 * MIB), 512));
        assert!(frames.is_used(PhysicalAddress::new(0)));
        assert!(frames.is_used(PhysicalAddress::new(MIB - PAGE_SIZE)));
        assert!(frames.is_used(PhysicalAddress::new(2 * MIB)));
        assert!(!frames.is_used(PhysicalAddress::new(2 * MIB + PAGE_SIZE)));
    }

    #[test]
    fn bitmap_is_carved_from_largest_region() {
        let memory = EmulatedMemory::new(16 * MIB);
        let mut frames = allocator(
            &memory,
            &[
                TestRegion::usable(MIB, 2 * MIB),
                TestRegion::reserved(3 * MIB, MIB),
                TestRegion::usable(4 * MIB, 8 * MIB),
            ],
        );
        assert_eq!(frames.bitmap_region().0, PhysicalAddress::new(4 * MIB));
        assert!(frames.is_used(PhysicalAddress::new(4 * MIB)));
        // The first allocation skips low memory and comes from the first region.
        assert_eq!(frames.allocate(), Some(PhysicalAddress::new(MIB)));
    }

    #[test]
    fn multi_frame_bitmap_is_reserved() {
        // 160 MiB of usable memory needs 5120 bitmap bytes, two frames.
        let memory = EmulatedMemory::new(168 * MIB);
        let frames = allocator(&memory, &[TestRegion::usable(8 * MIB, 160 * MIB)]);
        let (base, len) = frames.bitmap_region();
        assert_eq!(len, 5120);
        assert!(frames.is_used(base));
        assert!(frames.is_used(base + PAGE_SIZE));
        assert!(!frames.is_used(base + 2 * PAGE_SIZE));
    }

    #[test]
    fn never_allocates_low_memory() {
        let memory = EmulatedMemory::new(4 * MIB);
        let mut frames = allocator(
            &memory,
            &[
                TestRegion::usable(0, 0x9_F000),
                TestRegion::reserved(0x9_F000, 0x6_1000),
                TestRegion::usable(MIB, 3 * MIB),
            ],
        );

        while let Some(frame) = frames.allocate() {
            assert!(
                frame.as_usize() >= LOW_MEMORY_LIMIT,
                "allocated {} below 1 MiB",
                frame
            );
        }
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn region_straddling_low_memory_is_clamped() {
        let memory = EmulatedMemory::new(4 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(0x8_0000, 0x38_0000)]);
        let first = frames.allocate().unwrap();
        assert!(first.as_usize() >= LOW_MEMORY_LIMIT);
    }

    #[test]
    fn consecutive_allocations_are_distinct() {
        let memory = EmulatedMemory::new(6 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 4 * MIB)]);

        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();
        assert_ne!(a, b);
        assert!(a.is_page_aligned() && b.is_page_aligned());
        assert!(frames.is_used(a) && frames.is_used(b));
    }

    #[test]
    fn free_then_allocate_round_trip() {
        let memory = EmulatedMemory::new(6 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 4 * MIB)]);

        let before = frames.free_frames();
        let frame = frames.allocate().unwrap();
        assert_eq!(frames.free_frames(), before - 1);
        frames.free(frame);
        assert_eq!(frames.free_frames(), before);
        assert!(!frames.is_used(frame));
        // The lowest free frame is handed out first, so it comes straight back.
        assert_eq!(frames.allocate(), Some(frame));
    }

    #[test]
    fn exhaustion_returns_none() {
        let memory = EmulatedMemory::new(2 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(0, 2 * MIB)]);
        // 512 frames tracked. Low memory, which also holds the bitmap, is reserved.
        let available = frames.free_frames();
        assert_eq!(available, 256);
        for _ in 0..available {
            assert!(frames.allocate().is_some());
        }
        assert_eq!(frames.allocate(), None);
        assert_eq!(frames.used_frames(), frames.total_frames());
    }

    #[test]
    fn conservation_holds_for_random_sequences() {
        let memory = EmulatedMemory::new(8 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 6 * MIB)]);
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut held = Vec::new();

        for _ in 0..4000 {
            if rng.next() % 3 != 0 || held.is_empty() {
                if let Some(frame) = frames.allocate() {
                    assert!(!held.contains(&frame), "{} handed out twice", frame);
                    held.push(frame);
                }
            } else {
                let index = (rng.next() as usize) % held.len();
                frames.free(held.swap_remove(index));
            }
            assert_eq!(frames.used_frames() + frames.free_frames(), frames.total_frames());
        }
    }

    #[test]
    fn double_free_skews_the_used_count() {
        let memory = EmulatedMemory::new(6 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 4 * MIB)]);

        let baseline = frames.used_frames();
        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();
        frames.free(a);
        frames.free(a);

        // `b` is still allocated, yet the count is back where it was before
        // either allocation.
        assert!(frames.is_used(b));
        assert_eq!(frames.used_frames(), baseline);
        assert_eq!(frames.used_frames() + frames.free_frames(), frames.total_frames());

        // The bitmap itself stays consistent: `a` comes back once, `b` never does.
        assert_eq!(frames.allocate(), Some(a));
        assert_ne!(frames.allocate(), Some(b));
    }

    #[test]
    fn freeing_untracked_frame_is_ignored() {
        let memory = EmulatedMemory::new(18 * MIB);
        let mut frames = allocator(&memory, &[TestRegion::usable(2 * MIB, 16 * MIB)]);
        let used = frames.used_frames();
        frames.free(PhysicalAddress::new(17 * MIB));
        assert_eq!(frames.used_frames(), used);
    }

    #[test]
    fn freeing_reserved_frames_is_ignored() {
        let memory = EmulatedMemory::new(8 * MIB);
        let mut frames = allocator(
            &memory,
            &[TestRegion::usable(0, 640 * 1024), TestRegion::usable(MIB, 7 * MIB)],
        );
        let used = frames.used_frames();
        let (bitmap, _) = frames.bitmap_region();

        frames.free(PhysicalAddress::new(0));
        frames.free(PhysicalAddress::new(0x8000));
        frames.free(PhysicalAddress::new(MIB - PAGE_SIZE));
        frames.free(bitmap);

        assert_eq!(frames.used_frames(), used);
        assert!(frames.is_used(PhysicalAddress::new(0)));
        assert!(frames.is_used(bitmap));

        let first = frames.allocate().unwrap();
        assert!(first.as_usize() >= LOW_MEMORY_LIMIT);
        assert_ne!(first, bitmap);
    }

    #[test]
    fn rejects_map_without_usable_memory() {
        let memory = EmulatedMemory::new(MIB);
        let result = unsafe { FrameAllocator::from_boot_map(&[TestRegion::reserved(0, MIB)], &memory) };
        assert_eq!(result.unwrap_err(), FrameAllocatorError::NoUsableMemory);
    }
}
