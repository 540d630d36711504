//! Boot memory map adapter.
//!
//! Implement [`BootMemoryRegion`] on the boot loader's memory map entry type and
//! hand the entries to [`FrameAllocator::from_boot_map`](crate::FrameAllocator::from_boot_map):
//!
//! ```ignore
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//! ```

use crate::PhysicalAddress;

/// A single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region is general-purpose RAM the kernel may hand out.
    fn is_usable(&self) -> bool;

    /// Returns the first address past the end of this region.
    fn end(&self) -> PhysicalAddress {
        self.base() + self.size()
    }
}

/// Summary of the usable memory in a boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsableMemory {
    /// Sum of the lengths of every usable region.
    pub total_bytes: usize,
    /// Number of usable regions.
    pub regions: usize,
    /// Base and length of the largest usable region. On ties the first wins.
    pub largest: (PhysicalAddress, usize),
}

impl UsableMemory {
    /// Scans the map for usable regions. Returns `None` if there are none.
    pub fn survey<R: BootMemoryRegion>(regions: &[R]) -> Option<Self> {
        let mut summary: Option<Self> = None;

        for region in regions.iter().filter(|r| r.is_usable() && r.size() > 0) {
            let entry = summary.get_or_insert(Self {
                total_bytes: 0,
                regions: 0,
                largest: (region.base(), region.size()),
            });
            entry.total_bytes += region.size();
            entry.regions += 1;
            if region.size() > entry.largest.1 {
                entry.largest = (region.base(), region.size());
            }
        }

        if let Some(summary) = &summary {
            log::trace!(
                "usable memory: {} regions, {} KiB total, largest {} KiB at {}",
                summary.regions,
                summary.total_bytes / 1024,
                summary.largest.1 / 1024,
                summary.largest.0
            );
        }

        summary
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A memory map entry for tests.
    #[derive(Debug, Clone, Copy)]
    pub struct TestRegion {
        pub base: usize,
        pub size: usize,
        pub usable: bool,
    }

    impl TestRegion {
        pub fn usable(base: usize, size: usize) -> Self {
            Self {
                base,
                size,
                usable: true,
            }
        }

        pub fn reserved(base: usize, size: usize) -> Self {
            Self {
                base,
                size,
                usable: false,
            }
        }
    }

    impl BootMemoryRegion for TestRegion {
        fn base(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.base)
        }

        fn size(&self) -> usize {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    #[test]
    fn survey_sums_usable_regions_only() {
        let regions = [
            TestRegion::usable(0x1000, 0x9_E000),
            TestRegion::reserved(0xA_0000, 0x6_0000),
            TestRegion::usable(0x10_0000, 0x70_0000),
            TestRegion::reserved(0x80_0000, 0x100_0000),
        ];

        let summary = UsableMemory::survey(&regions).unwrap();
        assert_eq!(summary.total_bytes, 0x9_E000 + 0x70_0000);
        assert_eq!(summary.regions, 2);
        assert_eq!(summary.largest, (PhysicalAddress::new(0x10_0000), 0x70_0000));
    }

    #[test]
    fn survey_keeps_first_of_equal_regions() {
        let regions = [
            TestRegion::usable(0x10_0000, 0x10_0000),
            TestRegion::usable(0x30_0000, 0x10_0000),
        ];
        let summary = UsableMemory::survey(&regions).unwrap();
        assert_eq!(summary.largest.0, PhysicalAddress::new(0x10_0000));
    }

    #[test]
    fn survey_without_usable_memory() {
        let regions = [TestRegion::reserved(0, 0x10_0000), TestRegion::usable(0x20_0000, 0)];
        assert_eq!(UsableMemory::survey(&regions), None);
    }

    #[test]
    fn region_end() {
        assert_eq!(
            TestRegion::usable(0x20_0000, 0x1000).end(),
            PhysicalAddress::new(0x20_1000)
        );
    }
}
