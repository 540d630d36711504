//! Page table primitives for x86_64 4-level paging.

use core::fmt;
use core::ops::BitOr;

use x86_64::structures::paging::PageTableFlags;

use crate::PhysicalAddress;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in every table of the hierarchy.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One of the four tiers of the page-table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageTableLevel {
    /// The leaf table, whose entries map 4 KiB pages (bits 12-20).
    Leaf,
    /// The third-level table (bits 21-29). Entries may map 2 MiB pages.
    Third,
    /// The second-level table (bits 30-38). Entries may map 1 GiB pages.
    Second,
    /// The top-level table held in the table-root register (bits 39-47).
    Top,
}

impl PageTableLevel {
    /// All levels, from the top of the hierarchy down to the leaf.
    pub const TOP_DOWN: [PageTableLevel; 4] = [Self::Top, Self::Second, Self::Third, Self::Leaf];

    /// The bit position of this level's 9-bit index within a virtual address.
    #[inline]
    pub const fn shift(self) -> usize {
        match self {
            Self::Leaf => 12,
            Self::Third => 21,
            Self::Second => 30,
            Self::Top => 39,
        }
    }

    /// Number of bytes of address space a single entry at this level covers.
    #[inline]
    pub const fn entry_span(self) -> usize {
        1 << self.shift()
    }

    /// The level below this one, or `None` for the leaf.
    #[inline]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::Top => Some(Self::Second),
            Self::Second => Some(Self::Third),
            Self::Third => Some(Self::Leaf),
            Self::Leaf => None,
        }
    }

    /// Depth below the top-level table, 0 for the top and 3 for the leaf.
    #[inline]
    pub const fn depth(self) -> usize {
        match self {
            Self::Top => 0,
            Self::Second => 1,
            Self::Third => 2,
            Self::Leaf => 3,
        }
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Top => "top",
            Self::Second => "second",
            Self::Third => "third",
            Self::Leaf => "leaf",
        };
        f.write_str(name)
    }
}

/// Size of the page a present entry maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4KiB => PAGE_SIZE,
            Self::Size2MiB => 2 * 1024 * 1024,
            Self::Size1GiB => 1024 * 1024 * 1024,
        }
    }

    /// The size of a page mapped directly by an entry at `level`.
    const fn mapped_at(level: PageTableLevel) -> Self {
        match level {
            PageTableLevel::Leaf => Self::Size4KiB,
            PageTableLevel::Third => Self::Size2MiB,
            PageTableLevel::Second | PageTableLevel::Top => Self::Size1GiB,
        }
    }
}

/// The flag bits of a page table entry.
///
/// This wraps the x86_64 crate's page table flags. Every bit outside the frame
/// address field has a named flag there, so truncating raw bits never loses a
/// flag and never keeps an address bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    pub const PRESENT: Self = Self(PageTableFlags::PRESENT);
    pub const WRITABLE: Self = Self(PageTableFlags::WRITABLE);
    pub const USER: Self = Self(PageTableFlags::USER_ACCESSIBLE);
    pub const WRITE_THROUGH: Self = Self(PageTableFlags::WRITE_THROUGH);
    pub const NO_CACHE: Self = Self(PageTableFlags::NO_CACHE);
    pub const ACCESSED: Self = Self(PageTableFlags::ACCESSED);
    pub const DIRTY: Self = Self(PageTableFlags::DIRTY);
    /// Maps a 2 MiB or 1 GiB page when set in a third- or second-level entry.
    pub const HUGE: Self = Self(PageTableFlags::HUGE_PAGE);
    pub const GLOBAL: Self = Self(PageTableFlags::GLOBAL);
    pub const NO_EXECUTE: Self = Self(PageTableFlags::NO_EXECUTE);

    /// Flags with no bits set.
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Creates flags from the raw bits of an entry, dropping the address field.
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(bits & !PageEntry::ADDRESS_MASK))
    }

    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0.union(other.0))
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0.contains(other.0)
    }

    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single 64-bit page table entry.
///
/// Bits 12-51 hold a frame address, the remaining bits are [`PageFlags`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Frame address bits 12-51.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// An entry with every bit clear.
    pub const EMPTY: Self = Self(0);

    /// Creates an entry pointing at `address` with exactly `flags`.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_page_aligned(),
            "physical address must be page-aligned"
        );
        Self((address.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The frame address bits, whether or not the entry is present.
    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub const fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns true if this entry maps a page directly at `level` instead of
    /// pointing at a lower table.
    pub const fn maps_page_at(self, level: PageTableLevel) -> bool {
        match level {
            PageTableLevel::Leaf => self.is_present(),
            PageTableLevel::Top => false,
            _ => self.is_present() && self.flags().contains(PageFlags::HUGE),
        }
    }

    /// The size of the page mapped by this entry when it sits at `level`.
    pub const fn page_size_at(level: PageTableLevel) -> PageSize {
        PageSize::mapped_at(level)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("address", &self.address())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A 4 KiB page table holding 512 entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::EMPTY);
    }

    /// Iterates over `(index, entry)` pairs of the present entries.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
