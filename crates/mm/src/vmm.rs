//! Virtual memory manager.
//!
//! Every table is reached through its recursive alias, so once the recursive
//! slot is installed the manager needs no physical-to-virtual offset at all.
//! Intermediate tables are created on demand and never freed.
//!
//! Ordering rules for every mutation:
//! - a new table is linked into its parent, its alias is invalidated, and it is
//!   zeroed through that alias before anything below it is written;
//! - a leaf entry is fully written before its page is invalidated;
//! - every entry change is followed by an invalidation.

use core::fmt;

use crate::{
    FrameAllocator, MemoryError, PAGE_SIZE, PageEntry, PageFlags, PageSize, PageTable,
    PageTableLevel, PhysicalAddress, Platform, RecursiveMapping, VirtualAddress,
    paging::ENTRIES_PER_TABLE,
};

/// A translation found by [`VirtualMemoryManager::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// The frame backing the queried 4 KiB page. For a large page this is the
    /// 4 KiB frame inside it that the page corresponds to.
    pub physical: PhysicalAddress,
    /// Every flag bit of the entry, including [`PageFlags::PRESENT`].
    pub flags: PageFlags,
    /// Size of the page the entry maps.
    pub size: PageSize,
}

/// A present entry visited by [`VirtualMemoryManager::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub level: PageTableLevel,
    pub index: usize,
    /// First virtual address translated through this entry.
    pub virtual_base: VirtualAddress,
    pub entry: PageEntry,
}

/// Counts gathered by [`VirtualMemoryManager::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkSummary {
    /// Present entries per level, indexed by [`PageTableLevel::depth`].
    pub present: [usize; 4],
    pub pages_4kib: usize,
    pub pages_2mib: usize,
    pub pages_1gib: usize,
}

impl WalkSummary {
    fn record(&mut self, entry: &TableEntry) {
        self.present[entry.level.depth()] += 1;
        if entry.entry.maps_page_at(entry.level) {
            match PageEntry::page_size_at(entry.level) {
                PageSize::Size4KiB => self.pages_4kib += 1,
                PageSize::Size2MiB => self.pages_2mib += 1,
                PageSize::Size1GiB => self.pages_1gib += 1,
            }
        }
    }
}

impl fmt::Display for WalkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} present entries (top/second/third/leaf), {} 4 KiB, {} 2 MiB, {} 1 GiB pages",
            self.present[0],
            self.present[1],
            self.present[2],
            self.present[3],
            self.pages_4kib,
            self.pages_2mib,
            self.pages_1gib
        )
    }
}

/// Maps and unmaps pages in the active address space.
pub struct VirtualMemoryManager<P: Platform> {
    platform: P,
    recursive: RecursiveMapping,
}

impl<P: Platform> VirtualMemoryManager<P> {
    /// # Safety
    ///
    /// The active top-level table must hold a present, writable entry at
    /// `recursive.index()` pointing at itself, and nothing else may modify the
    /// tables while this manager exists.
    pub unsafe fn new(platform: P, recursive: RecursiveMapping) -> Self {
        Self {
            platform,
            recursive,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn recursive(&self) -> RecursiveMapping {
        self.recursive
    }

    /// Maps the page at `address` to the frame at `physical`.
    ///
    /// The entry is written as `physical | flags | PRESENT`, replacing whatever
    /// was there. Missing intermediate tables are allocated from `frames`.
    /// Both addresses must be page-aligned.
    pub fn map(
        &mut self,
        address: VirtualAddress,
        physical: PhysicalAddress,
        flags: PageFlags,
        frames: &mut FrameAllocator,
    ) -> Result<(), MemoryError> {
        if !address.is_page_aligned() {
            return Err(MemoryError::UnalignedPage(address));
        }
        if !physical.is_page_aligned() {
            return Err(MemoryError::UnalignedFrame(physical));
        }
        self.check_mutable(address)?;

        for level in [PageTableLevel::Top, PageTableLevel::Second, PageTableLevel::Third] {
            let entry = self.read_entry(level, address)?;
            if entry.maps_page_at(level) {
                return Err(MemoryError::HugePage { address, level });
            }
            if !entry.is_present() {
                self.create_table(level, address, frames)?;
            }
        }

        let entry = PageEntry::new(physical, flags | PageFlags::PRESENT);
        self.write_entry(PageTableLevel::Leaf, address, entry)?;
        self.platform.invalidate(address);

        log::debug!("mapped {:p} -> {} {:?}", address, physical, entry.flags());
        Ok(())
    }

    /// Clears the leaf entry for `address` and returns what it mapped.
    ///
    /// Returns `Ok(None)` if nothing was mapped. Tables that become empty are kept.
    pub fn unmap(&mut self, address: VirtualAddress) -> Result<Option<Mapping>, MemoryError> {
        self.check_mutable(address)?;
        let Some(mapping) = self.leaf_mapping(address)? else {
            return Ok(None);
        };

        self.write_entry(PageTableLevel::Leaf, address, PageEntry::EMPTY)?;
        self.platform.invalidate(address);

        log::debug!("unmapped {:p} (was {})", address, mapping.physical);
        Ok(Some(mapping))
    }

    /// Looks up the translation of the page containing `address`.
    ///
    /// Tables are checked top-down, so an address whose intermediate tables do
    /// not exist is reported absent without touching a missing alias.
    pub fn query(&mut self, address: VirtualAddress) -> Result<Option<Mapping>, MemoryError> {
        let (level, entry) = self.locate(address)?;
        if !entry.is_present() {
            return Ok(None);
        }

        let size = PageEntry::page_size_at(level);
        let base = entry.address().as_usize() & !(size.bytes() - 1);
        let within = address.page_base().as_usize() & (size.bytes() - 1);
        Ok(Some(Mapping {
            physical: PhysicalAddress::new(base + within),
            flags: entry.flags(),
            size,
        }))
    }

    /// The physical address `address` translates to, including the page offset.
    pub fn translate(&mut self, address: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        Ok(self
            .query(address)?
            .map(|mapping| mapping.physical + address.page_offset()))
    }

    /// Replaces the flags of the page at `address`, keeping its frame.
    ///
    /// The entry becomes `frame | flags | PRESENT`. Returns the updated mapping,
    /// or `Ok(None)` if nothing was mapped.
    pub fn change_flags(
        &mut self,
        address: VirtualAddress,
        flags: PageFlags,
    ) -> Result<Option<Mapping>, MemoryError> {
        self.check_mutable(address)?;
        let Some(mapping) = self.leaf_mapping(address)? else {
            return Ok(None);
        };

        let entry = PageEntry::new(mapping.physical, flags | PageFlags::PRESENT);
        self.write_entry(PageTableLevel::Leaf, address, entry)?;
        self.platform.invalidate(address);

        log::debug!("changed flags of {:p} to {:?}", address, entry.flags());
        Ok(Some(Mapping {
            flags: entry.flags(),
            ..mapping
        }))
    }

    /// Maps `len` bytes, rounded up to whole pages, starting at `address` onto
    /// consecutive frames starting at `physical`.
    ///
    /// A range that would leave either address space is refused before anything
    /// is mapped. Otherwise pages are mapped one at a time, and on error the pages
    /// before the failing one stay mapped.
    pub fn map_range(
        &mut self,
        address: VirtualAddress,
        physical: PhysicalAddress,
        len: usize,
        flags: PageFlags,
        frames: &mut FrameAllocator,
    ) -> Result<(), MemoryError> {
        let pages = page_count(address, len)?;
        let last = last_page_offset(pages);
        if physical.checked_add(last).is_none() {
            return Err(MemoryError::PhysicalRangeOverflow { physical, len });
        }

        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            self.map(address + offset, physical + offset, flags, frames)?;
        }
        Ok(())
    }

    /// Unmaps `len` bytes, rounded up to whole pages, starting at `address`.
    /// Returns how many of those pages were mapped.
    pub fn unmap_range(&mut self, address: VirtualAddress, len: usize) -> Result<usize, MemoryError> {
        let mut unmapped = 0;
        for page in 0..page_count(address, len)? {
            if self.unmap(address + page * PAGE_SIZE)?.is_some() {
                unmapped += 1;
            }
        }
        Ok(unmapped)
    }

    /// Visits every present entry of the hierarchy, parents before children.
    ///
    /// The recursive slot is neither visited nor descended into, and large-page
    /// entries are visited but not descended into.
    pub fn walk(&mut self, mut visit: impl FnMut(&TableEntry)) -> Result<(), MemoryError> {
        let top = self.recursive.table(PageTableLevel::Top, VirtualAddress::new(0));
        self.walk_table(top, PageTableLevel::Top, 0, &mut visit)
    }

    /// Logs every present entry at trace level and returns the totals.
    pub fn dump(&mut self) -> Result<WalkSummary, MemoryError> {
        let mut summary = WalkSummary::default();
        self.walk(|entry| {
            log::trace!(
                "{:indent$}{} [{:3}] {:p} -> {} {:?}",
                "",
                entry.level,
                entry.index,
                entry.virtual_base,
                entry.entry.address(),
                entry.entry.flags(),
                indent = entry.level.depth() * 2
            );
            summary.record(entry);
        })?;
        Ok(summary)
    }

    fn walk_table(
        &mut self,
        alias: VirtualAddress,
        level: PageTableLevel,
        base: usize,
        visit: &mut impl FnMut(&TableEntry),
    ) -> Result<(), MemoryError> {
        let entries = self.platform.resolve(alias)? as *const PageEntry;

        for index in 0..ENTRIES_PER_TABLE {
            if level == PageTableLevel::Top && index == self.recursive.index() {
                continue;
            }
            // SAFETY: `alias` resolved to a whole page table.
            let entry = unsafe { entries.add(index).read_volatile() };
            if !entry.is_present() {
                continue;
            }

            let virtual_base = VirtualAddress::new_truncate(base | (index << level.shift()));
            visit(&TableEntry {
                level,
                index,
                virtual_base,
                entry,
            });

            if let Some(lower) = level.next_lower() {
                if !entry.maps_page_at(level) {
                    let child = self.recursive.child_table(alias, index);
                    self.walk_table(child, lower, virtual_base.as_usize(), visit)?;
                }
            }
        }
        Ok(())
    }

    /// Follows the hierarchy for `address` and returns the entry where the walk
    /// stops: the leaf, a large page, or the first entry that is not present.
    fn locate(&mut self, address: VirtualAddress) -> Result<(PageTableLevel, PageEntry), MemoryError> {
        for level in [PageTableLevel::Top, PageTableLevel::Second, PageTableLevel::Third] {
            let entry = self.read_entry(level, address)?;
            if !entry.is_present() || entry.maps_page_at(level) {
                return Ok((level, entry));
            }
        }
        let leaf = self.read_entry(PageTableLevel::Leaf, address)?;
        Ok((PageTableLevel::Leaf, leaf))
    }

    /// Like [`query`](Self::query), but refuses large pages.
    fn leaf_mapping(&mut self, address: VirtualAddress) -> Result<Option<Mapping>, MemoryError> {
        let (level, entry) = self.locate(address)?;
        if !entry.is_present() {
            return Ok(None);
        }
        if level != PageTableLevel::Leaf {
            return Err(MemoryError::HugePage { address, level });
        }
        Ok(Some(Mapping {
            physical: entry.address(),
            flags: entry.flags(),
            size: PageSize::Size4KiB,
        }))
    }

    fn check_mutable(&self, address: VirtualAddress) -> Result<(), MemoryError> {
        if self.recursive.contains(address) {
            Err(MemoryError::RecursiveRegion(address))
        } else {
            Ok(())
        }
    }

    /// Allocates an empty table and links it below the `parent` entry for `address`.
    fn create_table(
        &mut self,
        parent: PageTableLevel,
        address: VirtualAddress,
        frames: &mut FrameAllocator,
    ) -> Result<(), MemoryError> {
        let Some(level) = parent.next_lower() else {
            unreachable!("leaf entries have no child table");
        };
        let frame = frames.allocate().ok_or(MemoryError::OutOfFrames)?;

        let link = PageEntry::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        self.write_entry(parent, address, link)?;

        let alias = self.recursive.table(level, address);
        self.platform.invalidate(alias);
        let table = self.platform.resolve(alias)? as *mut PageTable;
        // SAFETY: The alias now maps the new frame, which nothing else references.
        unsafe { (*table).zero() };

        log::trace!("created {} table for {:p} in frame {}", level, address, frame);
        Ok(())
    }

    fn read_entry(&mut self, level: PageTableLevel, address: VirtualAddress) -> Result<PageEntry, MemoryError> {
        let slot = self.platform.resolve(self.recursive.entry(level, address))?;
        // SAFETY: The slot is an entry inside a mapped page table.
        Ok(unsafe { (slot as *const PageEntry).read_volatile() })
    }

    fn write_entry(
        &mut self,
        level: PageTableLevel,
        address: VirtualAddress,
        entry: PageEntry,
    ) -> Result<(), MemoryError> {
        let slot = self.platform.resolve(self.recursive.entry(level, address))?;
        // SAFETY: As in `read_entry`; the manager has exclusive use of the tables.
        unsafe { (slot as *mut PageEntry).write_volatile(entry) };
        Ok(())
    }
}

/// Number of pages `len` bytes from `address` cover, checking that the last of
/// them stays in the half of the address space `address` is in.
fn page_count(address: VirtualAddress, len: usize) -> Result<usize, MemoryError> {
    let pages = len.div_ceil(PAGE_SIZE);
    match address.checked_add(last_page_offset(pages)) {
        Some(_) => Ok(pages),
        None => Err(MemoryError::VirtualRangeOverflow { address, len }),
    }
}

fn last_page_offset(pages: usize) -> usize {
    pages.saturating_sub(1) * PAGE_SIZE
}
