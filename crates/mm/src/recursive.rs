//! The recursive address-space view.
//!
//! One top-level entry (the recursive slot) points at the top-level table itself.
//! Walking through that slot consumes one level of the hierarchy, so an address
//! that starts with the slot index `k` times reaches a table `k` levels above the
//! page it would normally map. This module is the only place that builds such
//! aliases; the VMM asks it for the virtual address of a table or entry and never
//! shifts indices itself.

use crate::{
    PageTableLevel, VirtualAddress,
    paging::{ENTRIES_PER_TABLE, PAGE_SIZE},
};

/// Virtual aliases for the tables of the active hierarchy, through the recursive
/// slot at [`index`](Self::index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursiveMapping {
    index: usize,
}

impl RecursiveMapping {
    /// # Panics
    ///
    /// Panics if `index` is not a valid top-level index.
    pub const fn new(index: usize) -> Self {
        assert!(index < ENTRIES_PER_TABLE, "recursive index out of range");
        Self { index }
    }

    /// The top-level slot that points back at the top-level table.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns true if `address` falls in the 512 GiB window aliased by the
    /// recursive slot, where every "page" is really a page table.
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.table_index(PageTableLevel::Top) == self.index
    }

    /// The virtual address of the table at `level` that takes part in
    /// translating `address`.
    ///
    /// Each level below the top shifts the indices of `address` down by one
    /// slot, filling the vacated top slots with the recursive index.
    pub const fn table(&self, level: PageTableLevel, address: VirtualAddress) -> VirtualAddress {
        let r = self.index;
        let top = address.table_index(PageTableLevel::Top);
        let second = address.table_index(PageTableLevel::Second);
        let third = address.table_index(PageTableLevel::Third);

        match level {
            PageTableLevel::Top => VirtualAddress::from_table_indices(r, r, r, r, 0),
            PageTableLevel::Second => VirtualAddress::from_table_indices(r, r, r, top, 0),
            PageTableLevel::Third => VirtualAddress::from_table_indices(r, r, top, second, 0),
            PageTableLevel::Leaf => VirtualAddress::from_table_indices(r, top, second, third, 0),
        }
    }

    /// The virtual address of the entry at `level` that translates `address`.
    pub const fn entry(&self, level: PageTableLevel, address: VirtualAddress) -> VirtualAddress {
        let table = self.table(level, address).as_usize();
        VirtualAddress::new(table + address.table_index(level) * core::mem::size_of::<u64>())
    }

    /// The virtual address of the table that entry `index` of the table at
    /// `parent_table` (itself an alias at `parent_level`) points to.
    ///
    /// This is how a walk descends without knowing any real address: the alias
    /// of a child table is its parent's alias shifted up one slot with the entry
    /// index appended.
    pub const fn child_table(&self, parent_table: VirtualAddress, index: usize) -> VirtualAddress {
        assert!(index < ENTRIES_PER_TABLE, "table index out of range");
        VirtualAddress::new_truncate((parent_table.as_usize() << 9) | (index * PAGE_SIZE))
    }

    /// The lowest virtual address of the recursive window.
    pub const fn window_base(&self) -> VirtualAddress {
        VirtualAddress::from_table_indices(self.index, 0, 0, 0, 0)
    }
}
