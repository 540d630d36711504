//! The one-shot kernel remap.
//!
//! The loader hands over a live hierarchy, a small stack, and a direct map of
//! physical memory. The remap moves execution onto a stack of our own in the
//! upper half and installs the recursive slot, after which the VMM no longer
//! needs the direct map. It runs once and cannot be rolled back, so every
//! error it returns is fatal.
//!
//! The steps must run in order:
//!
//! 1. [`KernelRemap::allocate_stack`]
//! 2. [`KernelRemap::install_recursive_slot`]
//! 3. [`KernelRemap::prepare_switch`], followed by [`Platform::switch_stack`]
//! 4. [`KernelRemap::complete`], called from the relocated stack

use core::{fmt, ops::Range};

use crate::{
    FrameAllocator, PAGE_SIZE, PageEntry, PageFlags, PageTable, PhysicalAddress, PhysicalMapper,
    Platform, RecursiveMapping, RemapError, StackSwitch, VirtualAddress,
    paging::ENTRIES_PER_TABLE,
};

const TABLE_FLAGS: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

/// Where the remap puts the recursive slot and the relocated stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapLayout {
    /// Top-level slot that points back at the top-level table.
    pub recursive_index: usize,
    /// Top-level slot whose hierarchy holds the relocated stack.
    pub stack_index: usize,
    /// Pages backing the stack, all under the first leaf table of the slot.
    pub stack_pages: usize,
}

impl RemapLayout {
    /// Recursive slot 510, a 1 MiB stack under slot 257.
    pub const DEFAULT: Self = Self::new(510, 257, 256);

    /// # Panics
    ///
    /// Panics if an index is out of range, the two slots coincide, or the
    /// stack does not fit in one leaf table.
    pub const fn new(recursive_index: usize, stack_index: usize, stack_pages: usize) -> Self {
        assert!(recursive_index < ENTRIES_PER_TABLE, "recursive index out of range");
        assert!(stack_index < ENTRIES_PER_TABLE, "stack index out of range");
        assert!(recursive_index != stack_index, "stack and recursive slots must differ");
        assert!(
            stack_pages > 0 && stack_pages <= ENTRIES_PER_TABLE,
            "stack must be between 1 and 512 pages"
        );
        Self {
            recursive_index,
            stack_index,
            stack_pages,
        }
    }

    /// Lowest address of the relocated stack.
    pub const fn stack_base(&self) -> VirtualAddress {
        VirtualAddress::from_table_indices(self.stack_index, 0, 0, 0, 0)
    }

    /// The initial frame pointer: the base of the highest stack page.
    pub const fn stack_top(&self) -> VirtualAddress {
        VirtualAddress::from_table_indices(self.stack_index, 0, 0, self.stack_pages - 1, 0)
    }

    /// Every mapped byte of the relocated stack.
    pub fn stack_range(&self) -> Range<VirtualAddress> {
        self.stack_base()..self.stack_base() + self.stack_pages * PAGE_SIZE
    }

    /// How far below the top the stack can grow.
    pub const fn capacity(&self) -> usize {
        (self.stack_pages - 1) * PAGE_SIZE
    }
}

impl Default for RemapLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Progress of the remap. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemapState {
    BootMappingActive,
    StackAllocated,
    RecursiveSlotInstalled,
    StackPointerSwitched,
    RemapComplete,
}

impl fmt::Display for RemapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BootMappingActive => "boot mapping active",
            Self::StackAllocated => "stack allocated",
            Self::RecursiveSlotInstalled => "recursive slot installed",
            Self::StackPointerSwitched => "stack pointer switched",
            Self::RemapComplete => "remap complete",
        })
    }
}

/// Drives the remap and remembers how far it got.
#[derive(Debug)]
pub struct KernelRemap {
    layout: RemapLayout,
    state: RemapState,
}

impl KernelRemap {
    pub const fn new(layout: RemapLayout) -> Self {
        Self {
            layout,
            state: RemapState::BootMappingActive,
        }
    }

    pub fn layout(&self) -> RemapLayout {
        self.layout
    }

    pub fn state(&self) -> RemapState {
        self.state
    }

    /// The recursive view, once the slot is installed.
    pub fn recursive_mapping(&self) -> Option<RecursiveMapping> {
        (self.state >= RemapState::RecursiveSlotInstalled)
            .then(|| RecursiveMapping::new(self.layout.recursive_index))
    }

    /// Builds the stack hierarchy under the stack slot of the active top-level
    /// table and backs every stack page with a fresh frame. Tables are reached
    /// through `mapper`. Returns the new stack top.
    ///
    /// The hierarchy is filled bottom-up and linked into the top-level table
    /// last, so the live tables never reference a half-built chain.
    pub fn allocate_stack<P: Platform, M: PhysicalMapper>(
        &mut self,
        platform: &P,
        mapper: &M,
        frames: &mut FrameAllocator,
    ) -> Result<VirtualAddress, RemapError> {
        self.expect(RemapState::BootMappingActive)?;
        let index = self.layout.stack_index;

        let root = platform.read_table_root();
        // SAFETY: The root is a live top-level table and the mapper reaches all of
        // physical memory.
        let top = unsafe { mapper.table_at(root) };
        if top.entry(index).is_present() {
            return Err(RemapError::StackSlotInUse { index });
        }

        let (second_frame, second) = new_table(mapper, frames)?;
        let (third_frame, third) = new_table(mapper, frames)?;
        let (leaf_frame, leaf) = new_table(mapper, frames)?;

        for page in 0..self.layout.stack_pages {
            let frame = frames.allocate().ok_or(RemapError::OutOfFrames)?;
            leaf.set_entry(page, PageEntry::new(frame, TABLE_FLAGS));
        }
        third.set_entry(0, PageEntry::new(leaf_frame, TABLE_FLAGS));
        second.set_entry(0, PageEntry::new(third_frame, TABLE_FLAGS));
        top.set_entry(index, PageEntry::new(second_frame, TABLE_FLAGS));

        log::info!(
            "allocated relocated stack {:p}..{:p} ({} pages)",
            self.layout.stack_base(),
            self.layout.stack_range().end,
            self.layout.stack_pages
        );
        self.state = RemapState::StackAllocated;
        Ok(self.layout.stack_top())
    }

    /// Points the recursive slot of the active top-level table back at the
    /// table itself, then reloads the table root so no translation cached from
    /// before the change survives.
    pub fn install_recursive_slot<P: Platform, M: PhysicalMapper>(
        &mut self,
        platform: &mut P,
        mapper: &M,
    ) -> Result<RecursiveMapping, RemapError> {
        self.expect(RemapState::StackAllocated)?;
        let index = self.layout.recursive_index;

        let root = platform.read_table_root();
        // SAFETY: As in `allocate_stack`.
        let top = unsafe { mapper.table_at(root) };
        let existing = top.entry(index);
        if existing.is_present() && existing.address() != root {
            return Err(RemapError::RecursiveSlotInUse {
                index,
                raw: existing.raw(),
            });
        }
        top.set_entry(index, PageEntry::new(root, TABLE_FLAGS));

        // SAFETY: The hierarchy is the one already active, plus two new slots.
        unsafe { platform.write_table_root(root) };

        let recursive = RecursiveMapping::new(index);
        log::info!(
            "installed recursive slot {} (tables at {:p})",
            index,
            recursive.window_base()
        );
        self.state = RemapState::RecursiveSlotInstalled;
        Ok(recursive)
    }

    /// Computes the register values for moving onto the relocated stack.
    ///
    /// `depth` is how much of the boot stack is in use (its top minus the
    /// current stack pointer). The new stack pointer keeps that distance below
    /// the new top, rounded down to the 16-byte call alignment.
    ///
    /// The caller must pass the result straight to [`Platform::switch_stack`].
    pub fn prepare_switch(&mut self, depth: usize) -> Result<StackSwitch, RemapError> {
        self.expect(RemapState::RecursiveSlotInstalled)?;
        let capacity = self.layout.capacity();
        if depth >= capacity {
            return Err(RemapError::StackTooDeep { depth, capacity });
        }

        let top = self.layout.stack_top();
        let switch = StackSwitch {
            frame_pointer: top,
            stack_pointer: VirtualAddress::new((top.as_usize() - depth) & !0xF),
        };
        log::debug!(
            "switching to frame pointer {:p}, stack pointer {:p}",
            switch.frame_pointer,
            switch.stack_pointer
        );
        self.state = RemapState::StackPointerSwitched;
        Ok(switch)
    }

    /// Confirms that execution continues on the relocated stack and hands out
    /// the recursive view for the VMM.
    pub fn complete(&mut self, stack_pointer: VirtualAddress) -> Result<RecursiveMapping, RemapError> {
        self.expect(RemapState::StackPointerSwitched)?;
        if !self.layout.stack_range().contains(&stack_pointer) {
            return Err(RemapError::NotOnRelocatedStack { stack_pointer });
        }
        log::info!("remap complete, running at stack pointer {:p}", stack_pointer);
        self.state = RemapState::RemapComplete;
        Ok(RecursiveMapping::new(self.layout.recursive_index))
    }

    fn expect(&self, expected: RemapState) -> Result<(), RemapError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RemapError::OutOfOrder {
                expected,
                actual: self.state,
            })
        }
    }
}

/// Allocates a frame and zeroes it as a page table.
fn new_table<'a, M: PhysicalMapper>(
    mapper: &M,
    frames: &mut FrameAllocator,
) -> Result<(PhysicalAddress, &'a mut PageTable), RemapError> {
    let frame = frames.allocate().ok_or(RemapError::OutOfFrames)?;
    // SAFETY: The frame was just allocated, so nothing else references it.
    let table = unsafe { mapper.table_at(frame) };
    table.zero();
    Ok((frame, table))
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::arch::software::EmulatedMachine;
    use crate::vmm::tests::loader_machine;
    use crate::{MemoryError, PageTableLevel, VirtualMemoryManager};

    static CONTINUED: AtomicBool = AtomicBool::new(false);

    extern "C-unwind" fn on_relocated_stack() -> ! {
        CONTINUED.store(true, Ordering::SeqCst);
        panic!("continued on the relocated stack");
    }

    /// Runs steps 1 and 2 against a fresh loader machine.
    fn installed() -> (KernelRemap, EmulatedMachine, FrameAllocator) {
        let (mut machine, mut frames) = loader_machine();
        let memory = machine.memory().clone();
        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);
        remap.allocate_stack(&machine, &memory, &mut frames).unwrap();
        remap.install_recursive_slot(&mut machine, &memory).unwrap();
        (remap, machine, frames)
    }

    #[test]
    fn default_layout() {
        let layout = RemapLayout::DEFAULT;
        assert_eq!(layout.stack_top().as_usize(), 0xFFFF_8080_000F_F000);
        assert_eq!(layout.stack_base().as_usize(), 0xFFFF_8080_0000_0000);
        assert_eq!(layout.stack_range().end.as_usize(), 0xFFFF_8080_0010_0000);
        assert_eq!(layout.capacity(), 255 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "must differ")]
    fn layout_rejects_shared_slot() {
        RemapLayout::new(300, 300, 16);
    }

    #[test]
    fn stack_is_fully_backed_by_distinct_frames() {
        let (remap, machine, _frames) = installed();
        let layout = remap.layout();

        let mut backing: Vec<_> = (0..layout.stack_pages)
            .map(|page| machine.walk(layout.stack_base() + page * PAGE_SIZE).unwrap())
            .collect();
        backing.sort();
        backing.dedup();
        assert_eq!(backing.len(), 256);
        assert!(machine.walk(layout.stack_range().end).is_err());
    }

    #[test]
    fn exactly_one_recursive_slot() {
        let (remap, machine, _frames) = installed();
        let root = machine.read_table_root();
        let top = machine.memory().table(root);

        let self_references: Vec<usize> = top
            .present_entries()
            .filter(|(_, entry)| entry.address() == root)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(self_references, [RemapLayout::DEFAULT.recursive_index]);
        assert_eq!(remap.state(), RemapState::RecursiveSlotInstalled);
        assert_eq!(machine.root_writes(), &[root]);
    }

    #[test]
    fn recursive_view_reaches_stack_tables() {
        let (remap, machine, mut frames) = installed();
        let recursive = remap.recursive_mapping().unwrap();
        let mut vmm = unsafe { VirtualMemoryManager::new(machine, recursive) };

        let top = remap.layout().stack_top();
        let mapping = vmm.query(top).unwrap().unwrap();
        assert!(mapping.flags.is_writable());

        let mut top_level = Vec::new();
        vmm.walk(|entry| {
            if entry.level == PageTableLevel::Top {
                top_level.push(entry.index)
            }
        })
        .unwrap();
        assert_eq!(top_level, [RemapLayout::DEFAULT.stack_index]);

        // Mapping elsewhere works through the recursive slot alone.
        let scratch = VirtualAddress::from_table_indices(259, 0, 0, 0, 0);
        let frame = frames.allocate().unwrap();
        vmm.map(scratch, frame, PageFlags::WRITABLE, &mut frames).unwrap();
        vmm.platform_mut().write_u64(scratch, 99).unwrap();
        assert_eq!(vmm.platform().memory().read_u64(frame), 99);

        // The recursive window stays off limits.
        let window = recursive.window_base();
        assert_eq!(
            vmm.map(window, frame, PageFlags::WRITABLE, &mut frames),
            Err(MemoryError::RecursiveRegion(window))
        );
    }

    #[test]
    fn full_remap_lands_on_relocated_stack() {
        let (mut remap, mut machine, _frames) = installed();
        let switch = remap.prepare_switch(0x2468).unwrap();
        assert_eq!(switch.frame_pointer, remap.layout().stack_top());
        assert_eq!(switch.stack_pointer.as_usize() % 16, 0);
        assert_eq!(remap.state(), RemapState::StackPointerSwitched);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: () = unsafe { machine.switch_stack(switch, on_relocated_stack) };
        }));
        assert!(result.is_err());
        assert!(CONTINUED.load(Ordering::SeqCst));
        assert_eq!(machine.stack_switch(), Some(switch));

        let stack_pointer = machine.stack_switch().unwrap().stack_pointer;
        assert!(remap.layout().stack_range().contains(&stack_pointer));
        let recursive = remap.complete(stack_pointer).unwrap();
        assert_eq!(recursive.index(), 510);
        assert_eq!(remap.state(), RemapState::RemapComplete);
    }

    #[test]
    fn rejects_stack_pointer_outside_relocated_stack() {
        let (mut remap, _machine, _frames) = installed();
        remap.prepare_switch(0).unwrap();

        let stray = VirtualAddress::new(0xFFFF_8000_0010_0000);
        assert_eq!(
            remap.complete(stray),
            Err(RemapError::NotOnRelocatedStack {
                stack_pointer: stray
            })
        );
        assert_eq!(remap.state(), RemapState::StackPointerSwitched);
    }

    #[test]
    fn rejects_boot_stack_deeper_than_capacity() {
        let (mut remap, _machine, _frames) = installed();
        let capacity = remap.layout().capacity();
        assert_eq!(
            remap.prepare_switch(capacity),
            Err(RemapError::StackTooDeep {
                depth: capacity,
                capacity
            })
        );
    }

    #[test]
    fn steps_must_run_in_order() {
        let (mut machine, mut frames) = loader_machine();
        let memory = machine.memory().clone();
        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);

        assert_eq!(
            remap.prepare_switch(0),
            Err(RemapError::OutOfOrder {
                expected: RemapState::RecursiveSlotInstalled,
                actual: RemapState::BootMappingActive
            })
        );
        assert_eq!(
            remap.install_recursive_slot(&mut machine, &memory),
            Err(RemapError::OutOfOrder {
                expected: RemapState::StackAllocated,
                actual: RemapState::BootMappingActive
            })
        );
        assert!(remap.recursive_mapping().is_none());

        remap.allocate_stack(&machine, &memory, &mut frames).unwrap();
        assert_eq!(
            remap.allocate_stack(&machine, &memory, &mut frames),
            Err(RemapError::OutOfOrder {
                expected: RemapState::BootMappingActive,
                actual: RemapState::StackAllocated
            })
        );
        assert!(machine.root_writes().is_empty());
    }

    #[test]
    fn refuses_occupied_stack_slot() {
        let (machine, mut frames) = loader_machine();
        let memory = machine.memory().clone();
        let root = machine.read_table_root();
        unsafe { memory.table_at(root) }.set_entry(
            257,
            PageEntry::new(PhysicalAddress::new(0x20_0000), TABLE_FLAGS),
        );

        let used = frames.used_frames();
        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);
        assert_eq!(
            remap.allocate_stack(&machine, &memory, &mut frames),
            Err(RemapError::StackSlotInUse { index: 257 })
        );
        assert_eq!(frames.used_frames(), used);
    }

    #[test]
    fn refuses_foreign_entry_in_recursive_slot() {
        let (mut machine, mut frames) = loader_machine();
        let memory = machine.memory().clone();
        let root = machine.read_table_root();
        let foreign = PageEntry::new(PhysicalAddress::new(0x30_0000), TABLE_FLAGS);
        unsafe { memory.table_at(root) }.set_entry(510, foreign);

        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);
        remap.allocate_stack(&machine, &memory, &mut frames).unwrap();
        assert_eq!(
            remap.install_recursive_slot(&mut machine, &memory),
            Err(RemapError::RecursiveSlotInUse {
                index: 510,
                raw: foreign.raw()
            })
        );
    }

    #[test]
    fn stack_allocation_reports_exhaustion() {
        let (machine, mut frames) = loader_machine();
        let memory = machine.memory().clone();
        let keep = frames.free_frames() - 10;
        for _ in 0..keep {
            frames.allocate().unwrap();
        }

        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);
        let result = remap.allocate_stack(&machine, &memory, &mut frames);
        assert_eq!(result, Err(RemapError::OutOfFrames));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(remap.state(), RemapState::BootMappingActive);
        // Nothing was linked into the live tables.
        assert!(!memory.table(machine.read_table_root()).entry(257).is_present());
    }
}
