//! Software emulation of an x86_64 CPU and its physical memory.
//!
//! The emulated machine keeps the real 4-level, 512-entry layout so the recursive
//! aliases computed by the VMM are exactly the ones hardware would see. Every
//! virtual access goes through a genuine table walk, and translations are
//! cached per page until invalidated, so a missing invalidation shows up as a
//! stale read just like on a real CPU.
//!
//! What the machine records (root writes, invalidations, the loaded interrupt
//! table, the stack switch, faults) is exposed for assertions.

use alloc::{collections::BTreeMap, rc::Rc, vec::Vec};
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::{
    InterruptTableRegister, PAGE_SIZE, PageEntry, PageFault, PageSize, PageTable, PageTableLevel,
    PhysicalAddress, PhysicalMapper, Platform, StackSwitch, VirtualAddress,
    platform::StackContinuation,
};

struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `base` came from `alloc_zeroed` with this layout.
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Simulated physical memory starting at physical address zero.
///
/// Clones share the same memory, so the machine and the code under test can each
/// hold a handle.
#[derive(Clone)]
pub struct EmulatedMemory {
    region: Rc<Region>,
}

impl EmulatedMemory {
    /// Creates `size` bytes of zeroed physical memory, rounded up to whole pages.
    pub fn new(size: usize) -> Self {
        let size = size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let layout = match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("emulated memory of {} bytes is too large", size),
        };
        // SAFETY: The layout has a non-zero size.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        Self {
            region: Rc::new(Region { base, layout }),
        }
    }

    pub fn size(&self) -> usize {
        self.region.layout.size()
    }

    pub fn read_u64(&self, phys: PhysicalAddress) -> u64 {
        // SAFETY: `phys_to_ptr` bounds-checks the address.
        unsafe { (self.phys_to_ptr(phys) as *const u64).read_unaligned() }
    }

    pub fn write_u64(&self, phys: PhysicalAddress, value: u64) {
        // SAFETY: `phys_to_ptr` bounds-checks the address.
        unsafe { (self.phys_to_ptr(phys) as *mut u64).write_unaligned(value) }
    }

    /// Returns a copy of the page table stored at `phys`.
    pub fn table(&self, phys: PhysicalAddress) -> PageTable {
        // SAFETY: Any 4 KiB of memory is a valid page table bit pattern.
        unsafe { (*(self.phys_to_ptr(phys.frame_base()) as *const PageTable)).clone() }
    }
}

impl PhysicalMapper for EmulatedMemory {
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        assert!(
            phys.as_usize() + core::mem::size_of::<u64>() <= self.size(),
            "physical address {} is outside emulated memory",
            phys
        );
        // SAFETY: The offset is within the allocation.
        unsafe { self.region.base.as_ptr().add(phys.as_usize()) }
    }
}

/// A simulated CPU with its own table root and translation cache.
pub struct EmulatedMachine {
    memory: EmulatedMemory,
    root: PhysicalAddress,
    translations: BTreeMap<usize, PhysicalAddress>,
    root_writes: Vec<PhysicalAddress>,
    invalidations: Vec<VirtualAddress>,
    interrupt_table: Option<InterruptTableRegister>,
    stack_switch: Option<StackSwitch>,
    faults: Vec<PageFault>,
}

impl EmulatedMachine {
    /// Creates a machine over `memory`. Until [`boot`](Self::boot) runs the root is
    /// physical address zero.
    pub fn new(memory: EmulatedMemory) -> Self {
        Self {
            memory,
            root: PhysicalAddress::new(0),
            translations: BTreeMap::new(),
            root_writes: Vec::new(),
            invalidations: Vec::new(),
            interrupt_table: None,
            stack_switch: None,
            faults: Vec::new(),
        }
    }

    /// Activates `root` the way a boot loader would before handing over control.
    /// Unlike [`Platform::write_table_root`] this is not recorded.
    pub fn boot(&mut self, root: PhysicalAddress) {
        self.root = root;
        self.translations.clear();
    }

    pub fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    /// Walks the active tables without consulting or filling the cache.
    pub fn walk(&self, address: VirtualAddress) -> Result<PhysicalAddress, PageFault> {
        let mut table = self.root;
        for level in PageTableLevel::TOP_DOWN {
            let slot = table + address.table_index(level) * core::mem::size_of::<u64>();
            let entry = PageEntry::from_raw(self.memory.read_u64(slot));
            if !entry.is_present() {
                return Err(PageFault::not_present(address));
            }
            if entry.maps_page_at(level) {
                let size = PageEntry::page_size_at(level).bytes();
                let base = entry.address().as_usize() & !(size - 1);
                return Ok(PhysicalAddress::new(base + (address.as_usize() & (size - 1))));
            }
            table = entry.address();
        }
        unreachable!("a present leaf entry always maps a page")
    }

    /// Translates through the cache, the way the CPU does for every access.
    pub fn translate(&mut self, address: VirtualAddress) -> Result<PhysicalAddress, PageFault> {
        let page = address.page_base().as_usize();
        if let Some(frame) = self.translations.get(&page) {
            return Ok(*frame + address.page_offset());
        }
        match self.walk(address) {
            Ok(phys) => {
                self.translations.insert(page, phys.frame_base());
                Ok(phys)
            }
            Err(fault) => {
                self.faults.push(fault);
                Err(fault)
            }
        }
    }

    pub fn read_u64(&mut self, address: VirtualAddress) -> Result<u64, PageFault> {
        let phys = self.translate(address)?;
        Ok(self.memory.read_u64(phys))
    }

    pub fn write_u64(&mut self, address: VirtualAddress, value: u64) -> Result<(), PageFault> {
        let phys = self.translate(address)?;
        self.memory.write_u64(phys, value);
        Ok(())
    }

    /// Returns true if a translation for the page containing `address` is cached.
    pub fn is_cached(&self, address: VirtualAddress) -> bool {
        self.translations.contains_key(&address.page_base().as_usize())
    }

    /// Every root passed to [`Platform::write_table_root`], in order.
    pub fn root_writes(&self) -> &[PhysicalAddress] {
        &self.root_writes
    }

    /// Every address passed to [`Platform::invalidate`], in order.
    pub fn invalidations(&self) -> &[VirtualAddress] {
        &self.invalidations
    }

    pub fn interrupt_table(&self) -> Option<InterruptTableRegister> {
        self.interrupt_table
    }

    /// The register values of the last stack switch.
    pub fn stack_switch(&self) -> Option<StackSwitch> {
        self.stack_switch
    }

    /// Every translation that faulted.
    pub fn faults(&self) -> &[PageFault] {
        &self.faults
    }

    /// Size of the page that maps `address`, if any.
    pub fn page_size(&self, address: VirtualAddress) -> Option<PageSize> {
        let mut table = self.root;
        for level in PageTableLevel::TOP_DOWN {
            let slot = table + address.table_index(level) * core::mem::size_of::<u64>();
            let entry = PageEntry::from_raw(self.memory.read_u64(slot));
            if !entry.is_present() {
                return None;
            }
            if entry.maps_page_at(level) {
                return Some(PageEntry::page_size_at(level));
            }
            table = entry.address();
        }
        None
    }
}

impl Platform for EmulatedMachine {
    fn read_table_root(&self) -> PhysicalAddress {
        self.root
    }

    unsafe fn write_table_root(&mut self, root: PhysicalAddress) {
        self.root = root;
        self.translations.clear();
        self.root_writes.push(root);
    }

    fn invalidate(&mut self, address: VirtualAddress) {
        self.translations.remove(&address.page_base().as_usize());
        self.invalidations.push(address);
    }

    unsafe fn load_interrupt_table(&mut self, register: InterruptTableRegister) {
        self.interrupt_table = Some(register);
    }

    fn resolve(&mut self, address: VirtualAddress) -> Result<*mut u8, PageFault> {
        let phys = self.translate(address)?;
        Ok(self.memory.phys_to_ptr(phys))
    }

    unsafe fn switch_stack(&mut self, switch: StackSwitch, continuation: StackContinuation) -> ! {
        // `call` pushes the return address onto the new stack.
        if let Err(fault) = self.write_u64(switch.stack_pointer - 8, 0) {
            panic!("stack switch faulted: {}", fault);
        }
        self.stack_switch = Some(switch);
        continuation()
    }
}
