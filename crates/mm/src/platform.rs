//! The hardware surface the memory manager depends on.
//!
//! Everything that would otherwise be inline assembly (control registers, the
//! translation cache, descriptor-table loads, the stack switch) goes through
//! [`Platform`]. [`arch::x86_64::Hardware`](crate::arch::x86_64::Hardware) drives the
//! real CPU; `arch::software::EmulatedMachine` simulates one for host tests.

use crate::{PageFault, PhysicalAddress, VirtualAddress};

/// The value loaded into the interrupt-table register: the table's linear base
/// address and its size in bytes minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptTableRegister {
    pub limit: u16,
    pub base: VirtualAddress,
}

/// Register values for moving execution onto a new stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSwitch {
    /// Loaded into the frame pointer first.
    pub frame_pointer: VirtualAddress,
    /// Loaded into the stack pointer immediately after.
    pub stack_pointer: VirtualAddress,
}

/// Entry point run on a freshly switched stack.
pub type StackContinuation = extern "C-unwind" fn() -> !;

/// Control-register and translation-cache access for one CPU.
pub trait Platform {
    /// Returns the physical address of the active top-level table.
    fn read_table_root(&self) -> PhysicalAddress;

    /// Makes `root` the active top-level table, dropping every cached
    /// non-global translation.
    ///
    /// # Safety
    ///
    /// `root` must be a complete hierarchy that maps the currently executing code,
    /// its stack and everything else still in use.
    unsafe fn write_table_root(&mut self, root: PhysicalAddress);

    /// Drops the cached translation for the page containing `address`.
    fn invalidate(&mut self, address: VirtualAddress);

    /// Loads the interrupt-table register.
    ///
    /// # Safety
    ///
    /// The table described by `register` must stay valid and unmodified for as
    /// long as interrupts can be delivered.
    unsafe fn load_interrupt_table(&mut self, register: InterruptTableRegister);

    /// Returns a pointer through which the active address space reaches `address`.
    ///
    /// On hardware this is the address itself, and a bad access traps to the fault
    /// handler instead of returning. A simulated machine performs the translation
    /// and reports the fault.
    fn resolve(&mut self, address: VirtualAddress) -> Result<*mut u8, PageFault>;

    /// Loads the frame pointer and then the stack pointer from `switch` and calls
    /// `continuation` on the new stack. Never returns.
    ///
    /// # Safety
    ///
    /// The new stack must be mapped and writable, and nothing borrowed from the
    /// old stack may be used again.
    unsafe fn switch_stack(&mut self, switch: StackSwitch, continuation: StackContinuation) -> !;
}

/// Turns physical addresses into pointers the current context can dereference.
///
/// Before the remap this is the loader's direct map; the VMM never uses it.
pub trait PhysicalMapper {
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8;

    /// Returns the page table stored in the frame at `phys`.
    ///
    /// # Safety
    ///
    /// The frame must hold a page table (or be about to be initialized as one)
    /// and no other reference to it may be live.
    unsafe fn table_at<'a>(&self, phys: PhysicalAddress) -> &'a mut crate::PageTable {
        debug_assert!(phys.is_page_aligned(), "page tables are page-aligned");
        unsafe { &mut *(self.phys_to_ptr(phys) as *mut crate::PageTable) }
    }
}

/// The loader-provided direct map: physical address `p` is visible at `p + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl PhysicalMapper for DirectMap {
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        phys.as_usize().wrapping_add(self.offset) as *mut u8
    }
}
