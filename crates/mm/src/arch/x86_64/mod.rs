//! The real x86_64 CPU.

use core::arch::asm;

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::{tables::lidt, tlb},
    registers::control::Cr3,
    structures::{DescriptorTablePointer, paging::PhysFrame},
};

use crate::{
    InterruptTableRegister, PageFault, PhysicalAddress, Platform, StackSwitch, VirtualAddress,
    platform::StackContinuation,
};

/// The CPU this code is running on.
pub struct Hardware {
    _private: (),
}

impl Hardware {
    /// # Safety
    ///
    /// Must run in ring 0, and only one `Hardware` may be used at a time.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Platform for Hardware {
    fn read_table_root(&self) -> PhysicalAddress {
        let (frame, _) = Cr3::read();
        PhysicalAddress::new(frame.start_address().as_u64() as usize)
    }

    unsafe fn write_table_root(&mut self, root: PhysicalAddress) {
        let (_, flags) = Cr3::read();
        let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
        // SAFETY: Forwarded to the caller.
        unsafe { Cr3::write(frame, flags) };
    }

    fn invalidate(&mut self, address: VirtualAddress) {
        tlb::flush(VirtAddr::new(address.as_u64()));
    }

    unsafe fn load_interrupt_table(&mut self, register: InterruptTableRegister) {
        let pointer = DescriptorTablePointer {
            limit: register.limit,
            base: VirtAddr::new(register.base.as_u64()),
        };
        // SAFETY: Forwarded to the caller.
        unsafe { lidt(&pointer) };
    }

    fn resolve(&mut self, address: VirtualAddress) -> Result<*mut u8, PageFault> {
        Ok(address.as_mut_ptr())
    }

    unsafe fn switch_stack(&mut self, switch: StackSwitch, continuation: StackContinuation) -> ! {
        // Nothing may touch the stack between the two register writes.
        unsafe {
            asm!(
                "mov rbp, {frame}",
                "mov rsp, {stack}",
                "call {continuation}",
                "ud2",
                frame = in(reg) switch.frame_pointer.as_usize(),
                stack = in(reg) switch.stack_pointer.as_usize(),
                continuation = in(reg) continuation as usize,
                options(noreturn),
            )
        }
    }
}
