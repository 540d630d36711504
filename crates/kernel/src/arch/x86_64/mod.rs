use mm::VirtualAddress;

pub mod interrupts;

/// The architecture-specific entry point
///
/// This function is responsible for capturing the stack start address
/// and calling the main kernel entry point.
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    let stack_start = stack_pointer().as_usize();
    crate::kernel_main(stack_start)
}

/// Reads the current stack pointer.
#[inline(always)]
pub fn stack_pointer() -> VirtualAddress {
    let rsp: usize;
    // SAFETY: Reading rsp has no side effects.
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
    VirtualAddress::new(rsp)
}
