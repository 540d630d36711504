use mm::{PageFault, VirtualAddress, arch::x86_64::Hardware};
use x86_64::{
    registers::control::Cr2,
    structures::idt::{InterruptStackFrame, PageFaultErrorCode},
};

use crate::interrupts::{FaultDisposition, InterruptTable, page_fault_received, page_fault_table};

/// Limine's 64-bit kernel code segment.
pub const KERNEL_CODE_SELECTOR: u16 = 0x28;

static IDT: spin::Once<InterruptTable> = spin::Once::new();

/// Builds the interrupt table with the page-fault gate and loads it.
pub fn install(platform: &mut Hardware) {
    let table = IDT.call_once(|| {
        page_fault_table(
            InterruptVector::PAGE_FAULT.value(),
            page_fault_handler as *const () as usize,
            KERNEL_CODE_SELECTOR,
        )
    });
    // SAFETY: The only present gate points at `page_fault_handler`.
    unsafe { table.load(platform) };
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let address = match Cr2::read() {
        Ok(address) => address.as_u64(),
        Err(invalid) => invalid.0,
    };
    let fault = PageFault::new(VirtualAddress::new_truncate(address as usize), error_code);
    let ip = VirtualAddress::new_truncate(stack_frame.instruction_pointer.as_u64() as usize);

    match page_fault_received(&fault, ip) {
        FaultDisposition::Fatal => {
            log::error!("CPU parked");
            crate::arch::park()
        }
    }
}

crate::interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    COPROCESSOR_SEGMENT_OVERRUN = 9,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT_EXCEPTION = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT_EXCEPTION = 19,
    VIRTUALIZATION_EXCEPTION = 20,
    CP_PROTECTION_EXCEPTION = 21,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_have_names() {
        assert_eq!(InterruptVector::PAGE_FAULT.value(), 14);
        assert_eq!(InterruptVector::new(14).name(), Some("PAGE_FAULT"));
        assert_eq!(InterruptVector::new(15).name(), None);
        assert_eq!(format!("{}", InterruptVector::new(200)), "200");
        assert_eq!(
            format!("{:?}", InterruptVector::DOUBLE_FAULT),
            "InterruptVector::DOUBLE_FAULT(8)"
        );
    }
}
