//! Error taxonomy for the memory manager.
//!
//! Running out of frames and requests the manager refuses are recoverable.
//! Finding nothing mapped is reported as `Ok(None)`, never as an error. Faults
//! and inconsistencies during the remap must stop the machine.

use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;

use crate::{PageTableLevel, PhysicalAddress, RemapState, VirtualAddress};

/// A page fault: an access to `address` that the active tables could not translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error_code: PageFaultErrorCode,
}

impl PageFault {
    pub const fn new(address: VirtualAddress, error_code: PageFaultErrorCode) -> Self {
        Self {
            address,
            error_code,
        }
    }

    /// A fault on a page that is not mapped at all, as a kernel-mode read.
    pub const fn not_present(address: VirtualAddress) -> Self {
        Self::new(address, PageFaultErrorCode::empty())
    }

    /// True if the page was present and the access violated its protection,
    /// false if the page was not present at all.
    pub const fn is_protection_violation(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION)
    }

    pub const fn is_write(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    pub const fn is_user(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::USER_MODE)
    }

    pub const fn is_reserved_bit_violation(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::MALFORMED_TABLE)
    }

    pub const fn is_instruction_fetch(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {:p} (error code {:#x}: {} {} in {} mode{})",
            self.address,
            self.error_code.bits(),
            if self.is_protection_violation() {
                "protection violation on"
            } else {
                "not-present page on"
            },
            if self.is_instruction_fetch() {
                "fetch"
            } else if self.is_write() {
                "write"
            } else {
                "read"
            },
            if self.is_user() { "user" } else { "kernel" },
            if self.is_reserved_bit_violation() {
                ", reserved bit set"
            } else {
                ""
            },
        )
    }
}

/// Errors produced by the virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free frame was left for an intermediate table.
    OutOfFrames,
    /// The address lies in the region aliased by the recursive slot, which is
    /// never a normal mapping.
    RecursiveRegion(VirtualAddress),
    /// The address is covered by a large page mapped at `level`.
    HugePage {
        address: VirtualAddress,
        level: PageTableLevel,
    },
    /// A page was requested at a virtual address that is not page-aligned.
    UnalignedPage(VirtualAddress),
    /// A page was requested onto a physical address that is not page-aligned.
    UnalignedFrame(PhysicalAddress),
    /// A range of `len` bytes from `address` would run out of its canonical half.
    VirtualRangeOverflow { address: VirtualAddress, len: usize },
    /// A range of `len` bytes from `physical` would pass the widest physical address.
    PhysicalRangeOverflow { physical: PhysicalAddress, len: usize },
    /// A table access faulted. This is a broken hierarchy and is fatal.
    Fault(PageFault),
}

impl MemoryError {
    /// Returns true if the error leaves the machine in a state boot cannot
    /// continue from.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

impl From<PageFault> for MemoryError {
    fn from(fault: PageFault) -> Self {
        Self::Fault(fault)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::RecursiveRegion(address) => {
                write!(f, "{:p} lies in the recursive mapping region", address)
            }
            Self::HugePage { address, level } => write!(
                f,
                "{:p} is covered by a large page at the {} level",
                address, level
            ),
            Self::UnalignedPage(address) => {
                write!(f, "virtual address {:p} is not page-aligned", address)
            }
            Self::UnalignedFrame(physical) => {
                write!(f, "physical address {} is not page-aligned", physical)
            }
            Self::VirtualRangeOverflow { address, len } => write!(
                f,
                "{:#x} bytes from {:p} run past the end of the address space half",
                len, address
            ),
            Self::PhysicalRangeOverflow { physical, len } => write!(
                f,
                "{:#x} bytes from {} run past the widest physical address",
                len, physical
            ),
            Self::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

/// Errors produced by the kernel remap. Every one of them is fatal: once the
/// remap starts there is no way back to the boot mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapError {
    /// The frame allocator ran dry while building the stack.
    OutOfFrames,
    /// The top-level slot reserved for the stack already holds a mapping.
    StackSlotInUse { index: usize },
    /// The top-level slot reserved for the recursive mapping already holds an
    /// entry that does not point back at the top-level table.
    RecursiveSlotInUse { index: usize, raw: u64 },
    /// The live part of the boot stack does not fit in the relocated stack.
    StackTooDeep { depth: usize, capacity: usize },
    /// A step was run out of order.
    OutOfOrder {
        expected: RemapState,
        actual: RemapState,
    },
    /// After the switch the stack pointer is outside the relocated stack.
    NotOnRelocatedStack { stack_pointer: VirtualAddress },
}

impl RemapError {
    pub const fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for RemapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames while building the stack"),
            Self::StackSlotInUse { index } => {
                write!(f, "top-level slot {} reserved for the stack is in use", index)
            }
            Self::RecursiveSlotInUse { index, raw } => write!(
                f,
                "top-level slot {} reserved for the recursive mapping holds {:#018x}",
                index, raw
            ),
            Self::StackTooDeep { depth, capacity } => write!(
                f,
                "boot stack depth {:#x} exceeds relocated stack capacity {:#x}",
                depth, capacity
            ),
            Self::OutOfOrder { expected, actual } => write!(
                f,
                "remap step expected state {:?} but found {:?}",
                expected, actual
            ),
            Self::NotOnRelocatedStack { stack_pointer } => write!(
                f,
                "stack pointer {:p} is outside the relocated stack",
                stack_pointer
            ),
        }
    }
}
