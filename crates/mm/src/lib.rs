#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Halcyon Memory Manager
//!
//! The memory-management core of the Halcyon kernel. It provides:
//!
//! - A bitmap frame allocator seeded from the boot loader's memory map.
//! - A virtual memory manager that reaches every page table through a recursive
//!   top-level slot, so it never needs a physical-to-virtual offset.
//! - The one-shot kernel remap that relocates the boot stack and installs the
//!   recursive slot into the loader's live tables.
//! - A [`Platform`] abstraction over the control registers and translation cache,
//!   with a software machine for host-side testing.

#[cfg(any(test, feature = "software-emulation"))]
extern crate alloc;

mod address;
pub mod arch;
mod error;
mod frame_allocator;
mod memmap;
mod paging;
mod platform;
mod recursive;
mod remap;
mod vmm;

pub use address::{PhysicalAddress, VirtualAddress};
pub use error::{MemoryError, PageFault, RemapError};
pub use frame_allocator::{FrameAllocator, FrameAllocatorError, LOW_MEMORY_LIMIT};
pub use memmap::{BootMemoryRegion, UsableMemory};
pub use paging::{PAGE_SIZE, PageEntry, PageFlags, PageSize, PageTable, PageTableLevel};
pub use platform::{
    DirectMap, InterruptTableRegister, PhysicalMapper, Platform, StackContinuation,
    StackSwitch,
};
pub use recursive::RecursiveMapping;
pub use remap::{KernelRemap, RemapLayout, RemapState};
pub use vmm::{Mapping, TableEntry, VirtualMemoryManager, WalkSummary};
