// cSpell:ignore kmain

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]

mod arch;
mod console;
mod interrupts;
mod mem;
mod serial;

use core::fmt;

use limine::BaseRevision;
use mm::{FrameAllocatorError, MemoryError, RemapError};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

/// Everything that can stop the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    UnsupportedRevision,
    /// The loader did not answer a request.
    MissingResponse(&'static str),
    FramesNotInitialized,
    Frames(FrameAllocatorError),
    Memory(MemoryError),
    Remap(RemapError),
    /// The post-remap mapping check saw something wrong.
    SelfCheck(&'static str),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRevision => write!(f, "boot loader does not support base revision 4"),
            Self::MissingResponse(request) => write!(f, "no response to the {} request", request),
            Self::FramesNotInitialized => write!(f, "frame allocator is not initialized"),
            Self::Frames(err) => write!(f, "frame allocator: {}", err),
            Self::Memory(err) => write!(f, "memory manager: {}", err),
            Self::Remap(err) => write!(f, "kernel remap: {}", err),
            Self::SelfCheck(what) => write!(f, "mapping self check failed: {}", what),
        }
    }
}

impl From<FrameAllocatorError> for BootError {
    fn from(err: FrameAllocatorError) -> Self {
        Self::Frames(err)
    }
}

impl From<MemoryError> for BootError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl From<RemapError> for BootError {
    fn from(err: RemapError) -> Self {
        Self::Remap(err)
    }
}

pub fn kernel_main(stack_start: usize) -> ! {
    // SAFETY: We're only calling this once, before any other CPUs are running.
    unsafe {
        mem::set_stack_bounds(stack_start);
    }

    let Ok(console) = console::Console::init() else {
        arch::park();
    };
    serial::init(console);

    if !BASE_REVISION.is_supported() {
        fatal(BootError::UnsupportedRevision);
    }

    mem::log_framebuffer();
    if let Err(err) = mem::init_frames() {
        fatal(err);
    }
    log::debug!("Frame allocator initialized");

    mem::remap_kernel()
}

/// Reports an unrecoverable boot error and stops the CPU.
pub fn fatal(err: BootError) -> ! {
    log::error!("FATAL: {}", err);
    log::error!("CPU parked");
    arch::park();
}

pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("PICNIC: {}", info.message());
    if let Some(location) = info.location() {
        log::error!(" at {}", location)
    }

    log::error!("CPU parked");
    arch::park();
}
