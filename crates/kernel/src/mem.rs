// cSpell:ignore Hhdm

use core::sync::atomic::{AtomicUsize, Ordering};

use limine::{
    memory_map::{self, Entry},
    request::{FramebufferRequest, HhdmRequest, MemoryMapRequest, StackSizeRequest},
};
use mm::{
    BootMemoryRegion, DirectMap, FrameAllocator, KernelRemap, MemoryError, PageFlags,
    PhysicalAddress, Platform, RemapLayout, StackSwitch, VirtualAddress, VirtualMemoryManager,
    arch::x86_64::Hardware,
};
use spin::Mutex;

use crate::{BootError, arch};

/// Top-level slot whose first page is used by the post-remap self check.
pub const SCRATCH_INDEX: usize = 259;

const MIB: u64 = 1024 * 1024;

static FRAMES: Mutex<Option<FrameAllocator>> = Mutex::new(None);
static REMAP: Mutex<KernelRemap> = Mutex::new(KernelRemap::new(RemapLayout::DEFAULT));

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

pub fn type_name(entry_type: memory_map::EntryType) -> &'static str {
    match entry_type {
        memory_map::EntryType::USABLE => "USABLE",
        memory_map::EntryType::RESERVED => "RESERVED",
        memory_map::EntryType::ACPI_RECLAIMABLE => "ACPI_RECLAIMABLE",
        memory_map::EntryType::ACPI_NVS => "ACPI_NVS",
        memory_map::EntryType::BAD_MEMORY => "BAD_MEMORY",
        memory_map::EntryType::BOOTLOADER_RECLAIMABLE => "BOOTLOADER_RECLAIMABLE",
        memory_map::EntryType::EXECUTABLE_AND_MODULES => "EXECUTABLE_AND_MODULES",
        memory_map::EntryType::FRAMEBUFFER => "FRAMEBUFFER",
        _ => "UNKNOWN",
    }
}

/// Wrapper around Limine's memory map entry to implement mm's `BootMemoryRegion` trait.
#[repr(transparent)]
struct LimineMemoryRegion<'a>(&'a Entry);

impl<'a> LimineMemoryRegion<'a> {
    /// Converts a slice of Entry references to a slice of LimineMemoryRegion.
    fn wrap_slice(entries: &'a [&'a Entry]) -> &'a [LimineMemoryRegion<'a>] {
        // SAFETY: LimineMemoryRegion is #[repr(transparent)] over &Entry
        unsafe { core::mem::transmute(entries) }
    }
}

impl BootMemoryRegion for LimineMemoryRegion<'_> {
    fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0.base as usize)
    }

    fn size(&self) -> usize {
        self.0.length as usize
    }

    fn is_usable(&self) -> bool {
        self.0.entry_type == memory_map::EntryType::USABLE
    }
}

/// Logs every region of the boot memory map and the usable total.
fn log_memory_map(entries: &[&Entry]) {
    let mut usable = 0;
    for entry in entries {
        log::info!(
            "  [{:#018x}..{:#018x}] {:>10} KiB {}",
            entry.base,
            entry.base + entry.length,
            entry.length / 1024,
            type_name(entry.entry_type)
        );
        if entry.entry_type == memory_map::EntryType::USABLE {
            usable += entry.length;
        }
    }
    log::info!(
        "memory map: {} regions, {} MiB usable",
        entries.len(),
        usable / MIB
    );
}

/// Logs the framebuffers the loader set up. Nothing draws to them.
pub fn log_framebuffer() {
    let Some(response) = FRAMEBUFFER_REQUEST.get_response() else {
        log::debug!("no framebuffer");
        return;
    };
    for framebuffer in response.framebuffers() {
        log::info!(
            "framebuffer at {:p}: {}x{}, pitch {}, {} bpp",
            framebuffer.addr(),
            framebuffer.width(),
            framebuffer.height(),
            framebuffer.pitch(),
            framebuffer.bpp()
        );
    }
}

fn direct_map() -> Result<DirectMap, BootError> {
    let offset = HIGHER_HALF_DIRECT_MAP
        .get_response()
        .ok_or(BootError::MissingResponse("higher-half direct map"))?
        .offset();
    Ok(DirectMap::new(offset as usize))
}

/// Builds the frame allocator from the boot memory map.
pub fn init_frames() -> Result<(), BootError> {
    let boot_memmap = MEMORY_MAP_REQUEST
        .get_response()
        .ok_or(BootError::MissingResponse("memory map"))?
        .entries();
    log_memory_map(boot_memmap);

    let mapper = direct_map()?;
    // SAFETY: The direct map covers all of physical memory and the loader's
    // usable regions are free for the kernel to take.
    let frames =
        unsafe { FrameAllocator::from_boot_map(LimineMemoryRegion::wrap_slice(boot_memmap), &mapper) }?;
    *FRAMES.lock() = Some(frames);
    Ok(())
}

/// Moves onto the relocated stack and continues in [`resume_on_relocated_stack`].
pub fn remap_kernel() -> ! {
    let switch = match begin_remap() {
        Ok(switch) => switch,
        Err(err) => crate::fatal(err),
    };
    // SAFETY: The stack was mapped by `begin_remap`, no lock is held, and the
    // continuation never returns to this frame.
    unsafe { Hardware::new().switch_stack(switch, resume_on_relocated_stack) }
}

fn begin_remap() -> Result<StackSwitch, BootError> {
    let mapper = direct_map()?;
    // SAFETY: Boot runs on one CPU and this is the only live handle.
    let mut platform = unsafe { Hardware::new() };

    let mut frames = FRAMES.lock();
    let frames = frames.as_mut().ok_or(BootError::FramesNotInitialized)?;
    let mut remap = REMAP.lock();

    remap.allocate_stack(&platform, &mapper, frames)?;
    remap.install_recursive_slot(&mut platform, &mapper)?;
    Ok(remap.prepare_switch(boot_stack_depth())?)
}

extern "C-unwind" fn resume_on_relocated_stack() -> ! {
    match finish_remap() {
        Ok(()) => {
            log::info!("boot complete");
            arch::park()
        }
        Err(err) => crate::fatal(err),
    }
}

fn finish_remap() -> Result<(), BootError> {
    let recursive = REMAP.lock().complete(arch::stack_pointer())?;
    // SAFETY: The handle used for the switch is never touched again.
    let mut vmm = unsafe { VirtualMemoryManager::new(Hardware::new(), recursive) };

    arch::interrupts::install(vmm.platform_mut());

    let summary = vmm.dump()?;
    log::info!("page tables: {}", summary);

    let mut frames = FRAMES.lock();
    let frames = frames.as_mut().ok_or(BootError::FramesNotInitialized)?;
    verify_mappings(&mut vmm, frames)
}

/// Exercises the VMM on a scratch page: map it, write and read through it,
/// make it read-only, unmap it and give its frame back.
pub fn verify_mappings<P: Platform>(
    vmm: &mut VirtualMemoryManager<P>,
    frames: &mut FrameAllocator,
) -> Result<(), BootError> {
    const PATTERN: u64 = 0x4841_4C43_594F_4E21;
    let scratch = VirtualAddress::from_table_indices(SCRATCH_INDEX, 0, 0, 0, 0);

    let frame = frames.allocate().ok_or(MemoryError::OutOfFrames)?;
    vmm.map(scratch, frame, PageFlags::WRITABLE, frames)?;

    let slot = vmm
        .platform_mut()
        .resolve(scratch + 8)
        .map_err(MemoryError::from)? as *mut u64;
    // SAFETY: The scratch page is mapped writable and nothing else uses it.
    let read_back = unsafe {
        slot.write_volatile(PATTERN);
        slot.read_volatile()
    };
    if read_back != PATTERN {
        return Err(BootError::SelfCheck("scratch page lost a write"));
    }

    match vmm.query(scratch)? {
        Some(mapping) if mapping.physical == frame && mapping.flags.is_writable() => {}
        _ => return Err(BootError::SelfCheck("scratch page has the wrong translation")),
    }
    match vmm.change_flags(scratch, PageFlags::empty())? {
        Some(mapping) if mapping.physical == frame && !mapping.flags.is_writable() => {}
        _ => return Err(BootError::SelfCheck("scratch page flags did not change")),
    }
    if vmm.unmap(scratch)?.map(|mapping| mapping.physical) != Some(frame) {
        return Err(BootError::SelfCheck("scratch page unmapped the wrong frame"));
    }
    if vmm.query(scratch)?.is_some() {
        return Err(BootError::SelfCheck("scratch page is still mapped"));
    }
    frames.free(frame);

    log::info!("mapping self check passed at {:p}", scratch);
    Ok(())
}

static STACK_START: AtomicUsize = AtomicUsize::new(0);

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(65536); // 64 KiB stack

/// Records the stack pointer at kernel entry.
///
/// # Safety
///
/// Must be called once, from the entry point, before anything measures the stack.
pub unsafe fn set_stack_bounds(stack_start: usize) {
    STACK_START.store(stack_start, Ordering::SeqCst);
}

/// Bytes of the boot stack in use at the caller.
fn boot_stack_depth() -> usize {
    let depth = STACK_START
        .load(Ordering::SeqCst)
        .saturating_sub(arch::stack_pointer().as_usize());
    log::debug!("boot stack depth {:#x} of {:#x}", depth, STACK_SIZE.size());
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm::{
        PAGE_SIZE, PhysicalMapper, RecursiveMapping,
        arch::software::{EmulatedMachine, EmulatedMemory},
    };

    const MIB: usize = 1024 * 1024;

    fn entry(base: usize, length: usize, entry_type: memory_map::EntryType) -> Entry {
        Entry {
            base: base as u64,
            length: length as u64,
            entry_type,
        }
    }

    fn boot_map() -> [Entry; 3] {
        [
            entry(0, MIB, memory_map::EntryType::RESERVED),
            entry(MIB, MIB, memory_map::EntryType::BOOTLOADER_RECLAIMABLE),
            entry(2 * MIB, 16 * MIB, memory_map::EntryType::USABLE),
        ]
    }

    fn allocator(memory: &EmulatedMemory) -> FrameAllocator {
        let entries = boot_map();
        let refs: Vec<&Entry> = entries.iter().collect();
        unsafe { FrameAllocator::from_boot_map(LimineMemoryRegion::wrap_slice(&refs), memory) }
            .unwrap()
    }

    /// Runs the remap steps on an emulated machine booted with an empty root.
    fn remapped() -> (VirtualMemoryManager<EmulatedMachine>, FrameAllocator) {
        let memory = EmulatedMemory::new(18 * MIB);
        let mut frames = allocator(&memory);
        let root = frames.allocate().unwrap();
        unsafe { memory.table_at(root) }.zero();

        let mut machine = EmulatedMachine::new(memory.clone());
        machine.boot(root);

        let mut remap = KernelRemap::new(RemapLayout::DEFAULT);
        remap.allocate_stack(&machine, &memory, &mut frames).unwrap();
        remap.install_recursive_slot(&mut machine, &memory).unwrap();
        let switch = remap.prepare_switch(0x400).unwrap();
        let recursive = remap.complete(switch.stack_pointer).unwrap();
        (unsafe { VirtualMemoryManager::new(machine, recursive) }, frames)
    }

    #[test]
    fn names_memory_types() {
        assert_eq!(type_name(memory_map::EntryType::USABLE), "USABLE");
        assert_eq!(type_name(memory_map::EntryType::ACPI_NVS), "ACPI_NVS");
        assert_eq!(type_name(memory_map::EntryType::FRAMEBUFFER), "FRAMEBUFFER");
    }

    #[test]
    fn adapts_limine_entries() {
        let entries = boot_map();
        let refs: Vec<&Entry> = entries.iter().collect();
        let regions = LimineMemoryRegion::wrap_slice(&refs);

        assert_eq!(regions.len(), 3);
        assert_eq!(regions[2].base(), PhysicalAddress::new(2 * MIB));
        assert_eq!(regions[2].size(), 16 * MIB);
        assert_eq!(regions[2].end(), PhysicalAddress::new(18 * MIB));
        assert!(regions[2].is_usable());
        assert!(!regions[1].is_usable());
    }

    #[test]
    fn boot_map_with_sixteen_mib_at_two_mib() {
        let memory = EmulatedMemory::new(18 * MIB);
        let mut frames = allocator(&memory);

        assert_eq!(frames.total_frames(), 4096);
        assert_eq!(frames.bitmap_region(), (PhysicalAddress::new(2 * MIB), 512));
        // 512 frames below 2 MiB plus the bitmap's own frame.
        assert_eq!(frames.used_frames(), 513);
        assert_eq!(frames.allocate(), Some(PhysicalAddress::new(2 * MIB + PAGE_SIZE)));
    }

    #[test]
    fn self_check_passes_after_remap() {
        let (mut vmm, mut frames) = remapped();
        let used = frames.used_frames();

        verify_mappings(&mut vmm, &mut frames).unwrap();

        let scratch = VirtualAddress::from_table_indices(SCRATCH_INDEX, 0, 0, 0, 0);
        assert_eq!(vmm.query(scratch).unwrap(), None);
        // The scratch frame came back; only its three tables stay allocated.
        assert_eq!(frames.used_frames(), used + 3);
        assert!(vmm.platform().faults().is_empty());
    }

    #[test]
    fn self_check_leaves_only_stack_and_scratch_tables() {
        let (mut vmm, mut frames) = remapped();
        verify_mappings(&mut vmm, &mut frames).unwrap();

        let summary = vmm.dump().unwrap();
        assert_eq!(summary.present[0], 2, "stack and scratch slots");
        assert_eq!(summary.pages_4kib, RemapLayout::DEFAULT.stack_pages);

        let root = vmm.platform().read_table_root();
        let top = vmm.platform().memory().table(root);
        let recursive: Vec<usize> = top
            .present_entries()
            .filter(|(_, entry)| entry.address() == root)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(recursive, [RecursiveMapping::new(510).index()]);
    }

    #[test]
    fn self_check_reports_exhaustion() {
        let (mut vmm, mut frames) = remapped();
        while frames.allocate().is_some() {}

        assert_eq!(
            verify_mappings(&mut vmm, &mut frames),
            Err(BootError::Memory(MemoryError::OutOfFrames))
        );
    }
}
