//! The interrupt table and what the kernel does with a page fault.
//!
//! Only the page-fault vector is ever installed. At this stage every page fault
//! means a mapping was programmed wrong, so the handler reports it and stops.

use core::mem::size_of;

use mm::{InterruptTableRegister, PageFault, Platform, VirtualAddress};

/// Number of vectors in the table.
pub const VECTOR_COUNT: usize = 256;

/// Present, ring 0, 64-bit interrupt gate.
pub const INTERRUPT_GATE: u8 = 0x8E;

/// One 16-byte gate of the interrupt table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

const _: () = assert!(size_of::<GateDescriptor>() == 16);

impl GateDescriptor {
    /// A gate that is not present.
    pub const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        ist: 0,
        type_attr: 0,
        offset_mid: 0,
        offset_high: 0,
        reserved: 0,
    };

    pub const fn new(handler: usize, selector: u16, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    /// The handler address, reassembled from its three fields.
    pub const fn handler(&self) -> usize {
        self.offset_low as usize
            | (self.offset_mid as usize) << 16
            | (self.offset_high as usize) << 32
    }

    pub const fn selector(&self) -> u16 {
        self.selector
    }

    pub const fn type_attr(&self) -> u8 {
        self.type_attr
    }

    pub const fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }
}

/// The 256-entry interrupt table.
#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct InterruptTable {
    gates: [GateDescriptor; VECTOR_COUNT],
}

impl InterruptTable {
    /// A table with every gate cleared.
    pub const fn new() -> Self {
        Self {
            gates: [GateDescriptor::MISSING; VECTOR_COUNT],
        }
    }

    /// Points `vector` at `handler`. The reserved fields of the gate are zeroed.
    pub fn set_gate(&mut self, vector: u8, handler: usize, selector: u16, type_attr: u8) {
        self.gates[vector as usize] = GateDescriptor::new(handler, selector, type_attr);
    }

    pub fn gate(&self, vector: u8) -> GateDescriptor {
        self.gates[vector as usize]
    }

    /// The value to load into the interrupt-table register for this table.
    pub fn register(&'static self) -> InterruptTableRegister {
        InterruptTableRegister {
            limit: (size_of::<Self>() - 1) as u16,
            base: VirtualAddress::from_ptr(self),
        }
    }

    /// Loads this table into the CPU.
    ///
    /// # Safety
    ///
    /// Every present gate must point at a valid handler for its vector.
    pub unsafe fn load<P: Platform>(&'static self, platform: &mut P) {
        let register = self.register();
        // SAFETY: The table is static and its gates are valid per the caller.
        unsafe { platform.load_interrupt_table(register) };
        log::info!(
            "interrupt table loaded at {:p} ({} gates present)",
            register.base,
            self.gates.iter().filter(|gate| gate.is_present()).count()
        );
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A table whose only gate sends `page_fault` to `handler`.
pub fn page_fault_table(page_fault: u8, handler: usize, selector: u16) -> InterruptTable {
    let mut table = InterruptTable::new();
    table.set_gate(page_fault, handler, selector, INTERRUPT_GATE);
    table
}

/// What the low-level handler must do after a fault has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Stop the CPU for good.
    Fatal,
}

/// Reports a page fault. Every fault is fatal during boot.
pub fn page_fault_received(fault: &PageFault, instruction_pointer: VirtualAddress) -> FaultDisposition {
    log::error!("{} at ip {:p}", fault, instruction_pointer);
    log::error!(
        "faulting address {:#x}, error code {:#x}",
        fault.address,
        fault.error_code.bits()
    );
    FaultDisposition::Fatal
}

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new interrupt vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the interrupt vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "InterruptVector::{}({})", name, self.0)
                } else {
                    write!(f, "InterruptVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}
