//! Address types for physical and virtual memory.
//!
//! Physical and virtual addresses are distinct newtypes so the two address spaces
//! cannot be mixed up. All the bit-twiddling needed by the page-table code lives
//! here as methods on those types.

use core::fmt;
use core::ops::{Add, Sub};

use crate::paging::{ENTRIES_PER_TABLE, PAGE_SIZE, PageTableLevel};

/// Maximum number of bits in a physical address on x86_64.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Number of implemented virtual address bits with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

const SIGN_EXTENSION: usize = !((1 << MAX_VIRTUAL_BITS) - 1);

const fn is_canonical(addr: usize) -> bool {
    canonicalize(addr) == addr
}

/// Sign-extends bit 47 into bits 48-63.
const fn canonicalize(addr: usize) -> usize {
    if addr & (1 << (MAX_VIRTUAL_BITS - 1)) != 0 {
        addr | SIGN_EXTENSION
    } else {
        addr & !SIGN_EXTENSION
    }
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a `u64`, the width the hardware uses.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address sits on a 4 KiB boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(PAGE_SIZE)
            }

            /// Returns the offset of this address within its 4 KiB page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are at most 52 bits wide on x86_64. A physical address is\n\
     never dereferenced directly; it must first be turned into a pointer by a\n\
     [`PhysicalMapper`](crate::PhysicalMapper)."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr >> MAX_PHYSICAL_BITS == 0,
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the physical address of frame number `index`.
    #[inline]
    pub const fn from_frame_index(index: usize) -> Self {
        Self::new(index * PAGE_SIZE)
    }

    /// Returns the index of the 4 KiB frame containing this address.
    #[inline]
    pub const fn frame_index(self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// Returns the address `bytes` further on, or `None` past the widest
    /// physical address.
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) if addr >> MAX_PHYSICAL_BITS == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Rounds the address down to the start of its frame.
    #[inline]
    pub const fn frame_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

impl_address_common!(
    VirtualAddress,
    "A canonical virtual memory address.\n\n\
     Bits 48-63 always replicate bit 47. The four page-table indices of the\n\
     address are available through [`VirtualAddress::table_index`]."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(is_canonical(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a virtual address by sign-extending bit 47, discarding whatever
    /// bits 48-63 held.
    #[inline]
    pub const fn new_truncate(addr: usize) -> Self {
        Self(canonicalize(addr))
    }

    /// Builds the canonical address selected by the four table indices and a
    /// byte offset.
    ///
    /// # Panics
    ///
    /// Panics if an index is outside `0..512` or the offset is not below 4096.
    pub const fn from_table_indices(
        top: usize,
        second: usize,
        third: usize,
        leaf: usize,
        offset: usize,
    ) -> Self {
        assert!(
            top < ENTRIES_PER_TABLE
                && second < ENTRIES_PER_TABLE
                && third < ENTRIES_PER_TABLE
                && leaf < ENTRIES_PER_TABLE,
            "table index out of range"
        );
        assert!(offset < PAGE_SIZE, "page offset out of range");
        Self::new_truncate(
            (top << PageTableLevel::Top.shift())
                | (second << PageTableLevel::Second.shift())
                | (third << PageTableLevel::Third.shift())
                | (leaf << PageTableLevel::Leaf.shift())
                | offset,
        )
    }

    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as usize)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the index into the table at `level` used to translate this address.
    ///
    /// Bits 39-47 select the top-level entry, 30-38 the second, 21-29 the third and
    /// 12-20 the leaf.
    #[inline]
    pub const fn table_index(self, level: PageTableLevel) -> usize {
        (self.0 >> level.shift()) & (ENTRIES_PER_TABLE - 1)
    }

    /// Rounds the address down to the start of its 4 KiB page.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Returns true if the address lies in the upper (kernel) half.
    #[inline]
    pub const fn is_higher_half(self) -> bool {
        self.0 & SIGN_EXTENSION != 0
    }

    /// Returns the address `bytes` further on, or `None` when that would leave the
    /// canonical half the address started in.
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) if is_canonical(addr) && (addr ^ self.0) & SIGN_EXTENSION == 0 => {
                Some(Self(addr))
            }
            _ => None,
        }
    }
}
