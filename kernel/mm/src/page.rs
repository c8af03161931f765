//! 32-bit page directory / page table entry encodings.
//!
//! Both levels share the same layout: bits 12..32 hold the frame number,
//! bits 0..12 the flags. Only `PRESENT`, `WRITABLE`, and `USER` are
//! tracked; the remaining architectural bits are preserved but unused.

use muon_core::addr::{PhysAddr, VirtAddr};

/// Entries per page directory / page table.
pub const ENTRIES: usize = 1024;

/// Mask selecting the frame address in an entry.
const FRAME_MASK: u32 = 0xFFFF_F000;

/// First page-directory index of the kernel half (`0xC000_0000 >> 22`).
pub const KERNEL_PDE_START: usize = 768;

bitflags::bitflags! {
    /// Page directory / table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Entry is present.
        const PRESENT  = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from ring 3.
        const USER     = 1 << 2;
    }
}

/// A raw page directory or page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    /// An absent entry.
    pub const EMPTY: Entry = Entry(0);

    /// Encodes `frame | flags`.
    #[must_use]
    pub const fn new(frame: PhysAddr, flags: PageFlags) -> Self {
        Self((frame.as_u32() & FRAME_MASK) | flags.bits())
    }

    /// Reconstructs an entry from its raw encoding.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit encoding.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` if the present bit is set.
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Returns the referenced frame address.
    #[must_use]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    /// Returns the flag bits.
    #[must_use]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }
}

/// Page-directory index of a virtual address (bits 22..32).
#[must_use]
pub const fn dir_index(virt: VirtAddr) -> usize {
    (virt.as_u32() >> 22) as usize & (ENTRIES - 1)
}

/// Page-table index of a virtual address (bits 12..22).
#[must_use]
pub const fn table_index(virt: VirtAddr) -> usize {
    (virt.as_u32() >> 12) as usize & (ENTRIES - 1)
}

/// Reduces mapping flags to the subset a page-directory entry carries.
///
/// A PDE must be at least as permissive as the PTEs below it, so the
/// `{WRITABLE, USER}` bits implied by the mapping are propagated along
/// with `PRESENT`.
#[must_use]
pub fn pde_flags_for(flags: PageFlags) -> PageFlags {
    PageFlags::PRESENT | (flags & (PageFlags::WRITABLE | PageFlags::USER))
}
